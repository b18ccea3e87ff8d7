//! # uacore - address space and dispatch core of an OPC UA server
//!
//! uacore holds the parts of a server that sit between the session layer and
//! the data: a master node manager that routes batched service requests to
//! pluggable node managers, an in-memory node graph with modelling rules,
//! sampling groups for monitored items, event delivery, permission checks
//! and browse continuation points.
//!
//! ## Core Concepts
//!
//! - **Node manager**: owns the nodes of one or more namespaces and claims
//!   the request items addressed to them
//! - **Master node manager**: validates requests, resolves owners, checks
//!   permissions and fans each batch out to every manager
//! - **Sampling group**: polls every item of one session at one revised
//!   interval
//! - **Continuation point**: the rest of a browse result, kept per session
//!
//! ## Usage
//!
//! ```rust,ignore
//! use uacore::{MasterNodeManager, OperationContext, ServerConfig, ServiceItem};
//! use uacore::service::ReadValueId;
//! use uacore::value::TimestampsToReturn;
//! use uacore::node_id::ids;
//!
//! let master = MasterNodeManager::with_defaults(ServerConfig::default())?;
//! master.startup()?;
//!
//! let ctx = OperationContext::system();
//! let mut items = vec![ServiceItem::new(ReadValueId::value(ids::SERVER))];
//! master.read(&ctx, TimestampsToReturn::Both, &mut items)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Value and identity types
pub mod node_id;
pub mod status;
pub mod value;

// Nodes and the address space
pub mod address_space;
pub mod node;

// Services
pub mod browse;
pub mod continuation;
pub mod security;
pub mod service;
pub mod session;

// Managers, dispatch and subscriptions
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod subscription;

pub use address_space::{NodeGraph, TypeTree};
pub use config::ServerConfig;
pub use dispatch::{DispatchSnapshot, MasterNodeManager};
pub use error::{ConfigError, GraphError, ServiceError, ServiceResult};
pub use manager::{InMemoryNodeManager, ManagerContext, ManagerId, NodeHandle, NodeManager};
pub use node::{AttributeId, Node, NodeClass, Reference};
pub use node_id::{ExpandedNodeId, LocalizedText, NodeId, QualifiedName};
pub use security::{OperationType, PermissionValidator};
pub use service::ServiceItem;
pub use session::{OperationContext, Session, SessionId};
pub use status::StatusCode;
pub use value::{DataValue, Variant};
