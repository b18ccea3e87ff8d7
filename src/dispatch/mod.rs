//! The dispatcher: namespace routing, fan-out of batched services and the
//! deferred cleanup of references that dangle across managers.

pub mod cleanup;
pub mod master;
pub(crate) mod registry;

pub use cleanup::CleanupSender;
pub use master::{DispatchSnapshot, DispatchStats, MasterNodeManager};
