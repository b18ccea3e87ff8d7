//! In-memory address space primitives.
//!
//! - [`graph`]: the per-manager node arena and its mutation algorithms.
//! - [`modelling`]: type instantiation by modelling rules.
//! - [`type_tree`]: the shared subtype index.

pub mod graph;
pub mod modelling;
pub mod type_tree;

pub use graph::{DeletionOutcome, ExternalReference, NodeGraph};
pub use modelling::{apply_modelling_rules, InstanceTemplate, ModellingOutcome};
pub use type_tree::TypeTree;
