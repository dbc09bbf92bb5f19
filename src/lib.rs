// Percolator - incremental recomputation over a document store

pub mod address;
pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod operation;
pub mod percolation;
pub mod propagation;
pub mod registry;
pub mod store;

pub use address::{Address, AddressError, Diff};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{PercolatorError, Result};
pub use node::{Node, NodeId, NodeSpec};
pub use operation::{
    ComputeContext, Operation, OperationId, OperationSpec, OperationState, ParentSet,
};
pub use percolation::{InterruptHandle, Percolator, Summary};
pub use propagation::{PropagateOptions, PropagationReport};
pub use registry::Registry;
pub use store::{DocumentStore, FileStore, Filter, MemoryStore, Update};
