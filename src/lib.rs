//! Reactive node-graph engine: nodes hold typed data bags, edges carry
//! values downstream, and an orchestrator task per node keeps a derived
//! activation flag consistent across the graph.
//!
//! Activation means "this node currently has meaningful output". It is
//! recomputed from a node's own data and its upstream snapshot on every
//! relevant change, and propagated through two layers: an instant visual
//! side-table for rendering, and the authoritative data patch that blocks
//! data flow out of inactive nodes.

pub mod activation;
pub mod change;
pub mod clock;
pub mod config;
pub mod data;
pub mod delay;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logger;
pub mod propagate;
mod runtime;
pub mod store;
pub mod value;

pub use change::EdgeMode;
pub use config::EngineSettings;
pub use data::{KindData, NodeData, OutputMode, TransformOp};
pub use engine::Engine;
pub use error::{EngineError, NodeError};
pub use graph::{Connection, GraphDocument, Handle, Node};
pub use store::StoreEvent;
