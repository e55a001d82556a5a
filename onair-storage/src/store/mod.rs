//! Store access: the backend seam, its in-memory implementation and the
//! client that executes plans against it.

pub mod backend;
pub mod client;
pub mod context;
pub mod memory;

pub use backend::{BatchWriteOutput, PutCondition, StoreBackend, StoreOutput};
pub use client::StoreClient;
pub use context::{CallContext, CancellationToken};
pub use memory::{CallCounts, InMemoryStore};
