//! Host side of the worker service.
//!
//! # Module Structure
//!
//! - `channel` - Channel: id allocation, pending table, inbound dispatch,
//!   answers to requests from the worker
//! - `keep_alive` - KeepAlive ref-counter over outstanding requests
//! - `supervisor` - WorkerProcess: spawn, handshake, I/O tasks, teardown
//! - `manager` - ServiceManager: at most one live worker, respawn on demand
//! - `facade` - Service: named operations passed straight to the worker

mod channel;
mod facade;
mod keep_alive;
mod manager;
mod supervisor;

pub use channel::{Channel, RequestFuture, RequestHandler};
pub use facade::Service;
pub use keep_alive::{KeepAlive, KeepAliveRef, ProcessRef, ReferenceFlag};
pub use manager::ServiceManager;
pub use supervisor::WorkerProcess;
