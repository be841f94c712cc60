//! Host side of an out-of-process build service.
//!
//! A long-running host talks to one persistent worker subprocess over the
//! worker's stdin/stdout. Requests and responses are length-framed binary
//! packets, and many calls share the one pipe pair.
//!
//! - [`protocol`] - ByteBuffer, value schema, packet and frame codecs
//! - [`service`] - worker supervision, multiplexing and the [`Service`] facade
//! - [`worker`] - the worker side, for implementing workers in Rust
//! - [`config`] - TOML configuration

pub mod config;
pub mod error;
pub mod protocol;
pub mod service;
pub mod worker;

pub use config::{ServiceConfig, WorkerCommand, load_config};
pub use error::{ServiceError, ServiceResult};
pub use protocol::Value;
pub use service::{RequestHandler, Service, ServiceManager, WorkerProcess};
