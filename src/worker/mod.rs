//! # Workers
//!
//! Handler contract, the queue-to-handler registry, and the pools that
//! consume a queue on behalf of a handler.

pub mod handler;
pub mod pool;
pub mod registry;

pub use handler::{handler_fn, typed_handler, HandlerError, SharedHandler, TaskHandler};
pub use pool::WorkerPool;
pub use registry::HandlerRegistry;
