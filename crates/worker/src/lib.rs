//! Handler registration and the worker dispatch loop.

pub mod context;
pub mod handlers;
pub mod registry;
pub mod service;

pub use context::WorkerContext;
pub use handlers::EchoHandler;
pub use registry::{HandlerRegistry, LifecycleHook, TaskHandler};
pub use service::{DispatchOptions, WorkerService};
