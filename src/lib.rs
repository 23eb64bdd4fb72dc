//! Process wiring for the taskq binaries, reusable by embedders that
//! want the same composition inside their own process.

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::ShutdownManager;
