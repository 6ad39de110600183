//! Typed message passing between the master and its workers.
//!
//! Both sides speak length-prefixed JSON [`IpcMessage`] frames over a Unix
//! socket pair created by the master for every worker it forks.

pub mod master;
pub mod message;
pub mod registry;
pub mod worker;

pub use master::{InboundMessage, MasterChannel, Responder};
pub use message::{IpcMessage, MessageKind};
pub use registry::{bind, validate_method_name, MethodFn, MethodList, MethodRegistry};
pub use worker::WorkerChannel;

/// Environment variable naming the inherited pipe descriptor in workers.
pub const IPC_FD_ENV: &str = "ARTISAN_IPC_FD";

/// Descriptor number the pipe is installed at in every worker.
pub const IPC_FD: i32 = 3;

/// Broadcast sent to workers for graceful shutdown and reboot.
pub const SHUTDOWN_METHOD: &str = "shutdown";
