//! Transport runtimes and the lifecycle manager driving them.
//!
//! Each enabled transport runs on its own worker thread with a private
//! register map; the only shared state is the shutdown signal.

pub mod lifecycle;
pub mod rtu;
pub mod shutdown;
pub mod tcp;

use std::time::Duration;

/// Delay before retrying a failed listener or serial setup.
pub const RESTART_DELAY: Duration = Duration::from_secs(2);

pub use lifecycle::{ModbusServer, DEFAULT_JOIN_TIMEOUT};
pub use rtu::{PollOutcome, RtuRuntime, RtuSession, SerialLink};
pub use shutdown::{shutdown_channel, ShutdownToken, ShutdownTrigger};
pub use tcp::{bind_listener, TcpRuntime};
