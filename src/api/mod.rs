pub mod config;
pub mod utils;

// Re-export the configuration surface
pub use config::{RtuConfig, ServerConfig, TcpConfig};

// Re-export the server handle and the protocol types callers deal with
pub use crate::core::{ModbusServer, DEFAULT_JOIN_TIMEOUT};
pub use crate::protocol::{ExceptionCode, FunctionCode, RegisterMap};
