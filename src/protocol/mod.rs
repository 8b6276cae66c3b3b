//! Modbus request engine shared by both transports: register banks,
//! framing and the function dispatcher.

pub mod dispatch;
pub mod exception;
pub mod frame;
pub mod registers;

pub use dispatch::{dispatch, process_request, respond};
pub use exception::{ExceptionCode, FunctionCode};
pub use frame::{decode, DecodedQuery, Request, TransportKind};
pub use registers::{BitBank, RegisterMap, WordBank, REGISTER_SPACE};
