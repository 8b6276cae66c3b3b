//! modbus-tester: a Modbus slave emulator for exercising Modbus masters.
//!
//! One process serves Modbus/TCP clients and a Modbus RTU serial line at
//! the same time, each transport backed by its own zero-initialised
//! register map. [`ModbusServer`] owns the workers; the remaining modules
//! hold the building blocks and are hidden from the generated
//! documentation.

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
#[doc(hidden)]
pub mod core;
#[doc(hidden)]
pub mod protocol;

pub use api::*;
