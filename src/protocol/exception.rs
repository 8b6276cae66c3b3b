use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Modbus exception codes returned in place of a normal reply.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionCode {
    #[display("illegal function")]
    IllegalFunction = 0x01,
    #[display("illegal data address")]
    IllegalDataAddress = 0x02,
    #[display("illegal data value")]
    IllegalDataValue = 0x03,
    #[display("slave or server failure")]
    SlaveOrServerFailure = 0x04,
}

impl std::error::Error for ExceptionCode {}

/// Function codes the dispatcher understands.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    #[display("read coils")]
    ReadCoils = 0x01,
    #[display("read holding registers")]
    ReadHoldingRegisters = 0x03,
    #[display("write single register")]
    WriteSingleRegister = 0x06,
}
