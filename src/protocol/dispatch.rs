use super::{
    frame::{decode, exception_pdu, DecodedQuery, Request},
    BitBank, ExceptionCode, FunctionCode, RegisterMap, WordBank,
};

/// Largest quantity of coils a single read may ask for.
pub const MAX_READ_BITS: u16 = 2000;
/// Largest quantity of registers a single read may ask for.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Decode a raw query and execute it against the register map.
///
/// Returns the reply PDU, or the exception the transport has to send
/// back instead. `registers` is `None` when the runtime could not
/// allocate its map.
pub fn process_request(
    request: &Request<'_>,
    registers: Option<&mut RegisterMap>,
) -> Result<Vec<u8>, ExceptionCode> {
    let Some(registers) = registers else {
        return Err(ExceptionCode::SlaveOrServerFailure);
    };

    let query = decode(request)?;
    log::trace!(
        "{} l={} QRY: {:02X} {:04X} {:04X}",
        request.transport,
        request.frame.len(),
        query.function_code,
        query.address,
        query.count_or_value
    );

    dispatch(&query, registers)
}

/// Like [`process_request`], with any exception folded into its reply PDU.
pub fn respond(request: &Request<'_>, registers: Option<&mut RegisterMap>) -> Vec<u8> {
    process_request(request, registers).unwrap_or_else(|code| {
        let function_code = request.function_code().unwrap_or_default();
        log::warn!(
            "{} exception reply for function 0x{function_code:02X}: {code} ({})",
            request.transport,
            u8::from(code)
        );
        exception_pdu(function_code, code)
    })
}

/// Execute one decoded query. Transport-agnostic.
pub fn dispatch(
    query: &DecodedQuery,
    registers: &mut RegisterMap,
) -> Result<Vec<u8>, ExceptionCode> {
    let function = FunctionCode::try_from(query.function_code).map_err(|_| {
        log::warn!("Unsupported modbus command: {:02X}", query.function_code);
        ExceptionCode::IllegalFunction
    })?;

    match function {
        FunctionCode::ReadCoils => {
            let count = query.count_or_value;
            let bits = registers
                .read_bits(BitBank::Coils, query.address, count)
                .inspect_err(|_| out_of_bounds(query))?;
            check_quantity(count, MAX_READ_BITS)?;

            let packed = pack_bits(bits);
            let mut pdu = Vec::with_capacity(2 + packed.len());
            pdu.push(function.into());
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
            Ok(pdu)
        }
        FunctionCode::ReadHoldingRegisters => {
            let count = query.count_or_value;
            let words = registers
                .read_words(WordBank::Holding, query.address, count)
                .inspect_err(|_| out_of_bounds(query))?;
            check_quantity(count, MAX_READ_REGISTERS)?;

            let mut pdu = Vec::with_capacity(2 + words.len() * 2);
            pdu.push(function.into());
            pdu.push((words.len() * 2) as u8);
            for word in words {
                pdu.extend_from_slice(&word.to_be_bytes());
            }
            Ok(pdu)
        }
        FunctionCode::WriteSingleRegister => {
            registers
                .write_word(WordBank::Holding, query.address, query.count_or_value)
                .inspect_err(|_| out_of_bounds(query))?;

            let mut pdu = Vec::with_capacity(5);
            pdu.push(function.into());
            pdu.extend_from_slice(&query.address.to_be_bytes());
            pdu.extend_from_slice(&query.count_or_value.to_be_bytes());
            Ok(pdu)
        }
    }
}

fn check_quantity(count: u16, max: u16) -> Result<(), ExceptionCode> {
    if count == 0 || count > max {
        log::warn!("Illegal quantity {count} (allowed 1..={max})");
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

fn out_of_bounds(query: &DecodedQuery) {
    log::warn!(
        "Out of regs bound: 0x{:04X} + 0x{:04X}",
        query.address,
        query.count_or_value
    );
}

/// First value goes to bit 0 of the first byte.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, bit)| if *bit { acc | (1 << i) } else { acc })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::TransportKind;

    fn query(function_code: u8, address: u16, count_or_value: u16) -> DecodedQuery {
        DecodedQuery {
            function_code,
            address,
            count_or_value,
        }
    }

    #[test]
    fn read_holding_returns_register_values() {
        let mut map = RegisterMap::new();
        map.write_word(WordBank::Holding, 0x20, 0x1234).unwrap();
        map.write_word(WordBank::Holding, 0x21, 0xABCD).unwrap();

        let pdu = dispatch(&query(0x03, 0x20, 2), &mut map).unwrap();
        assert_eq!(pdu, vec![0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn read_coils_packs_lsb_first() {
        let mut map = RegisterMap::new();
        for address in [0u16, 2, 8, 9] {
            map.write_bit(BitBank::Coils, address, true).unwrap();
        }

        let pdu = dispatch(&query(0x01, 0, 10), &mut map).unwrap();
        assert_eq!(pdu, vec![0x01, 0x02, 0b0000_0101, 0b0000_0011]);
    }

    #[test]
    fn write_single_register_echoes_and_stores() {
        let mut map = RegisterMap::new();
        let pdu = dispatch(&query(0x06, 0x0010, 0x00FF), &mut map).unwrap();
        assert_eq!(pdu, vec![0x06, 0x00, 0x10, 0x00, 0xFF]);
        assert_eq!(map.read_words(WordBank::Holding, 0x10, 1).unwrap(), &[0x00FF]);

        dispatch(&query(0x06, 0xFFFF, 7), &mut map).unwrap();
        assert_eq!(map.read_words(WordBank::Holding, 0xFFFF, 1).unwrap(), &[7]);
    }

    #[test]
    fn crossing_the_address_space_is_illegal_address() {
        let mut map = RegisterMap::new();
        assert_eq!(
            dispatch(&query(0x03, 0xFFF0, 0x0020), &mut map),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            dispatch(&query(0x01, 0xFFFF, 2), &mut map),
            Err(ExceptionCode::IllegalDataAddress)
        );
        // quantity is also out of range, the address check wins
        assert_eq!(
            dispatch(&query(0x03, 0xFF00, 0x0200), &mut map),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn quantity_limits_are_illegal_value() {
        let mut map = RegisterMap::new();
        assert_eq!(
            dispatch(&query(0x03, 0, 0), &mut map),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            dispatch(&query(0x03, 0, MAX_READ_REGISTERS + 1), &mut map),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            dispatch(&query(0x01, 0, MAX_READ_BITS + 1), &mut map),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert!(dispatch(&query(0x03, 0xFFFF - 124, MAX_READ_REGISTERS), &mut map).is_ok());
        assert!(dispatch(&query(0x01, 0, MAX_READ_BITS), &mut map).is_ok());
    }

    #[test]
    fn unsupported_functions_are_illegal_function() {
        let mut map = RegisterMap::new();
        for code in [0x00u8, 0x02, 0x04, 0x05, 0x0F, 0x10, 0x17, 0x80] {
            assert_eq!(
                dispatch(&query(code, 0, 1), &mut map),
                Err(ExceptionCode::IllegalFunction),
                "function 0x{code:02X}"
            );
        }
    }

    #[test]
    fn missing_register_map_is_server_failure() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            process_request(&Request::new(&frame, TransportKind::Rtu), None),
            Err(ExceptionCode::SlaveOrServerFailure)
        );
    }

    #[test]
    fn short_frame_never_touches_registers() {
        let mut map = RegisterMap::new();
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x06, 0x00, 0x00];
        assert_eq!(
            process_request(&Request::new(&frame, TransportKind::Tcp), Some(&mut map)),
            Err(ExceptionCode::IllegalFunction)
        );
        assert_eq!(map.read_words(WordBank::Holding, 0, 1).unwrap(), &[0]);
    }

    #[test]
    fn respond_folds_exceptions_into_the_pdu() {
        let mut map = RegisterMap::new();
        let frame = [0x01, 0x03, 0xFF, 0xF0, 0x00, 0x20];
        let pdu = respond(&Request::new(&frame, TransportKind::Rtu), Some(&mut map));
        assert_eq!(pdu, vec![0x83, 0x02]);

        let frame = [0x01, 0x2B, 0x00, 0x00, 0x00, 0x01];
        let pdu = respond(&Request::new(&frame, TransportKind::Rtu), Some(&mut map));
        assert_eq!(pdu, vec![0xAB, 0x01]);

        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let pdu = respond(&Request::new(&frame, TransportKind::Rtu), None);
        assert_eq!(pdu, vec![0x83, 0x04]);
    }

    #[test]
    fn process_request_runs_tcp_scenario() {
        let mut map = RegisterMap::new();
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let pdu =
            process_request(&Request::new(&frame, TransportKind::Tcp), Some(&mut map)).unwrap();
        assert_eq!(pdu, vec![0x03, 0x02, 0x00, 0x00]);
    }
}
