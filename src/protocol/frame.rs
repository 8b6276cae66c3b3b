//! Transport framing: query extraction and reply encoding for Modbus/TCP
//! and Modbus RTU.
//!
//! The dispatcher only ever sees a [`DecodedQuery`] and produces a PDU;
//! everything that depends on the transport (MBAP header, slave address
//! byte, CRC trailer) lives here.

use super::ExceptionCode;

/// MBAP header: transaction id (2), protocol id (2), length (2), unit id (1).
pub const MBAP_HEADER_LEN: usize = 7;
/// Largest Modbus/TCP ADU: MBAP header plus a 253-byte PDU.
pub const TCP_MAX_ADU_LEN: usize = 260;
/// Largest Modbus RTU ADU: address, 253-byte PDU and CRC.
pub const RTU_MAX_ADU_LEN: usize = 256;

const TCP_MIN_QUERY_LEN: usize = 12;
const RTU_MIN_QUERY_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Rtu,
}

impl TransportKind {
    /// Bytes preceding the function code in a query.
    pub const fn header_len(self) -> usize {
        match self {
            TransportKind::Tcp => MBAP_HEADER_LEN,
            TransportKind::Rtu => 1,
        }
    }

    /// Shortest frame accepted as a query.
    pub const fn min_query_len(self) -> usize {
        match self {
            TransportKind::Tcp => TCP_MIN_QUERY_LEN,
            TransportKind::Rtu => RTU_MIN_QUERY_LEN,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Rtu => write!(f, "RTU"),
        }
    }
}

/// A raw query as received by a transport runtime.
///
/// For TCP `frame` is the whole ADU, for RTU it is the ADU without the CRC
/// trailer (the runtime verifies and strips it).
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub frame: &'a [u8],
    pub transport: TransportKind,
}

impl<'a> Request<'a> {
    pub fn new(frame: &'a [u8], transport: TransportKind) -> Self {
        Self { frame, transport }
    }

    /// Function code byte, if the frame is long enough to carry one.
    pub fn function_code(&self) -> Option<u8> {
        self.frame.get(self.transport.header_len()).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedQuery {
    pub function_code: u8,
    pub address: u16,
    pub count_or_value: u16,
}

/// Extract function code, address and count/value from a query.
///
/// Frames below the transport minimum, or too short to hold the
/// count/value field, are reported as `IllegalFunction`.
pub fn decode(request: &Request<'_>) -> Result<DecodedQuery, ExceptionCode> {
    let frame = request.frame;
    if frame.len() < request.transport.min_query_len() {
        log::warn!(
            "Wrong query length ({}) for {} command",
            frame.len(),
            request.transport
        );
        return Err(ExceptionCode::IllegalFunction);
    }

    let offset = request.transport.header_len();
    let Some(fields) = frame.get(offset..offset + 5) else {
        log::warn!(
            "Truncated {} query: {} bytes, fields end at {}",
            request.transport,
            frame.len(),
            offset + 5
        );
        return Err(ExceptionCode::IllegalFunction);
    };

    Ok(DecodedQuery {
        function_code: fields[0],
        address: u16::from_be_bytes([fields[1], fields[2]]),
        count_or_value: u16::from_be_bytes([fields[3], fields[4]]),
    })
}

/// `[function | 0x80, code]`
pub fn exception_pdu(function_code: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function_code | 0x80, code.into()]
}

/// Parsed MBAP header of an incoming Modbus/TCP ADU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(buf: &[u8; MBAP_HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        }
    }

    /// PDU bytes following the header, or `None` when the length field
    /// cannot describe a request (it must cover the unit id and a function
    /// code and stay within the maximum ADU).
    pub fn pdu_len(&self) -> Option<usize> {
        let length = usize::from(self.length);
        if !(2..=TCP_MAX_ADU_LEN - MBAP_HEADER_LEN + 1).contains(&length) {
            return None;
        }
        Some(length - 1)
    }
}

/// Wrap a reply PDU in an MBAP header echoing the request's identifiers.
pub fn encode_tcp_reply(request: &MbapHeader, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&request.transaction_id.to_be_bytes());
    adu.extend_from_slice(&request.protocol_id.to_be_bytes());
    adu.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    adu.push(request.unit_id);
    adu.extend_from_slice(pdu);
    adu
}

/// Prefix the slave address and append the CRC, low byte first.
pub fn encode_rtu_reply(slave: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() + 3);
    adu.push(slave);
    adu.extend_from_slice(pdu);
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    adu
}

/// Split a received RTU ADU into its body and verify the trailing CRC.
///
/// Returns the body (address + PDU) on success.
pub fn strip_rtu_crc(adu: &[u8]) -> Result<&[u8], RtuFrameError> {
    if adu.len() < 4 {
        return Err(RtuFrameError::TooShort(adu.len()));
    }
    let (body, trailer) = adu.split_at(adu.len() - 2);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    let actual = crc16(body);
    if expected != actual {
        return Err(RtuFrameError::Crc { expected, actual });
    }
    Ok(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuFrameError {
    TooShort(usize),
    Crc { expected: u16, actual: u16 },
}

impl std::fmt::Display for RtuFrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RtuFrameError::TooShort(len) => write!(f, "frame too short ({len} bytes)"),
            RtuFrameError::Crc { expected, actual } => {
                write!(f, "CRC mismatch: frame 0x{expected:04X}, computed 0x{actual:04X}")
            }
        }
    }
}

impl std::error::Error for RtuFrameError {}

/// Expected total length of an RTU request ADU (CRC included), when it can
/// be told from the bytes seen so far.
///
/// `None` means either more bytes are needed or the function code has no
/// fixed layout; the caller then relies on line silence.
pub fn rtu_request_len(adu: &[u8]) -> Option<usize> {
    match *adu.get(1)? {
        0x01..=0x06 => Some(8),
        0x0F | 0x10 => adu.get(6).map(|byte_count| 9 + usize::from(*byte_count)),
        _ => None,
    }
}

/// CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_tcp_skips_mbap_header() {
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x10, 0x00, 0x02];
        let query = decode(&Request::new(&frame, TransportKind::Tcp)).unwrap();
        assert_eq!(
            query,
            DecodedQuery {
                function_code: 0x03,
                address: 0x0010,
                count_or_value: 0x0002,
            }
        );
    }

    #[test]
    fn decode_rtu_skips_slave_address() {
        let frame = [0x11, 0x06, 0x12, 0x34, 0xAB, 0xCD];
        let query = decode(&Request::new(&frame, TransportKind::Rtu)).unwrap();
        assert_eq!(query.function_code, 0x06);
        assert_eq!(query.address, 0x1234);
        assert_eq!(query.count_or_value, 0xABCD);
    }

    #[test]
    fn short_frames_are_illegal_function() {
        let tcp = [0u8; 11];
        assert_eq!(
            decode(&Request::new(&tcp, TransportKind::Tcp)),
            Err(ExceptionCode::IllegalFunction)
        );
        let rtu = [0x01, 0x03, 0x00, 0x00];
        assert_eq!(
            decode(&Request::new(&rtu, TransportKind::Rtu)),
            Err(ExceptionCode::IllegalFunction)
        );
        // passes the minimum but stops inside the count field
        let rtu = [0x01, 0x03, 0x00, 0x00, 0x00];
        assert_eq!(
            decode(&Request::new(&rtu, TransportKind::Rtu)),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn crc_matches_reference_frames() {
        // read holding registers, slave 1, address 0x082B, count 2
        assert_eq!(crc16(&[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02]).to_le_bytes(), [0xB6, 0x63]);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).to_le_bytes(), [0x84, 0x0A]);
    }

    #[test]
    fn rtu_reply_round_trips_through_crc_check() {
        let adu = encode_rtu_reply(0x07, &[0x03, 0x02, 0x12, 0x34]);
        assert_eq!(&adu[..5], &[0x07, 0x03, 0x02, 0x12, 0x34]);
        assert_eq!(strip_rtu_crc(&adu), Ok(&adu[..5]));

        let mut corrupted = adu.clone();
        corrupted[3] ^= 0xFF;
        assert!(matches!(
            strip_rtu_crc(&corrupted),
            Err(RtuFrameError::Crc { .. })
        ));
    }

    #[test]
    fn tcp_reply_echoes_identifiers() {
        let header = MbapHeader::parse(&[0xBE, 0xEF, 0x00, 0x00, 0x00, 0x06, 0x11]);
        let adu = encode_tcp_reply(
            &header,
            &exception_pdu(0x03, ExceptionCode::IllegalDataAddress),
        );
        assert_eq!(adu, vec![0xBE, 0xEF, 0x00, 0x00, 0x00, 0x03, 0x11, 0x83, 0x02]);
    }

    #[test]
    fn mbap_length_bounds() {
        let header = |length: u16| MbapHeader {
            transaction_id: 1,
            protocol_id: 0,
            length,
            unit_id: 1,
        };
        assert_eq!(header(0).pdu_len(), None);
        assert_eq!(header(1).pdu_len(), None);
        assert_eq!(header(2).pdu_len(), Some(1));
        assert_eq!(header(6).pdu_len(), Some(5));
        assert_eq!(header(254).pdu_len(), Some(253));
        assert_eq!(header(255).pdu_len(), None);
    }

    #[test]
    fn rtu_request_length_guessing() {
        assert_eq!(rtu_request_len(&[0x01]), None);
        assert_eq!(rtu_request_len(&[0x01, 0x03]), Some(8));
        assert_eq!(rtu_request_len(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02]), None);
        assert_eq!(
            rtu_request_len(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04]),
            Some(13)
        );
        assert_eq!(rtu_request_len(&[0x01, 0x2B]), None);
    }
}
