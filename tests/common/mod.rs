#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::TcpStream,
    thread,
    time::Duration,
};

use anyhow::{anyhow, Result};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};

use modbus_tester::{ModbusServer, RtuConfig, TcpConfig};

/// Start a TCP-only server on loopback.
pub fn start_tcp(port: u16) -> ModbusServer {
    let mut server = ModbusServer::new().with_join_timeout(Duration::from_secs(5));
    server
        .start(TcpConfig::listen("127.0.0.1", port), RtuConfig::default())
        .unwrap();
    server
}

/// Connect, retrying while the worker is still binding.
pub fn connect(port: u16) -> TcpStream {
    for _ in 0..150 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("no server on port {port}");
}

/// Send one request and read back the whole response ADU.
pub fn transact(stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>> {
    stream.write_all(request)?;
    let mut response = vec![0u8; 6];
    stream.read_exact(&mut response)?;
    let len = guess_response_frame_len(&response, ModbusProto::TcpUdp)
        .map_err(|err| anyhow!("bad response header: {err:?}"))? as usize;
    response.resize(len, 0);
    stream.read_exact(&mut response[6..])?;
    Ok(response)
}

pub fn read_holdings(stream: &mut TcpStream, address: u16, count: u16) -> Result<Vec<u16>> {
    let mut request = ModbusRequest::new(1, ModbusProto::TcpUdp);
    let mut raw = Vec::new();
    request
        .generate_get_holdings(address, count, &mut raw)
        .map_err(|err| anyhow!("{err:?}"))?;
    let response = transact(stream, &raw)?;
    let mut values = Vec::new();
    request
        .parse_u16(&response, &mut values)
        .map_err(|err| anyhow!("{err:?}"))?;
    Ok(values)
}

pub fn write_holding(stream: &mut TcpStream, address: u16, value: u16) -> Result<()> {
    let mut request = ModbusRequest::new(1, ModbusProto::TcpUdp);
    let mut raw = Vec::new();
    request
        .generate_set_holding(address, value, &mut raw)
        .map_err(|err| anyhow!("{err:?}"))?;
    let response = transact(stream, &raw)?;
    request.parse_ok(&response).map_err(|err| anyhow!("{err:?}"))
}
