use std::{
    io::{self, Read, Write},
    time::Duration,
};

use super::{shutdown::ShutdownToken, RESTART_DELAY};
use crate::{
    api::{config::RtuConfig, utils::open_serial_port},
    protocol::{
        frame::{encode_rtu_reply, rtu_request_len, strip_rtu_crc, RTU_MAX_ADU_LEN},
        respond, RegisterMap, Request, TransportKind,
    },
};

/// Read timeout of one serial poll; a silent poll counts as "no frame yet".
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause after each reply before the line is polled again.
pub const SEND_DELAY: Duration = Duration::from_millis(50);
/// Highest unicast slave address on a Modbus serial line.
pub const MAX_SLAVE_ADDRESS: u8 = 247;

/// Byte link carrying RTU frames.
pub trait SerialLink: Read + Write + Send {
    /// Discard anything buffered on the receive side.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input).map_err(io::Error::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The line stayed silent for a whole poll.
    Idle,
    /// Frame failed the CRC check.
    Dropped,
    /// Frame addressed to another slave.
    Ignored,
    /// A reply of this many bytes was written.
    Replied(usize),
}

/// Frame-level RTU slave over one open link.
pub struct RtuSession<L> {
    link: L,
    slave: u8,
}

impl<L: SerialLink> RtuSession<L> {
    pub fn new(link: L, slave: u8) -> Self {
        Self { link, slave }
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    /// Receive at most one frame and answer it when it is ours.
    ///
    /// Only link failures surface as errors; bad frames are reported
    /// through the outcome.
    pub fn poll(&mut self, registers: Option<&mut RegisterMap>) -> io::Result<PollOutcome> {
        let Some(adu) = self.receive()? else {
            return Ok(PollOutcome::Idle);
        };

        let body = match strip_rtu_crc(&adu) {
            Ok(body) => body,
            Err(err) => {
                log::warn!("Dropping RTU frame of {} bytes: {err}", adu.len());
                return Ok(PollOutcome::Dropped);
            }
        };

        if body.first() != Some(&self.slave) {
            log::trace!(
                "RTU frame for slave {:?} ignored (we are {})",
                body.first(),
                self.slave
            );
            return Ok(PollOutcome::Ignored);
        }

        let pdu = respond(&Request::new(body, TransportKind::Rtu), registers);
        let reply = encode_rtu_reply(self.slave, &pdu);
        self.link.write_all(&reply)?;
        self.link.flush()?;
        Ok(PollOutcome::Replied(reply.len()))
    }

    /// Collect one ADU: stop at the length implied by the function code, at
    /// the maximum ADU size, or when the line goes silent.
    fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut adu = Vec::with_capacity(RTU_MAX_ADU_LEN);
        let mut chunk = [0u8; RTU_MAX_ADU_LEN];

        while adu.len() < RTU_MAX_ADU_LEN {
            match self.link.read(&mut chunk[..RTU_MAX_ADU_LEN - adu.len()]) {
                Ok(0) => break,
                Ok(read) => {
                    adu.extend_from_slice(&chunk[..read]);
                    if let Some(expected) = rtu_request_len(&adu) {
                        if adu.len() >= expected {
                            adu.truncate(expected);
                            break;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = self.link.clear_input();
                    return Err(err);
                }
            }
        }

        if adu.is_empty() {
            return Ok(None);
        }
        self.link.clear_input()?;
        Ok(Some(adu))
    }
}

/// Modbus RTU slave on a serial device, reconnecting after link failures.
pub struct RtuRuntime {
    config: RtuConfig,
    shutdown: ShutdownToken,
    registers: Option<RegisterMap>,
}

impl RtuRuntime {
    pub fn new(config: RtuConfig, shutdown: ShutdownToken) -> Self {
        let registers = RegisterMap::try_new()
            .map_err(|err| log::error!("RTU register map allocation failed: {err}"))
            .ok();
        Self {
            config,
            shutdown,
            registers,
        }
    }

    /// Blocking worker loop; returns once the shutdown token fires.
    pub fn run(mut self) {
        log::info!(
            "RTU server started on {} (slave {})",
            self.config.device,
            self.config.slave_address
        );

        while !self.shutdown.is_cancelled() {
            let slave = self.config.slave_address;
            if !(1..=MAX_SLAVE_ADDRESS).contains(&slave) {
                log::error!(
                    "Invalid rtu address {slave}. Retry in {} seconds",
                    RESTART_DELAY.as_secs()
                );
                if self.shutdown.wait_timeout(RESTART_DELAY) {
                    break;
                }
                continue;
            }

            let opened =
                open_serial_port(&self.config.device, self.config.baud_rate, POLL_TIMEOUT);
            let port = match opened {
                Ok(port) => port,
                Err(err) => {
                    log::error!("{err}. Retry in {} seconds", RESTART_DELAY.as_secs());
                    if self.shutdown.wait_timeout(RESTART_DELAY) {
                        break;
                    }
                    continue;
                }
            };
            log::info!(
                "Opened {} at {} baud 8N1",
                self.config.device,
                self.config.baud_rate
            );

            if let Err(err) = self.serve(port) {
                log::error!(
                    "Serial link {} failed: {err}. Retry in {} seconds",
                    self.config.device,
                    RESTART_DELAY.as_secs()
                );
                if self.shutdown.wait_timeout(RESTART_DELAY) {
                    break;
                }
            }
        }

        log::info!("RTU server stopped");
    }

    /// Answer frames on `link` until shutdown or a link error.
    pub fn serve<L: SerialLink>(&mut self, link: L) -> io::Result<()> {
        let mut session = RtuSession::new(link, self.config.slave_address);
        while !self.shutdown.is_cancelled() {
            if let PollOutcome::Replied(len) = session.poll(self.registers.as_mut())? {
                log::trace!("RTU reply of {len} bytes sent");
                if self.shutdown.wait_timeout(SEND_DELAY) {
                    break;
                }
            }
        }
        Ok(())
    }
}
