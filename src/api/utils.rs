use anyhow::{anyhow, Result};
use std::time::Duration;

/// Open a serial port 8N1 with the requested read timeout, enabling exclusive access on Unix.
pub fn open_serial_port(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>> {
    let builder = serialport::new(port, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout);

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_reports_its_path() {
        let timeout = Duration::from_millis(100);
        let err = open_serial_port("/nonexistent/modbus-tester-tty", 9600, timeout)
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/modbus-tester-tty"));
    }
}
