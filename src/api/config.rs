use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TCP_ADDRESS: &str = "*";
pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_RTU_DEVICE: &str = "/dev/ttyUSB0";
pub const DEFAULT_RTU_SLAVE_ADDRESS: u8 = 1;
pub const DEFAULT_RTU_BAUD_RATE: u32 = 9600;
pub const DEFAULT_ERROR_RATE: f32 = 0.0;
pub const DEFAULT_INIT_VALUE: u8 = 0x00;

/// Modbus/TCP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bind address; `*` listens on every IPv4 interface
    #[serde(default = "default_tcp_address")]
    pub address: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Error injection rate in percent. Accepted for compatibility, not applied.
    #[serde(default)]
    pub error_rate: f32,
    /// Initial register value. Accepted for compatibility, not applied.
    #[serde(default)]
    pub init_value: u8,
}

/// Modbus RTU slave configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtuConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Serial device path, e.g. `/dev/ttyUSB0`
    #[serde(default = "default_rtu_device")]
    pub device: String,
    #[serde(default = "default_rtu_slave_address")]
    pub slave_address: u8,
    #[serde(default = "default_rtu_baud_rate")]
    pub baud_rate: u32,
    /// Error injection rate in percent. Accepted for compatibility, not applied.
    #[serde(default)]
    pub error_rate: f32,
    /// Initial register value. Accepted for compatibility, not applied.
    #[serde(default)]
    pub init_value: u8,
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub rtu: RtuConfig,
}

fn default_tcp_address() -> String {
    DEFAULT_TCP_ADDRESS.to_string()
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_rtu_device() -> String {
    DEFAULT_RTU_DEVICE.to_string()
}

fn default_rtu_slave_address() -> u8 {
    DEFAULT_RTU_SLAVE_ADDRESS
}

fn default_rtu_baud_rate() -> u32 {
    DEFAULT_RTU_BAUD_RATE
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_tcp_address(),
            port: DEFAULT_TCP_PORT,
            error_rate: DEFAULT_ERROR_RATE,
            init_value: DEFAULT_INIT_VALUE,
        }
    }
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: default_rtu_device(),
            slave_address: DEFAULT_RTU_SLAVE_ADDRESS,
            baud_rate: DEFAULT_RTU_BAUD_RATE,
            error_rate: DEFAULT_ERROR_RATE,
            init_value: DEFAULT_INIT_VALUE,
        }
    }
}

impl TcpConfig {
    /// Enabled listener on `address:port`, other fields at their defaults.
    pub fn listen(address: impl Into<String>, port: u16) -> Self {
        Self {
            enabled: true,
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    /// Host part handed to the socket layer.
    pub fn bind_host(&self) -> &str {
        match self.address.trim() {
            "*" => "0.0.0.0",
            host => host,
        }
    }

    fn is_complete(&self) -> bool {
        !self.address.trim().is_empty() && self.port != 0
    }
}

impl RtuConfig {
    /// Enabled slave on `device`, other fields at their defaults.
    pub fn serial(device: impl Into<String>, slave_address: u8, baud_rate: u32) -> Self {
        Self {
            enabled: true,
            device: device.into(),
            slave_address,
            baud_rate,
            ..Self::default()
        }
    }

    fn is_complete(&self) -> bool {
        self.slave_address > 0 && !self.device.trim().is_empty() && self.baud_rate > 0
    }
}

/// Check every enabled transport carries what it needs to start.
pub fn validate(tcp: &TcpConfig, rtu: &RtuConfig) -> Result<()> {
    let tcp_ok = !tcp.enabled || tcp.is_complete();
    let rtu_ok = !rtu.enabled || rtu.is_complete();
    if !(tcp_ok && rtu_ok) {
        return Err(anyhow!(
            "Invalid configuration: tcp: {} tcp_addr={} tcp_port={} - rtu: {} rtu_addr={} rtu_dev={} rtu_speed={}",
            on_off(tcp.enabled),
            tcp.address,
            tcp.port,
            on_off(rtu.enabled),
            rtu.slave_address,
            rtu.device,
            rtu.baud_rate
        ));
    }

    for (label, rate) in [("tcp", tcp.error_rate), ("rtu", rtu.error_rate)] {
        if !(0.0..=100.0).contains(&rate) {
            return Err(anyhow!(
                "Invalid {label} error rate {rate}: expected a percentage in [0.0 - 100.0]"
            ));
        }
    }

    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        validate(&self.tcp, &self.rtu)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file
    pub fn from_file(file_path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config file {file_path}"))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file {file_path}"))
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization() {
        let config = ServerConfig {
            tcp: TcpConfig::listen("127.0.0.1", 1502),
            rtu: RtuConfig::serial("/dev/ttyS3", 17, 19200),
        };

        let json = config.to_json().unwrap();
        let parsed = ServerConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let parsed = ServerConfig::from_json(r#"{ "tcp": { "enabled": true } }"#).unwrap();
        assert!(parsed.tcp.enabled);
        assert_eq!(parsed.tcp.address, DEFAULT_TCP_ADDRESS);
        assert_eq!(parsed.tcp.port, DEFAULT_TCP_PORT);
        assert!(!parsed.rtu.enabled);
        assert_eq!(parsed.rtu.device, DEFAULT_RTU_DEVICE);
        assert_eq!(parsed.rtu.slave_address, DEFAULT_RTU_SLAVE_ADDRESS);
        assert_eq!(parsed.rtu.baud_rate, DEFAULT_RTU_BAUD_RATE);
        assert_eq!(parsed.rtu.init_value, DEFAULT_INIT_VALUE);
    }

    #[test]
    fn test_wildcard_address() {
        assert_eq!(TcpConfig::listen("*", 502).bind_host(), "0.0.0.0");
        assert_eq!(TcpConfig::listen("::1", 502).bind_host(), "::1");
    }

    #[test]
    fn test_validation() {
        assert!(ServerConfig::default().validate().is_ok());

        let mut tcp = TcpConfig::listen("", 502);
        assert!(validate(&tcp, &RtuConfig::default()).is_err());
        tcp.enabled = false;
        assert!(validate(&tcp, &RtuConfig::default()).is_ok());

        assert!(validate(&TcpConfig::listen("0.0.0.0", 0), &RtuConfig::default()).is_err());

        let tcp = TcpConfig::default();
        assert!(validate(&tcp, &RtuConfig::serial("/dev/ttyUSB0", 0, 9600)).is_err());
        assert!(validate(&tcp, &RtuConfig::serial("", 1, 9600)).is_err());
        assert!(validate(&tcp, &RtuConfig::serial("/dev/ttyUSB0", 1, 9600)).is_ok());

        let mut rtu = RtuConfig::serial("/dev/ttyUSB0", 1, 9600);
        rtu.error_rate = 150.0;
        assert!(validate(&TcpConfig::default(), &rtu).is_err());
    }
}
