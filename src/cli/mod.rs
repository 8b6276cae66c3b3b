use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;

use crate::{api::config::ServerConfig, boot::parse_level};

/// Everything the binary needs after argument parsing.
#[derive(Debug, Clone)]
pub struct CliOptions {
    pub config: ServerConfig,
    pub level: LevelFilter,
    pub colors: bool,
}

/// Command line definition.
pub fn command() -> Command {
    Command::new("modbus-tester")
        .about("Modbus slave emulator serving TCP and RTU masters")
        .arg(
            Arg::new("transports")
                .help("Transports to enable: tcp, rtu")
                .value_name("TRANSPORT")
                .num_args(0..=2)
                .value_parser(["tcp", "rtu"]),
        )
        .arg(
            Arg::new("address")
                .long("address")
                .short('a')
                .help("TCP bind address, `*` for every interface")
                .value_name("ADDR"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("TCP port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16).range(1..)),
        )
        .arg(
            Arg::new("rtu-dev")
                .long("rtu-dev")
                .short('d')
                .help("RTU serial device")
                .value_name("DEVICE"),
        )
        .arg(
            Arg::new("rtu-addr")
                .long("rtu-addr")
                .short('r')
                .help("RTU slave address")
                .value_name("ID")
                .value_parser(clap::value_parser!(u8).range(1..=247)),
        )
        .arg(
            Arg::new("rtu-speed")
                .long("rtu-speed")
                .short('s')
                .help("RTU baud rate")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("error-rate")
                .long("error-rate")
                .short('e')
                .help("Error injection rate in percent [0.0 - 100.0]")
                .value_name("RATE")
                .value_parser(parse_error_rate),
        )
        .arg(
            Arg::new("init-value")
                .long("init-value")
                .short('i')
                .help("Initial register value [0x00 - 0xFF], decimal or 0x-prefixed hex")
                .value_name("VALUE")
                .value_parser(parse_init_value),
        )
        .arg(
            Arg::new("level")
                .long("level")
                .short('l')
                .help("Log level: error, warning, info, verbose, debug, none")
                .value_name("LEVEL")
                .default_value("none")
                .value_parser(|name: &str| {
                    parse_level(name).ok_or_else(|| format!("unknown log level '{name}'"))
                }),
        )
        .arg(
            Arg::new("colors")
                .long("colors")
                .short('c')
                .help("Colored log output")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("JSON configuration file; other flags override its values")
                .value_name("FILE"),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}

fn parse_error_rate(raw: &str) -> Result<f32, String> {
    let rate: f32 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if !(0.0..=100.0).contains(&rate) {
        return Err(format!("{rate} is outside [0.0 - 100.0]"));
    }
    Ok(rate)
}

fn parse_init_value(raw: &str) -> Result<u8, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| format!("'{raw}' is not a value in [0x00 - 0xFF]"))
}

/// Merge the optional configuration file with the command line flags.
pub fn resolve(matches: &ArgMatches) -> Result<CliOptions> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    if let Some(transports) = matches.get_many::<String>("transports") {
        for transport in transports {
            match transport.as_str() {
                "tcp" => config.tcp.enabled = true,
                "rtu" => config.rtu.enabled = true,
                other => return Err(anyhow!("Unknown transport '{other}'")),
            }
        }
    }

    if let Some(address) = matches.get_one::<String>("address") {
        config.tcp.address = address.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.tcp.port = *port;
    }
    if let Some(device) = matches.get_one::<String>("rtu-dev") {
        config.rtu.device = device.clone();
    }
    if let Some(slave) = matches.get_one::<u8>("rtu-addr") {
        config.rtu.slave_address = *slave;
    }
    if let Some(baud) = matches.get_one::<u32>("rtu-speed") {
        config.rtu.baud_rate = *baud;
    }
    if let Some(rate) = matches.get_one::<f32>("error-rate") {
        config.tcp.error_rate = *rate;
        config.rtu.error_rate = *rate;
    }
    if let Some(value) = matches.get_one::<u8>("init-value") {
        config.tcp.init_value = *value;
        config.rtu.init_value = *value;
    }

    Ok(CliOptions {
        config,
        level: matches
            .get_one::<LevelFilter>("level")
            .copied()
            .unwrap_or(LevelFilter::Off),
        colors: matches.get_flag("colors"),
    })
}
