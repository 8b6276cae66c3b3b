use chrono::Local;
use log::LevelFilter;
use std::io::{self, Write};

use env_logger::{Builder, Target, WriteStyle};

/// Environment variable naming an extra file that receives every log line.
pub const LOG_FILE_ENV: &str = "MODBUS_TESTER_LOG_FILE";
/// Any value forces the most detailed level.
pub const VERBOSE_ENV: &str = "VERBOSE";

/// Multi-writer for logging to both file and stderr
struct DualWriter {
    file: std::fs::File,
    stderr: io::Stderr,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stderr.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stderr.flush()?;
        Ok(())
    }
}

/// Map a command line level name to a filter.
///
/// `verbose` is the chattier of the two informational levels, `debug`
/// enables per-query tracing.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "none" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warning" | "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "verbose" => Some(LevelFilter::Debug),
        "debug" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// `VERBOSE` in the environment overrides the requested level.
pub fn effective_level(requested: LevelFilter) -> LevelFilter {
    if std::env::var_os(VERBOSE_ENV).is_some() {
        LevelFilter::Trace
    } else {
        requested
    }
}

/// Install the global logger. `RUST_LOG` still refines the filter.
pub fn init_logger(level: LevelFilter, colors: bool) {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            let style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "{} {style}[{}]{style:#} {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .write_style(if colors {
            WriteStyle::Always
        } else {
            WriteStyle::Never
        })
        .filter_level(effective_level(level))
        .parse_default_env();

    if let Some(path) = std::env::var_os(LOG_FILE_ENV) {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(DualWriter {
                    file,
                    stderr: io::stderr(),
                })));
            }
            Err(err) => eprintln!(
                "Failed to open log file '{}': {err}",
                path.to_string_lossy()
            ),
        }
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("none"), Some(LevelFilter::Off));
        assert_eq!(parse_level("error"), Some(LevelFilter::Error));
        assert_eq!(parse_level("warning"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("INFO"), Some(LevelFilter::Info));
        assert_eq!(parse_level("verbose"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("debug"), Some(LevelFilter::Trace));
        assert_eq!(parse_level("loud"), None);
    }
}
