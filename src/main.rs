use anyhow::{Context, Result};

use modbus_tester::{boot, cli, ModbusServer};

fn main() -> Result<()> {
    let matches = cli::parse_args();
    let options = cli::resolve(&matches)?;
    boot::init_logger(options.level, options.colors);
    log::debug!("Starting with {:?}", options.config);

    let (signal_tx, signal_rx) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .context("Failed to install the termination handler")?;

    let mut server = ModbusServer::new();
    server.start(options.config.tcp, options.config.rtu)?;

    if signal_rx.recv().is_ok() {
        log::info!("Termination requested");
    }
    server.stop();
    Ok(())
}
