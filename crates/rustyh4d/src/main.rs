//! rustyh4 daemon
//!
//! Opens an H4 transport, optionally resets the controller, and logs the
//! traffic it sends until the transport goes away.

use std::sync::Arc;

use crossbeam::channel;
use log::info;
use rustyh4::{BluetoothHci, HciCommand, SerialTransport};

mod config;
mod error;
mod monitor;

use crate::{
    config::Config,
    error::{DaemonError, Result},
    monitor::{PacketLogger, SessionEnd},
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting rustyh4d...");

    let config = Config::load()?;
    info!("Using HCI transport {}", config.device.display());

    let (end, ended) = channel::bounded(1);
    let logger = Arc::new(PacketLogger::new(end));

    let hci = BluetoothHci::new(SerialTransport::new(&config.device));
    hci.initialize(logger.clone())?;

    if config.reset_on_start {
        let reset = HciCommand::Reset.to_packet()?;
        logger.reset_sent();
        hci.send_hci_command(reset.as_bytes())?;

        let watchdog = logger.clone();
        hci.set_timeout(config.reset_timeout(), move || watchdog.reset_deadline_expired())?;
    }

    let outcome = ended.recv().unwrap_or(SessionEnd::TransportClosed);
    hci.close();

    match outcome {
        SessionEnd::TransportClosed => {
            info!("HCI transport closed, exiting");
            Ok(())
        }
        SessionEnd::ResetTimedOut => Err(DaemonError::ResetTimeout(config.reset_timeout())),
    }
}
