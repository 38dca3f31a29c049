use anyhow::Result;
use log::{info, LevelFilter};
use lpmac::device::sim::Air;
use lpmac::mac::LbtConfig;
use lpmac::MacConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod echo_client;
mod echo_server;

const SERVER_HARDWARE_ID: u64 = 0x0000_0001_0000_0052;
const CLIENT_HARDWARE_ID: u64 = 0x0000_0001_0000_0053;

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    // Timings shortened from the radio defaults, the simulated air is instantaneous.
    let config = MacConfig {
        ack_timeout: Duration::from_millis(500),
        lbt: LbtConfig {
            delay_step: Duration::from_millis(1),
            backoff_step: Duration::from_millis(10),
            ..Default::default()
        },
        ..Default::default()
    };
    let air = Air::new();

    let mut server = echo_server::EchoServer::start(air.radio(), SERVER_HARDWARE_ID, config)?;
    let server_id = server.mac.identity(0);
    let running = Arc::new(AtomicBool::new(true));
    let server_running = running.clone();
    let server_thread = std::thread::Builder::new()
        .name("echo-server".into())
        .spawn(move || server.spawn(&server_running))?;

    let mut client = echo_client::EchoClient::start(
        air.radio(),
        CLIENT_HARDWARE_ID,
        config,
        server_id,
        vec![
            "HELO1",
            "HELO2",
            "Enchante de pouvoir communiquer avec vous!",
        ]
        .into_iter()
        .map(|s| s.as_bytes().to_owned())
        .collect(),
    )?;
    let total = client.messages.len();
    let echoed = client.spawn(Duration::from_secs(5))?;
    info!("{}/{} messages echoed back.", echoed, total);
    info!("Neighbors: {:?}", client.mac.neighbors());
    client.mac.leave()?;
    client.mac.shutdown();
    running.store(false, Ordering::Relaxed);

    match server_thread.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Echo server panicked."),
    }
    info!("{} frames went through the air.", air.transmissions().len());
    Ok(())
}
