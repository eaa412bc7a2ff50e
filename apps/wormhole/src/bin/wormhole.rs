use std::sync::Arc;

use clap::Parser;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wormhole_core::cli::WormholeArgs;
use wormhole_core::config::{PipeConfig, parse_ice_servers};
use wormhole_core::crypto::Spake2Exchange;
use wormhole_core::error::CliError;
use wormhole_core::signal::rendezvous::{Notice, Rendezvous};
use wormhole_core::telemetry as logctl;
use wormhole_core::transport::TransportProvider;
use wormhole_core::transport::webrtc::RtcFactory;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("wormhole: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let args = WormholeArgs::parse();
    let log_config = args.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let ice_servers = parse_ice_servers(&args.ice)?;
    let rendezvous = Rendezvous::new(
        args.broker,
        RtcFactory::new(PipeConfig::default()),
        Arc::new(Spake2Exchange),
    )
    .with_fallback_ice(ice_servers);

    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(notice) = notices_rx.recv().await {
            match notice {
                Notice::Code(code) => {
                    eprintln!("{code}");
                    eprintln!("run `wormhole {code}` on the other side");
                }
                Notice::Fingerprint(fingerprint) => {
                    eprintln!("fingerprint: {fingerprint}");
                }
            }
        }
    });

    let established = match args.code {
        Some(code) => rendezvous.join(&code, notices_tx).await?,
        None => {
            if args.length == 0 {
                return Err(CliError::InvalidArgument(
                    "password length must be at least one byte".into(),
                ));
            }
            let mut secret = vec![0u8; args.length];
            OsRng.fill_bytes(&mut secret);
            rendezvous.create(secret, notices_tx).await?
        }
    };
    let _ = printer.await;
    info!(
        target = "wormhole::cli",
        close = established.close.code(),
        "rendezvous complete"
    );

    let transport = established.transport;
    transport.wait_open().await?;
    let pipe = transport.take_pipe()?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let report = pipe.run(&mut stdin, &mut stdout).await?;
    debug!(
        target = "wormhole::cli",
        sent = report.sent,
        received = report.received,
        "pipe finished"
    );
    Ok(())
}
