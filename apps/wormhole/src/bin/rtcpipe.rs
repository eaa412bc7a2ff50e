use clap::Parser;
use tracing::{debug, info};
use wormhole_core::cli::RtcpipeArgs;
use wormhole_core::config::{PipeConfig, parse_ice_servers};
use wormhole_core::error::CliError;
use wormhole_core::signal::minsig::MinsigClient;
use wormhole_core::telemetry as logctl;
use wormhole_core::transport::webrtc::RtcFactory;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("rtcpipe: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let args = RtcpipeArgs::parse();
    let log_config = args.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let ice_servers = parse_ice_servers(&args.ice)?;
    let factory = RtcFactory::new(PipeConfig::default());
    let client = MinsigClient::new(args.minsig);

    let peer = client.dial(&factory, &args.slot, &ice_servers).await?;
    info!(target = "wormhole::rtcpipe", slot = %args.slot, "data channel open");

    let pipe = peer.take_pipe()?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let report = pipe.run(&mut stdin, &mut stdout).await?;
    debug!(
        target = "wormhole::rtcpipe",
        sent = report.sent,
        received = report.received,
        "pipe finished"
    );
    Ok(())
}
