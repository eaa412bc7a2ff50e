use clap::{Args, Parser};
use std::path::PathBuf;

use crate::code::DEFAULT_SECRET_LEN;
use crate::config::{DEFAULT_BROKER_URL, DEFAULT_ICE_SERVERS, DEFAULT_MINSIG_URL};
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "rtcpipe",
    about = "Pipe stdin/stdout to a peer over a WebRTC data channel",
    version
)]
pub struct RtcpipeArgs {
    #[arg(help = "Slot name both peers agree on")]
    pub slot: String,

    #[arg(
        long,
        env = "RTCPIPE_ICE",
        default_value = DEFAULT_ICE_SERVERS,
        help = "Comma-separated ICE servers (user:credential@turn:host for TURN)"
    )]
    pub ice: String,

    #[arg(
        long,
        env = "RTCPIPE_MINSIG",
        default_value = DEFAULT_MINSIG_URL,
        help = "Base URL of the signaling server"
    )]
    pub minsig: String,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Parser, Debug)]
#[command(
    name = "wormhole",
    about = "Create or join a PAKE-authenticated WebRTC pipe",
    version
)]
pub struct WormholeArgs {
    #[arg(help = "Code printed by the other side; omit to create a new slot")]
    pub code: Option<String>,

    #[arg(
        long,
        env = "WORMHOLE_BROKER",
        default_value = DEFAULT_BROKER_URL,
        help = "Websocket URL of the rendezvous broker"
    )]
    pub broker: String,

    #[arg(
        long,
        env = "WORMHOLE_ICE",
        default_value = DEFAULT_ICE_SERVERS,
        help = "Comma-separated ICE servers used until the broker announces its own"
    )]
    pub ice: String,

    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = DEFAULT_SECRET_LEN,
        value_parser = clap::value_parser!(usize),
        help = "Password length in bytes when creating a slot"
    )]
    pub length: usize,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "WORMHOLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "WORMHOLE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
