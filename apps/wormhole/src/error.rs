use std::io;
use thiserror::Error;

use crate::config::ConfigError;
use crate::pump::PumpError;
use crate::signal::SignalError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Signal(#[from] SignalError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("pipe error: {0}")]
    Pump(#[from] PumpError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
