use thiserror::Error;

use crate::pump::PumpConfig;
use crate::signal::IceServer;

pub const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_MINSIG_URL: &str = "https://minimumsignal.0f.io/";
pub const DEFAULT_BROKER_URL: &str = "wss://webwormhole.io/";
pub const DEFAULT_CHANNEL_LABEL: &str = "data";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ice server `{0}` must look like user:credential@turn:host")]
    TurnCredentials(String),
    #[error("ice server `{0}` has no scheme")]
    MissingScheme(String),
}

/// Data channel and pump settings shared by both binaries.
#[derive(Clone, Debug)]
pub struct PipeConfig {
    pub label: String,
    /// Both peers open the channel out of band with this id, so neither waits
    /// for the other to announce it.
    pub channel_id: u16,
    pub pump: PumpConfig,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_CHANNEL_LABEL.to_string(),
            channel_id: 0,
            pump: PumpConfig::default(),
        }
    }
}

/// Parses a comma-separated server list such as
/// `stun:stun.example.org,alice:secret@turn:turn.example.org:3478`.
pub fn parse_ice_servers(list: &str) -> Result<Vec<IceServer>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_ice_server)
        .collect()
}

fn parse_ice_server(entry: &str) -> Result<IceServer, ConfigError> {
    if let Some((credentials, url)) = entry.rsplit_once('@') {
        if url.starts_with("turn:") || url.starts_with("turns:") {
            let (username, credential) = credentials
                .split_once(':')
                .ok_or_else(|| ConfigError::TurnCredentials(entry.to_string()))?;
            return Ok(IceServer {
                urls: vec![url.to_string()],
                username: username.to_string(),
                credential: credential.to_string(),
            });
        }
    }
    if !entry.contains(':') {
        return Err(ConfigError::MissingScheme(entry.to_string()));
    }
    Ok(IceServer::url(entry))
}
