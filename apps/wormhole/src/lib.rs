pub mod cli;
pub mod code;
pub mod config;
pub mod crypto;
pub mod deferred;
pub mod error;
pub mod handshake;
pub mod pump;
pub mod signal;
pub mod telemetry;
pub mod transport;
