//! Lightweight ambient error type used by the channel bridge and logging
//! setup. The daemon's full §7 error taxonomy (`DaemonError`) lives in the
//! `usbmuxd` crate, closer to the core it classifies failures for.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
