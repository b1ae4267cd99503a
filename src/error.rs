//! Error types for the loopback tunnel.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tunnel controller and rewrite engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (invalid address, non-contiguous mask, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The host rejected loading the registration list
    #[error("Registration load failed: {0}")]
    RegistrationLoad(String),

    /// The host rejected saving the registration
    #[error("Registration save failed: {0}")]
    RegistrationSave(String),

    /// The host rejected the start command
    #[error("Start command failed: {0}")]
    StartCommand(String),

    /// The host rejected the stop command
    #[error("Stop command failed: {0}")]
    StopCommand(String),

    /// The host rejected the virtual interface network settings
    #[error("Interface settings rejected: {0}")]
    SettingsRejected(String),

    /// The packet flow was torn down while a read was outstanding
    #[error("Packet flow closed by the host")]
    FlowClosed,

    /// Internal channel closed
    #[error("Internal channel closed unexpectedly")]
    ChannelClosed,

    /// I/O errors (status store persistence)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new registration-load error.
    pub fn registration_load<S: Into<String>>(msg: S) -> Self {
        Self::RegistrationLoad(msg.into())
    }

    /// Create a new registration-save error.
    pub fn registration_save<S: Into<String>>(msg: S) -> Self {
        Self::RegistrationSave(msg.into())
    }

    /// Create a new start-command error.
    pub fn start_command<S: Into<String>>(msg: S) -> Self {
        Self::StartCommand(msg.into())
    }

    /// Create a new stop-command error.
    pub fn stop_command<S: Into<String>>(msg: S) -> Self {
        Self::StopCommand(msg.into())
    }

    /// Create a new settings-rejection error.
    pub fn settings<S: Into<String>>(msg: S) -> Self {
        Self::SettingsRejected(msg.into())
    }
}
