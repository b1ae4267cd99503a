//! Tunnel status state machine and host phase mapping.

/// Tunnel status as observed by both processes.
///
/// This is the single source of truth for what the tunnel is doing
/// right now, mirrored into the status store so a process that did not
/// initiate the last transition can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// Not connected. Initial state and resting terminal state.
    Disconnected,
    /// Start requested, waiting for the host to bring the tunnel up.
    Connecting,
    /// Data path established and rewriting packets.
    Connected,
    /// Stop requested, waiting for the host to tear the tunnel down.
    Disconnecting,
    /// A start attempt failed or the host reported an unrecognized
    /// phase. Only an explicit new start leaves this state.
    Error,
}

impl TunnelStatus {
    /// The persisted string form (the cross-process wire contract).
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Disconnected => "Disconnected",
            TunnelStatus::Connecting => "Connecting",
            TunnelStatus::Connected => "Connected",
            TunnelStatus::Disconnecting => "Disconnecting",
            TunnelStatus::Error => "Error",
        }
    }

    /// Parse a persisted string. Unknown strings yield `None`; the
    /// store boundary falls back to `Disconnected`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Disconnected" => Some(TunnelStatus::Disconnected),
            "Connecting" => Some(TunnelStatus::Connecting),
            "Connected" => Some(TunnelStatus::Connected),
            "Disconnecting" => Some(TunnelStatus::Disconnecting),
            "Error" => Some(TunnelStatus::Error),
            _ => None,
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelStatus::Connected)
    }

    /// Check if in the error state.
    pub fn is_error(&self) -> bool {
        matches!(self, TunnelStatus::Error)
    }

    /// Check if transitioning (not idle).
    pub fn is_transitioning(&self) -> bool {
        matches!(self, TunnelStatus::Connecting | TunnelStatus::Disconnecting)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-level connection phase as delivered by the status notifier.
///
/// `Unknown` stands for any phase this crate does not recognize; it is
/// mapped to [`TunnelStatus::Error`] rather than silently treated as
/// healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
    Unknown,
}

impl From<HostPhase> for TunnelStatus {
    fn from(phase: HostPhase) -> Self {
        match phase {
            HostPhase::Invalid | HostPhase::Disconnected => TunnelStatus::Disconnected,
            // A reasserting tunnel is presented as still connecting.
            HostPhase::Connecting | HostPhase::Reasserting => TunnelStatus::Connecting,
            HostPhase::Connected => TunnelStatus::Connected,
            HostPhase::Disconnecting => TunnelStatus::Disconnecting,
            HostPhase::Unknown => TunnelStatus::Error,
        }
    }
}
