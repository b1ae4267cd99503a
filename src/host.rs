//! The host seam: registration, tunnel control, and packet I/O.
//!
//! The operating-system capability that provisions virtual interfaces
//! and manages the packet-processing process is an external
//! collaborator; these traits describe it at its interface boundary so
//! the controller and engine stay testable against in-process
//! implementations.

pub mod loopback;

use std::collections::HashMap;
use std::net::Ipv4Addr;

use bytes::BytesMut;
use tokio::sync::mpsc;

use crate::config::TunnelConfiguration;
use crate::error::Result;
use crate::status::HostPhase;

/// The host-persisted record binding this application's tunnel to a
/// provider identity. Created on first start, reused and updated
/// thereafter, never deleted by this system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Stable identity used for the typed lookup. The controller owns
    /// at most one registration with this id.
    pub provider_id: String,
    /// Presentation name shown by the host.
    pub display_name: String,
    /// Descriptive server field (this tunnel has no real server).
    pub server_description: String,
    /// Whether the registration is enabled with the host.
    pub enabled: bool,
    /// Whether the host may bring the tunnel up on demand.
    pub on_demand: bool,
}

impl Registration {
    /// A fresh registration for the given provider identity.
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            display_name: "looptun".to_string(),
            server_description: "Local loopback tunnel".to_string(),
            enabled: true,
            on_demand: true,
        }
    }
}

/// Reason passed along with a stop command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user asked for the tunnel to stop.
    UserRequested,
    /// The provider process failed.
    ProviderFailed,
}

/// Per-packet address-family tag carried next to each raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFamily {
    Ipv4,
    Ipv6,
    Other(i32),
}

impl PacketFamily {
    /// Build from the host's raw AF_* value.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            libc::AF_INET => PacketFamily::Ipv4,
            libc::AF_INET6 => PacketFamily::Ipv6,
            other => PacketFamily::Other(other),
        }
    }

    /// The raw AF_* value handed back to the host on write.
    pub fn raw(self) -> i32 {
        match self {
            PacketFamily::Ipv4 => libc::AF_INET,
            PacketFamily::Ipv6 => libc::AF_INET6,
            PacketFamily::Other(raw) => raw,
        }
    }
}

/// Virtual interface network settings registered by the engine.
///
/// Only the device subnet is routed through the tunnel; all other
/// traffic is explicitly excluded. The tunnel is narrowly scoped,
/// never a default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    /// Address assigned to the virtual interface.
    pub address: Ipv4Addr,
    /// Subnet mask assigned to the virtual interface.
    pub subnet_mask: Ipv4Addr,
    /// The single included route: the device subnet.
    pub included_route: (Ipv4Addr, Ipv4Addr),
    /// Whether the default route is excluded from the tunnel.
    pub excludes_default_route: bool,
}

impl InterfaceSettings {
    /// Settings for a tunnel configuration: the device address and
    /// mask on the interface, routing only the device subnet.
    pub fn for_configuration(config: &TunnelConfiguration) -> Self {
        Self {
            address: config.device_address,
            subnet_mask: config.subnet_mask,
            included_route: (config.device_address, config.subnet_mask),
            excludes_default_route: true,
        }
    }
}

/// Registration, control, and notification capability of the host, as
/// used by the lifecycle controller.
///
/// The host serializes registration mutations per caller; the
/// controller performs read-then-act without its own lock.
#[allow(async_fn_in_trait)]
pub trait TunnelHost {
    /// Load all registrations visible to this application.
    async fn load_registrations(&self) -> Result<Vec<Registration>>;

    /// Create or update a registration.
    async fn save_registration(&self, registration: &Registration) -> Result<()>;

    /// Launch the packet-processing process with the given launch
    /// options. Synchronous rejection is returned as an error; on
    /// acceptance, progress is observed through the phase notifier.
    async fn start_tunnel(
        &self,
        registration: &Registration,
        options: &HashMap<String, String>,
    ) -> Result<()>;

    /// Ask the host to tear the tunnel down. Fire-and-forget: the
    /// terminal transition arrives through the phase notifier.
    async fn stop_tunnel(&self, registration: &Registration, reason: StopReason) -> Result<()>;

    /// Subscribe to host connection-phase changes (the status
    /// notifier). Fired whenever the registration's connection status
    /// changes.
    fn subscribe_phases(&self) -> mpsc::UnboundedReceiver<HostPhase>;
}

/// The provider-side data path handed to the rewrite engine by the
/// host: settings registration plus batched packet I/O.
#[allow(async_fn_in_trait)]
pub trait TunnelInterface: Send {
    /// Register the virtual interface network settings.
    async fn apply_settings(&mut self, settings: &InterfaceSettings) -> Result<()>;

    /// Acquire the next batch of outbound packets with their family
    /// tags (parallel vectors, batch size >= 1). Suspends until the
    /// host has packets or the interface is torn down.
    async fn read_packets(&mut self) -> Result<(Vec<BytesMut>, Vec<PacketFamily>)>;

    /// Write a batch back out with its per-packet family tags,
    /// preserving relative order.
    async fn write_packets(
        &mut self,
        packets: Vec<BytesMut>,
        families: Vec<PacketFamily>,
    ) -> Result<()>;
}
