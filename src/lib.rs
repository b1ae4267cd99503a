//! Local loopback IPv4 tunnel.
//!
//! Two cooperating halves that cannot share memory:
//! - the [`controller::TunnelController`] owns the tunnel lifecycle
//!   (registration, start/stop commands, status observation), and
//! - the [`engine::RewriteEngine`] owns the data path, rewriting the
//!   source/destination addresses of outbound IPv4 packets so traffic
//!   sent to the device address loops back from the fake address.
//!
//! The [`store::StatusStore`] is the persisted key-value region both
//! halves share; the host capability behind the [`host`] traits
//! launches the engine and notifies the controller of phase changes.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod host;
pub mod status;
pub mod store;

pub use config::TunnelConfiguration;
pub use controller::TunnelController;
pub use engine::RewriteEngine;
pub use error::{Error, Result};
pub use status::{HostPhase, TunnelStatus};
pub use store::StatusStore;

/// Status store key holding the serialized tunnel status.
pub const STATUS_KEY: &str = "vpnStatus";

/// Status store / launch-option key for the device address.
pub const DEVICE_IP_KEY: &str = "TunnelDeviceIP";

/// Status store / launch-option key for the fake address.
pub const FAKE_IP_KEY: &str = "TunnelFakeIP";

/// Status store / launch-option key for the subnet mask.
pub const SUBNET_MASK_KEY: &str = "TunnelSubnetMask";

/// Default provider identity used for the registration lookup.
pub const DEFAULT_PROVIDER_ID: &str = "looptun.tunnel-provider";
