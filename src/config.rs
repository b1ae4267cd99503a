//! Tunnel configuration: the device/fake address pair and subnet mask.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{DEVICE_IP_KEY, FAKE_IP_KEY, SUBNET_MASK_KEY};

/// Default device address (the address packets are nominally sent to).
pub const DEFAULT_DEVICE_IP: Ipv4Addr = Ipv4Addr::new(10, 7, 0, 0);

/// Default fake address (the substitute used for the rewrite).
pub const DEFAULT_FAKE_IP: Ipv4Addr = Ipv4Addr::new(10, 7, 0, 1);

/// Default subnet mask applied to the virtual interface.
pub const DEFAULT_SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Tunnel configuration, immutable per tunnel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    /// IPv4 address packets are nominally sent to.
    #[serde(default = "default_device_ip")]
    pub device_address: Ipv4Addr,

    /// Substitute IPv4 address used for the return/forward rewrite.
    #[serde(default = "default_fake_ip")]
    pub fake_address: Ipv4Addr,

    /// Subnet mask applied to the virtual interface.
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: Ipv4Addr,
}

fn default_device_ip() -> Ipv4Addr {
    DEFAULT_DEVICE_IP
}
fn default_fake_ip() -> Ipv4Addr {
    DEFAULT_FAKE_IP
}
fn default_subnet_mask() -> Ipv4Addr {
    DEFAULT_SUBNET_MASK
}

impl Default for TunnelConfiguration {
    fn default() -> Self {
        Self {
            device_address: DEFAULT_DEVICE_IP,
            fake_address: DEFAULT_FAKE_IP,
            subnet_mask: DEFAULT_SUBNET_MASK,
        }
    }
}

impl TunnelConfiguration {
    /// Validate the configuration.
    ///
    /// Addresses are valid IPv4 by construction; the mask must be a
    /// contiguous network mask and the two addresses must differ.
    pub fn validate(&self) -> Result<()> {
        if !is_contiguous_mask(self.subnet_mask) {
            return Err(Error::config(format!(
                "subnet mask {} is not a contiguous network mask",
                self.subnet_mask
            )));
        }
        if self.device_address == self.fake_address {
            return Err(Error::config(
                "device address and fake address must differ",
            ));
        }
        Ok(())
    }

    /// 32-bit big-endian integer form of the device address.
    ///
    /// Computed once per session by the engine and compared directly
    /// against the address fields read out of packet headers.
    pub fn device_net(&self) -> u32 {
        u32::from(self.device_address)
    }

    /// 32-bit big-endian integer form of the fake address.
    pub fn fake_net(&self) -> u32 {
        u32::from(self.fake_address)
    }

    /// CIDR prefix length of the subnet mask.
    pub fn prefix_len(&self) -> u8 {
        self.subnet_mask
            .octets()
            .iter()
            .map(|b| b.count_ones() as u8)
            .sum()
    }

    /// Convert to the string-keyed launch-option map passed to the
    /// host start command (`TunnelDeviceIP`, `TunnelFakeIP`,
    /// `TunnelSubnetMask`).
    pub fn to_options(&self) -> HashMap<String, String> {
        let mut options = HashMap::new();
        options.insert(DEVICE_IP_KEY.to_string(), self.device_address.to_string());
        options.insert(FAKE_IP_KEY.to_string(), self.fake_address.to_string());
        options.insert(SUBNET_MASK_KEY.to_string(), self.subnet_mask.to_string());
        options
    }

    /// Apply launch options on top of this configuration, field by
    /// field. A present but unparseable option is a configuration
    /// error rather than a silent fallback.
    pub fn with_options(mut self, options: &HashMap<String, String>) -> Result<Self> {
        if let Some(value) = options.get(DEVICE_IP_KEY) {
            self.device_address = parse_ipv4(DEVICE_IP_KEY, value)?;
        }
        if let Some(value) = options.get(FAKE_IP_KEY) {
            self.fake_address = parse_ipv4(FAKE_IP_KEY, value)?;
        }
        if let Some(value) = options.get(SUBNET_MASK_KEY) {
            self.subnet_mask = parse_ipv4(SUBNET_MASK_KEY, value)?;
        }
        Ok(self)
    }
}

/// Parse a dotted-quad string, naming the offending field on failure.
pub fn parse_ipv4(key: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::config(format!("{key}: invalid IPv4 address {value:?}")))
}

/// Check that a mask's set bits form one contiguous run from the top.
fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    // A contiguous mask inverted is 2^n - 1.
    let inverted = !bits;
    inverted & inverted.wrapping_add(1) == 0
}
