//! Persisted status store shared by the controller and the provider.
//!
//! The store is the only communication medium between the two
//! processes: a durable mapping from well-known keys to string values,
//! one file per key. Writes are field-granular with last-writer-wins
//! semantics; there is no transaction across fields and readers must
//! tolerate a brief staleness window.
//!
//! Change notification through [`StatusStore::subscribe`] is
//! process-local. The other process observes transitions by reading
//! the store, or through the host's status notifier.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{
    TunnelConfiguration, DEFAULT_DEVICE_IP, DEFAULT_FAKE_IP, DEFAULT_SUBNET_MASK,
};
use crate::error::Result;
use crate::status::TunnelStatus;
use crate::{DEVICE_IP_KEY, FAKE_IP_KEY, STATUS_KEY, SUBNET_MASK_KEY};

/// Durable, process-shared persistence of the tunnel status and the
/// active configuration.
#[derive(Clone)]
pub struct StatusStore {
    dir: PathBuf,
    status_tx: Arc<watch::Sender<TunnelStatus>>,
}

impl StatusStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let seed = read_status_from(&dir);
        let (status_tx, _) = watch::channel(seed);
        Ok(Self {
            dir,
            status_tx: Arc::new(status_tx),
        })
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the status string and notify in-process subscribers.
    pub fn write_status(&self, status: TunnelStatus) -> Result<()> {
        fs::write(self.dir.join(STATUS_KEY), status.as_str())?;
        self.status_tx.send_replace(status);
        debug!(status = %status, "Status persisted");
        Ok(())
    }

    /// Last written status, or `Disconnected` when never written or
    /// unparseable.
    pub fn read_status(&self) -> TunnelStatus {
        read_status_from(&self.dir)
    }

    /// Subscribe to status values written through this handle (and its
    /// clones). The receiver starts at the current persisted value.
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status_tx.subscribe()
    }

    /// Persist the three configuration fields. Each field is written
    /// independently; concurrent writers may interleave field updates.
    pub fn write_configuration(&self, config: &TunnelConfiguration) -> Result<()> {
        fs::write(
            self.dir.join(DEVICE_IP_KEY),
            config.device_address.to_string(),
        )?;
        fs::write(self.dir.join(FAKE_IP_KEY), config.fake_address.to_string())?;
        fs::write(
            self.dir.join(SUBNET_MASK_KEY),
            config.subnet_mask.to_string(),
        )?;
        debug!(
            device = %config.device_address,
            fake = %config.fake_address,
            mask = %config.subnet_mask,
            "Configuration persisted"
        );
        Ok(())
    }

    /// Retrieve the persisted configuration. Each field defaults
    /// independently when absent or unparseable.
    pub fn read_configuration(&self) -> TunnelConfiguration {
        TunnelConfiguration {
            device_address: self.read_addr(DEVICE_IP_KEY, DEFAULT_DEVICE_IP),
            fake_address: self.read_addr(FAKE_IP_KEY, DEFAULT_FAKE_IP),
            subnet_mask: self.read_addr(SUBNET_MASK_KEY, DEFAULT_SUBNET_MASK),
        }
    }

    fn read_addr(&self, key: &str, default: Ipv4Addr) -> Ipv4Addr {
        let Ok(raw) = fs::read_to_string(self.dir.join(key)) else {
            return default;
        };
        match raw.trim().parse::<Ipv4Addr>() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(key, value = raw.trim(), "Unparseable store field, using default");
                default
            }
        }
    }
}

fn read_status_from(dir: &Path) -> TunnelStatus {
    fs::read_to_string(dir.join(STATUS_KEY))
        .ok()
        .and_then(|raw| TunnelStatus::parse(raw.trim()))
        .unwrap_or(TunnelStatus::Disconnected)
}
