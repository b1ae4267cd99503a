//! Tunnel lifecycle controller.
//!
//! The only component with authority to request interface registration
//! and to command start/stop. It is an explicitly constructed value -
//! whoever drives the application builds one and passes it to the
//! interface layer; there is no process-wide singleton.
//!
//! The in-memory status is advisory: the authoritative value is
//! whatever the host reports for the registration's connection, with
//! the status store bridging the gap across the process boundary.

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::TunnelConfiguration;
use crate::error::Result;
use crate::host::{Registration, StopReason, TunnelHost};
use crate::status::{HostPhase, TunnelStatus};
use crate::store::StatusStore;

/// Lifecycle controller for one tunnel registration.
pub struct TunnelController<H: TunnelHost> {
    host: H,
    store: StatusStore,
    provider_id: String,
    status: TunnelStatus,
    registration: Option<Registration>,
    phases: mpsc::UnboundedReceiver<HostPhase>,
}

impl<H: TunnelHost> TunnelController<H> {
    /// Create a controller bound to a provider identity.
    ///
    /// The in-memory status is seeded from the persisted store, so a
    /// relaunched controller process starts from the last observed
    /// state rather than assuming `Disconnected`.
    pub fn new(host: H, store: StatusStore, provider_id: impl Into<String>) -> Self {
        let phases = host.subscribe_phases();
        let status = store.read_status();
        Self {
            host,
            store,
            provider_id: provider_id.into(),
            status,
            registration: None,
            phases,
        }
    }

    /// Current advisory status.
    pub fn status(&self) -> TunnelStatus {
        self.status
    }

    /// The cached registration, if one has been loaded or created.
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Subscribe to status values as they are persisted through this
    /// controller's store handle.
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.store.subscribe()
    }

    /// Validate and persist a new configuration. Applied on the next
    /// start; the active session is not reconfigured in flight.
    pub fn set_configuration(&self, config: &TunnelConfiguration) -> Result<()> {
        config.validate()?;
        self.store.write_configuration(config)
    }

    /// The currently persisted configuration.
    pub fn configuration(&self) -> TunnelConfiguration {
        self.store.read_configuration()
    }

    /// Load the registration matching this provider identity, without
    /// creating one. Caches the hit. A load failure transitions to
    /// `Error` (persisted) - the host could not even tell us what
    /// exists.
    pub async fn load_registration(&mut self) -> Result<Option<Registration>> {
        let registrations = match self.host.load_registrations().await {
            Ok(registrations) => registrations,
            Err(err) => {
                error!(error = %err, "Failed to load registrations");
                self.set_status(TunnelStatus::Error)?;
                return Err(err);
            }
        };
        self.registration = registrations
            .into_iter()
            .find(|r| r.provider_id == self.provider_id);
        if self.registration.is_some() {
            debug!(provider_id = %self.provider_id, "Loaded existing registration");
        }
        Ok(self.registration.clone())
    }

    /// Start the tunnel.
    ///
    /// No-op while already connected: at most one start command is
    /// ever issued for an active data path. Otherwise ensures the
    /// registration exists (reusing and updating a matching one,
    /// creating on miss), persists `Connecting`, and issues the start
    /// command with the persisted configuration as launch options.
    ///
    /// Any failure is terminal for this attempt: `Error` is persisted
    /// and the cause returned. There is no automatic retry.
    pub async fn start(&mut self) -> Result<()> {
        if self.status.is_connected() {
            info!("Tunnel already connected, ignoring start");
            return Ok(());
        }

        let registration = match self.ensure_registration().await {
            Ok(registration) => registration,
            Err(err) => {
                error!(error = %err, "Registration unavailable, not starting");
                self.set_status(TunnelStatus::Error)?;
                return Err(err);
            }
        };

        self.set_status(TunnelStatus::Connecting)?;

        let options = self.store.read_configuration().to_options();
        if let Err(err) = self.host.start_tunnel(&registration, &options).await {
            error!(error = %err, "Host rejected start command");
            self.set_status(TunnelStatus::Error)?;
            return Err(err);
        }

        info!(provider_id = %self.provider_id, "Tunnel start initiated");
        Ok(())
    }

    /// Stop the tunnel.
    ///
    /// No-op when no registration is active or the tunnel is already
    /// disconnected: no stop command is issued. Otherwise persists
    /// `Disconnecting` and issues the stop command; the terminal
    /// `Disconnected` arrives through the status notifier.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status == TunnelStatus::Disconnected {
            debug!("Tunnel already disconnected, ignoring stop");
            return Ok(());
        }
        let Some(registration) = self.registration.clone() else {
            debug!("No active registration, ignoring stop");
            return Ok(());
        };

        self.set_status(TunnelStatus::Disconnecting)?;
        if let Err(err) = self
            .host
            .stop_tunnel(&registration, StopReason::UserRequested)
            .await
        {
            error!(error = %err, "Host rejected stop command");
            self.set_status(TunnelStatus::Error)?;
            return Err(err);
        }

        info!(provider_id = %self.provider_id, "Tunnel stop initiated");
        Ok(())
    }

    /// Await the next host phase notification, map it onto the status
    /// enumeration, persist it, and return it. Returns `None` once the
    /// host has closed the notification channel.
    pub async fn next_status(&mut self) -> Option<TunnelStatus> {
        let phase = self.phases.recv().await?;
        let mapped = TunnelStatus::from(phase);
        debug!(phase = ?phase, status = %mapped, "Host phase observed");
        if let Err(err) = self.set_status(mapped) {
            warn!(error = %err, "Failed to persist observed status");
        }
        Some(mapped)
    }

    fn set_status(&mut self, status: TunnelStatus) -> Result<()> {
        self.status = status;
        self.store.write_status(status)
    }

    /// Reuse the cached registration, else look one up by provider
    /// identity (updating it on hit), else create and save a fresh
    /// one. Never duplicates.
    async fn ensure_registration(&mut self) -> Result<Registration> {
        if let Some(registration) = &self.registration {
            return Ok(registration.clone());
        }

        let registrations = self.host.load_registrations().await?;

        let registration = match registrations
            .into_iter()
            .find(|r| r.provider_id == self.provider_id)
        {
            Some(mut existing) => {
                existing.enabled = true;
                existing.on_demand = true;
                self.host.save_registration(&existing).await?;
                info!(provider_id = %self.provider_id, "Updated existing registration");
                existing
            }
            None => {
                let fresh = Registration::new(&self.provider_id);
                self.host.save_registration(&fresh).await?;
                info!(provider_id = %self.provider_id, "Created new registration");
                fresh
            }
        };

        self.registration = Some(registration.clone());
        Ok(registration)
    }
}
