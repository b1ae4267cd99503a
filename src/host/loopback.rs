//! In-process host implementation.
//!
//! `LoopbackHost` plays the operating-system role for the CLI and the
//! tests: it keeps registrations in memory, launches the rewrite
//! engine as a background task wired to channel-backed packet I/O, and
//! publishes connection phases to subscribers in the order a real host
//! would. The controller talks to it exactly as it would to the real
//! capability; the engine runs against its own store handle, modeling
//! the separate provider process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::RewriteEngine;
use crate::error::{Error, Result};
use crate::host::{
    InterfaceSettings, PacketFamily, Registration, StopReason, TunnelHost, TunnelInterface,
};
use crate::status::HostPhase;
use crate::store::StatusStore;

/// Channel capacity for each direction of the packet flow.
const FLOW_CAPACITY: usize = 64;

type TaggedPacket = (BytesMut, PacketFamily);

/// An in-process host: registration book-keeping, engine launch, and
/// phase notification. Cloning yields another handle to the same
/// host, so a controller can own one while the caller keeps another.
#[derive(Clone)]
pub struct LoopbackHost {
    store_dir: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    registrations: Vec<Registration>,
    subscribers: Vec<mpsc::UnboundedSender<HostPhase>>,
    applied_settings: Option<InterfaceSettings>,
    running: Option<RunningTunnel>,
    tap: Option<TunnelTap>,
}

struct RunningTunnel {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

/// Test/demo access to the running tunnel's packet flow: inject
/// outbound packets, observe what the engine wrote back.
pub struct TunnelTap {
    inject: mpsc::Sender<TaggedPacket>,
    emitted: mpsc::Receiver<TaggedPacket>,
}

impl TunnelTap {
    /// Hand a packet to the engine as the next outbound datagram.
    pub async fn inject(&self, packet: BytesMut, family: PacketFamily) -> Result<()> {
        self.inject
            .send((packet, family))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// The next packet the engine wrote back out, with its family tag.
    pub async fn next_emitted(&mut self) -> Option<TaggedPacket> {
        self.emitted.recv().await
    }
}

impl LoopbackHost {
    /// Create a host whose provider process will persist status under
    /// `store_dir`.
    pub fn new<P: AsRef<Path>>(store_dir: P) -> Self {
        Self {
            store_dir: store_dir.as_ref().to_path_buf(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Take the packet tap for the currently running tunnel, if any.
    pub fn take_tap(&self) -> Option<TunnelTap> {
        self.inner.lock().expect("host lock").tap.take()
    }

    /// Settings the engine registered, once connected.
    pub fn applied_settings(&self) -> Option<InterfaceSettings> {
        self.inner.lock().expect("host lock").applied_settings.clone()
    }

    /// Whether a tunnel task is currently active.
    pub fn is_running(&self) -> bool {
        self.inner.lock().expect("host lock").running.is_some()
    }

    fn publish(inner: &Arc<Mutex<Inner>>, phase: HostPhase) {
        let mut guard = inner.lock().expect("host lock");
        guard.subscribers.retain(|tx| tx.send(phase).is_ok());
    }
}

impl TunnelHost for LoopbackHost {
    async fn load_registrations(&self) -> Result<Vec<Registration>> {
        Ok(self.inner.lock().expect("host lock").registrations.clone())
    }

    async fn save_registration(&self, registration: &Registration) -> Result<()> {
        let mut guard = self.inner.lock().expect("host lock");
        match guard
            .registrations
            .iter_mut()
            .find(|r| r.provider_id == registration.provider_id)
        {
            Some(slot) => *slot = registration.clone(),
            None => guard.registrations.push(registration.clone()),
        }
        Ok(())
    }

    async fn start_tunnel(
        &self,
        registration: &Registration,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        // Resolve the session configuration the way the provider
        // process does on launch: options over store over defaults.
        // Invalid options are a synchronous rejection.
        let provider_store = StatusStore::open(&self.store_dir)?;
        let config = RewriteEngine::resolve_configuration(Some(options), &provider_store)?;
        let engine = RewriteEngine::new(config, provider_store)?;

        let (inject_tx, inject_rx) = mpsc::channel(FLOW_CAPACITY);
        let (emit_tx, emit_rx) = mpsc::channel(FLOW_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut guard = self.inner.lock().expect("host lock");
        if guard.running.is_some() {
            return Err(Error::start_command("tunnel already running"));
        }
        if !guard
            .registrations
            .iter()
            .any(|r| r.provider_id == registration.provider_id && r.enabled)
        {
            return Err(Error::start_command(format!(
                "no enabled registration for {}",
                registration.provider_id
            )));
        }

        let mut iface = ChannelInterface {
            incoming: inject_rx,
            outgoing: emit_tx,
            settings: Arc::clone(&self.inner),
        };

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut engine = engine;
            let result = match engine.establish(&mut iface).await {
                Ok(()) => {
                    LoopbackHost::publish(&inner, HostPhase::Connected);
                    let loop_result = engine.packet_loop(&mut iface, stop_rx).await;
                    loop_result.and(engine.shutdown())
                }
                Err(err) => Err(err),
            };
            // The tunnel is down whichever way the loop ended.
            LoopbackHost::publish(&inner, HostPhase::Disconnected);
            result
        });

        guard.running = Some(RunningTunnel { stop_tx, task });
        guard.tap = Some(TunnelTap {
            inject: inject_tx,
            emitted: emit_rx,
        });
        guard
            .subscribers
            .retain(|tx| tx.send(HostPhase::Connecting).is_ok());
        debug!("Tunnel task launched");
        Ok(())
    }

    async fn stop_tunnel(&self, _registration: &Registration, reason: StopReason) -> Result<()> {
        let running = self.inner.lock().expect("host lock").running.take();
        let Some(running) = running else {
            warn!("Stop requested with no running tunnel");
            return Ok(());
        };

        // Fire-and-forget: signal the engine and return. The task
        // publishes Disconnected on its way out and the waiter cleans
        // up the tap once teardown completes.
        debug!(reason = ?reason, "Stopping tunnel task");
        Self::publish(&self.inner, HostPhase::Disconnecting);
        running.stop_tx.send(true).ok();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _ = running.task.await;
            inner.lock().expect("host lock").tap = None;
        });
        Ok(())
    }

    fn subscribe_phases(&self) -> mpsc::UnboundedReceiver<HostPhase> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().expect("host lock").subscribers.push(tx);
        rx
    }
}

/// The provider-side data path backed by channels.
struct ChannelInterface {
    incoming: mpsc::Receiver<TaggedPacket>,
    outgoing: mpsc::Sender<TaggedPacket>,
    settings: Arc<Mutex<Inner>>,
}

impl TunnelInterface for ChannelInterface {
    async fn apply_settings(&mut self, settings: &InterfaceSettings) -> Result<()> {
        self.settings.lock().expect("host lock").applied_settings = Some(settings.clone());
        Ok(())
    }

    async fn read_packets(&mut self) -> Result<(Vec<BytesMut>, Vec<PacketFamily>)> {
        // Block for the first packet, then drain whatever else is
        // queued into the same batch.
        let (packet, family) = self.incoming.recv().await.ok_or(Error::FlowClosed)?;
        let mut packets = vec![packet];
        let mut families = vec![family];
        while let Ok((packet, family)) = self.incoming.try_recv() {
            packets.push(packet);
            families.push(family);
        }
        Ok((packets, families))
    }

    async fn write_packets(
        &mut self,
        packets: Vec<BytesMut>,
        families: Vec<PacketFamily>,
    ) -> Result<()> {
        for tagged in packets.into_iter().zip(families) {
            self.outgoing
                .send(tagged)
                .await
                .map_err(|_| Error::FlowClosed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TunnelStatus;
    use tempfile::tempdir;

    async fn started_host(dir: &Path) -> (LoopbackHost, mpsc::UnboundedReceiver<HostPhase>) {
        let host = LoopbackHost::new(dir);
        let phases = host.subscribe_phases();
        let registration = Registration::new("test.provider");
        host.save_registration(&registration).await.unwrap();
        host.start_tunnel(&registration, &HashMap::new())
            .await
            .unwrap();
        (host, phases)
    }

    #[tokio::test]
    async fn test_start_publishes_connecting_then_connected() {
        let dir = tempdir().unwrap();
        let (_host, mut phases) = started_host(dir.path()).await;

        assert_eq!(phases.recv().await, Some(HostPhase::Connecting));
        assert_eq!(phases.recv().await, Some(HostPhase::Connected));
    }

    #[tokio::test]
    async fn test_unknown_registration_rejected() {
        let dir = tempdir().unwrap();
        let host = LoopbackHost::new(dir.path());
        let registration = Registration::new("never.saved");
        let result = host.start_tunnel(&registration, &HashMap::new()).await;
        assert!(matches!(result, Err(Error::StartCommand(_))));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = tempdir().unwrap();
        let (host, _phases) = started_host(dir.path()).await;
        let registration = Registration::new("test.provider");
        let result = host.start_tunnel(&registration, &HashMap::new()).await;
        assert!(matches!(result, Err(Error::StartCommand(_))));
    }

    #[tokio::test]
    async fn test_packets_flow_through_engine() {
        let dir = tempdir().unwrap();
        let (host, mut phases) = started_host(dir.path()).await;
        phases.recv().await;
        phases.recv().await; // connected

        let mut tap = host.take_tap().unwrap();
        let mut packet = BytesMut::from(&[0u8; 20][..]);
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&[10, 7, 0, 0]);
        packet[16..20].copy_from_slice(&[10, 7, 0, 1]);
        tap.inject(packet, PacketFamily::Ipv4).await.unwrap();

        let (emitted, family) = tap.next_emitted().await.unwrap();
        assert_eq!(family, PacketFamily::Ipv4);
        assert_eq!(&emitted[12..16], &[10, 7, 0, 1]);
        assert_eq!(&emitted[16..20], &[10, 7, 0, 0]);
    }

    #[tokio::test]
    async fn test_stop_publishes_disconnecting_then_disconnected() {
        let dir = tempdir().unwrap();
        let (host, mut phases) = started_host(dir.path()).await;
        phases.recv().await;
        phases.recv().await;

        let registration = Registration::new("test.provider");
        host.stop_tunnel(&registration, StopReason::UserRequested)
            .await
            .unwrap();

        assert_eq!(phases.recv().await, Some(HostPhase::Disconnecting));
        assert_eq!(phases.recv().await, Some(HostPhase::Disconnected));
        assert!(!host.is_running());

        let store = StatusStore::open(dir.path()).unwrap();
        assert_eq!(store.read_status(), TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_settings_registered_for_device_subnet() {
        let dir = tempdir().unwrap();
        let (host, mut phases) = started_host(dir.path()).await;
        phases.recv().await;
        phases.recv().await;

        let settings = host.applied_settings().unwrap();
        assert_eq!(settings.address.to_string(), "10.7.0.0");
        assert!(settings.excludes_default_route);
    }
}
