//! Packet rewrite engine - the tunnel data plane.
//!
//! Launched by the host with a tunnel configuration, the engine
//! registers the virtual interface settings and then runs the
//! read/rewrite/write loop until cancelled or torn down:
//! - `establish`: persist `Connecting`, register settings, persist
//!   `Connected` (failures persist `Error` and are reported back to
//!   the host by the caller).
//! - `packet_loop`: the continuous batch loop. Cancellation is
//!   explicit - a watch channel whose change unblocks the pending
//!   read.
//! - `shutdown`: persist `Disconnected` on the way out.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::TunnelConfiguration;
use crate::error::Result;
use crate::host::{InterfaceSettings, PacketFamily, TunnelInterface};
use crate::status::TunnelStatus;
use crate::store::StatusStore;

/// Minimum IPv4 header size; shorter packets pass through untouched.
pub const MIN_IPV4_HEADER: usize = 20;

const SRC_OFFSET: usize = 12;
const DST_OFFSET: usize = 16;

/// The packet rewrite engine.
///
/// The 32-bit address forms are converted once at construction, not
/// recomputed per packet.
pub struct RewriteEngine {
    config: TunnelConfiguration,
    device_net: u32,
    fake_net: u32,
    store: StatusStore,
}

impl RewriteEngine {
    /// Create an engine for a resolved configuration.
    pub fn new(config: TunnelConfiguration, store: StatusStore) -> Result<Self> {
        config.validate()?;
        let device_net = config.device_net();
        let fake_net = config.fake_net();
        Ok(Self {
            config,
            device_net,
            fake_net,
            store,
        })
    }

    /// Resolve the session configuration: launch options override the
    /// persisted store fields, which override the defaults - field by
    /// field, the way the provider process does on launch.
    pub fn resolve_configuration(
        options: Option<&HashMap<String, String>>,
        store: &StatusStore,
    ) -> Result<TunnelConfiguration> {
        let persisted = store.read_configuration();
        match options {
            Some(options) => persisted.with_options(options),
            None => Ok(persisted),
        }
    }

    /// The configuration this engine was built with.
    pub fn configuration(&self) -> &TunnelConfiguration {
        &self.config
    }

    /// Bring the virtual interface up.
    ///
    /// Persists `Connecting`, registers the interface settings (device
    /// address and mask, routing only the device subnet), and persists
    /// `Connected`. On registration failure persists `Error` and
    /// returns the failure so the caller can report it to the host; the
    /// packet loop is not entered.
    pub async fn establish<I: TunnelInterface>(&mut self, iface: &mut I) -> Result<()> {
        self.store.write_status(TunnelStatus::Connecting)?;

        let settings = InterfaceSettings::for_configuration(&self.config);
        debug!(
            address = %settings.address,
            mask = %settings.subnet_mask,
            "Registering interface settings"
        );
        if let Err(err) = iface.apply_settings(&settings).await {
            warn!(error = %err, "Interface settings rejected");
            self.store.write_status(TunnelStatus::Error)?;
            return Err(err);
        }

        self.store.write_status(TunnelStatus::Connected)?;
        info!(
            device = %self.config.device_address,
            fake = %self.config.fake_address,
            "Tunnel established"
        );
        Ok(())
    }

    /// Run the packet loop until the stop signal fires or the host
    /// tears the interface down.
    ///
    /// Each iteration acquires the next outbound batch, rewrites the
    /// IPv4 packets in place, writes the batch back with its original
    /// family tags in the original order, and immediately re-issues
    /// the read. The loop has no exit condition of its own.
    pub async fn packet_loop<I: TunnelInterface>(
        &mut self,
        iface: &mut I,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!("Packet loop cancelled");
                        return Ok(());
                    }
                }
                batch = iface.read_packets() => {
                    let (mut packets, families) = batch?;
                    rewrite_batch(&mut packets, &families, self.device_net, self.fake_net);
                    iface.write_packets(packets, families).await?;
                }
            }
        }
    }

    /// Host stop handler: persist `Disconnected`.
    pub fn shutdown(&self) -> Result<()> {
        self.store.write_status(TunnelStatus::Disconnected)?;
        info!("Tunnel shut down");
        Ok(())
    }

    /// Provider entry point: establish, loop, shut down.
    ///
    /// `Disconnected` is persisted on the way out even when the loop
    /// ends with a teardown error, so the store never wedges on
    /// `Connected`.
    pub async fn run<I: TunnelInterface>(
        mut self,
        mut iface: I,
        stop: watch::Receiver<bool>,
    ) -> Result<()> {
        self.establish(&mut iface).await?;
        let result = self.packet_loop(&mut iface, stop).await;
        self.shutdown()?;
        result
    }
}

/// Rewrite one batch in place. Only packets tagged IPv4 and at least
/// one full IPv4 header long are touched.
pub fn rewrite_batch(
    packets: &mut [BytesMut],
    families: &[PacketFamily],
    device_net: u32,
    fake_net: u32,
) {
    for (packet, family) in packets.iter_mut().zip(families) {
        if *family == PacketFamily::Ipv4 && packet.len() >= MIN_IPV4_HEADER {
            rewrite_addresses(packet, device_net, fake_net);
        }
    }
}

/// The address swap at the heart of the tunnel.
///
/// Source and destination live at fixed header offsets (12 and 16),
/// big-endian. Traffic sent from the device identity is re-sourced to
/// the fake identity and reflected back at the device, so packets
/// nominally sent to the device address loop back from the fake
/// address with the reply path restored transparently:
///
/// ```text
/// new_src = if src == device { fake } else { dst }
/// new_dst = if dst == fake { device } else { src }
/// ```
#[inline]
pub fn rewrite_addresses(packet: &mut [u8], device_net: u32, fake_net: u32) {
    debug_assert!(packet.len() >= MIN_IPV4_HEADER);

    let src = u32::from_be_bytes(packet[SRC_OFFSET..SRC_OFFSET + 4].try_into().unwrap());
    let dst = u32::from_be_bytes(packet[DST_OFFSET..DST_OFFSET + 4].try_into().unwrap());

    let new_src = if src == device_net { fake_net } else { dst };
    let new_dst = if dst == fake_net { device_net } else { src };

    packet[SRC_OFFSET..SRC_OFFSET + 4].copy_from_slice(&new_src.to_be_bytes());
    packet[DST_OFFSET..DST_OFFSET + 4].copy_from_slice(&new_dst.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    const DEVICE: u32 = 0x0A07_0000; // 10.7.0.0
    const FAKE: u32 = 0x0A07_0001; // 10.7.0.1

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> BytesMut {
        let mut packet = BytesMut::from(&[0u8; MIN_IPV4_HEADER][..]);
        packet[0] = 0x45;
        packet[SRC_OFFSET..SRC_OFFSET + 4].copy_from_slice(&src);
        packet[DST_OFFSET..DST_OFFSET + 4].copy_from_slice(&dst);
        packet
    }

    fn addrs(packet: &[u8]) -> ([u8; 4], [u8; 4]) {
        (
            packet[SRC_OFFSET..SRC_OFFSET + 4].try_into().unwrap(),
            packet[DST_OFFSET..DST_OFFSET + 4].try_into().unwrap(),
        )
    }

    #[test]
    fn test_device_source_is_resourced_to_fake() {
        // src = device, dst = fake: the canonical loopback flow.
        let mut packet = ipv4_packet([10, 7, 0, 0], [10, 7, 0, 1]);
        rewrite_addresses(&mut packet, DEVICE, FAKE);
        assert_eq!(addrs(&packet), ([10, 7, 0, 1], [10, 7, 0, 0]));
    }

    #[test]
    fn test_swap_rule_general_case() {
        // src = device, dst = arbitrary: source becomes fake, the
        // original source is reflected into the destination.
        let mut packet = ipv4_packet([10, 7, 0, 0], [8, 8, 8, 8]);
        rewrite_addresses(&mut packet, DEVICE, FAKE);
        assert_eq!(addrs(&packet), ([10, 7, 0, 1], [10, 7, 0, 0]));
    }

    #[test]
    fn test_fake_destination_is_restored_to_device() {
        let mut packet = ipv4_packet([10, 7, 0, 5], [10, 7, 0, 1]);
        rewrite_addresses(&mut packet, DEVICE, FAKE);
        assert_eq!(addrs(&packet), ([10, 7, 0, 1], [10, 7, 0, 0]));
    }

    #[test]
    fn test_round_trip_property() {
        // An emitted packet fed back with src/dst swapped maps back to
        // the original addresses.
        let original = ipv4_packet([10, 7, 0, 0], [10, 7, 0, 1]);
        let mut forward = original.clone();
        rewrite_addresses(&mut forward, DEVICE, FAKE);
        let (fwd_src, fwd_dst) = addrs(&forward);

        let mut reply = ipv4_packet(fwd_dst, fwd_src);
        rewrite_addresses(&mut reply, DEVICE, FAKE);
        let (reply_src, reply_dst) = addrs(&reply);
        let (orig_src, orig_dst) = addrs(&original);
        assert_eq!((reply_src, reply_dst), (orig_src, orig_dst));
    }

    #[test]
    fn test_short_packet_untouched() {
        let short = BytesMut::from(&[0x45u8; 19][..]);
        let mut packets = vec![short.clone()];
        rewrite_batch(&mut packets, &[PacketFamily::Ipv4], DEVICE, FAKE);
        assert_eq!(packets[0], short);
    }

    #[test]
    fn test_non_ipv4_untouched() {
        let packet = ipv4_packet([10, 7, 0, 0], [10, 7, 0, 1]);
        let mut packets = vec![packet.clone(), packet.clone()];
        rewrite_batch(
            &mut packets,
            &[PacketFamily::Ipv6, PacketFamily::Other(0)],
            DEVICE,
            FAKE,
        );
        assert_eq!(packets[0], packet);
        assert_eq!(packets[1], packet);
    }

    #[test]
    fn test_batch_preserves_order_and_mixes_families() {
        let a = ipv4_packet([10, 7, 0, 0], [10, 7, 0, 1]);
        let b = BytesMut::from(&b"short"[..]);
        let c = ipv4_packet([10, 7, 0, 5], [10, 7, 0, 1]);
        let mut packets = vec![a, b.clone(), c];
        let families = [PacketFamily::Ipv4, PacketFamily::Ipv4, PacketFamily::Ipv4];
        rewrite_batch(&mut packets, &families, DEVICE, FAKE);

        assert_eq!(addrs(&packets[0]), ([10, 7, 0, 1], [10, 7, 0, 0]));
        assert_eq!(packets[1], b);
        assert_eq!(addrs(&packets[2]), ([10, 7, 0, 1], [10, 7, 0, 0]));
    }

    #[test]
    fn test_resolve_prefers_options_over_store() {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        store
            .write_configuration(&TunnelConfiguration {
                device_address: Ipv4Addr::new(10, 8, 0, 0),
                fake_address: Ipv4Addr::new(10, 8, 0, 1),
                subnet_mask: Ipv4Addr::new(255, 255, 0, 0),
            })
            .unwrap();

        let mut options = HashMap::new();
        options.insert(crate::FAKE_IP_KEY.to_string(), "10.8.0.9".to_string());

        let resolved = RewriteEngine::resolve_configuration(Some(&options), &store).unwrap();
        assert_eq!(resolved.device_address, Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(resolved.fake_address, Ipv4Addr::new(10, 8, 0, 9));
        assert_eq!(resolved.subnet_mask, Ipv4Addr::new(255, 255, 0, 0));
    }

    #[test]
    fn test_resolve_defaults_without_options() {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        let resolved = RewriteEngine::resolve_configuration(None, &store).unwrap();
        assert_eq!(resolved, TunnelConfiguration::default());
    }

    // Minimal in-memory interface for engine-level tests. It snoops
    // the store at settings-registration time so transition ordering
    // is observable.
    struct MockInterface {
        reject_settings: bool,
        applied: Option<InterfaceSettings>,
        store: StatusStore,
        status_at_apply: Option<TunnelStatus>,
        incoming: tokio::sync::mpsc::Receiver<(Vec<BytesMut>, Vec<PacketFamily>)>,
        written: tokio::sync::mpsc::Sender<(Vec<BytesMut>, Vec<PacketFamily>)>,
    }

    fn mock_interface(
        reject_settings: bool,
        store: StatusStore,
    ) -> (
        MockInterface,
        tokio::sync::mpsc::Sender<(Vec<BytesMut>, Vec<PacketFamily>)>,
        tokio::sync::mpsc::Receiver<(Vec<BytesMut>, Vec<PacketFamily>)>,
    ) {
        let (in_tx, in_rx) = tokio::sync::mpsc::channel(8);
        let (out_tx, out_rx) = tokio::sync::mpsc::channel(8);
        (
            MockInterface {
                reject_settings,
                applied: None,
                store,
                status_at_apply: None,
                incoming: in_rx,
                written: out_tx,
            },
            in_tx,
            out_rx,
        )
    }

    impl TunnelInterface for MockInterface {
        async fn apply_settings(&mut self, settings: &InterfaceSettings) -> Result<()> {
            self.status_at_apply = Some(self.store.read_status());
            if self.reject_settings {
                return Err(Error::settings("rejected by test"));
            }
            self.applied = Some(settings.clone());
            Ok(())
        }

        async fn read_packets(&mut self) -> Result<(Vec<BytesMut>, Vec<PacketFamily>)> {
            self.incoming.recv().await.ok_or(Error::FlowClosed)
        }

        async fn write_packets(
            &mut self,
            packets: Vec<BytesMut>,
            families: Vec<PacketFamily>,
        ) -> Result<()> {
            self.written
                .send((packets, families))
                .await
                .map_err(|_| Error::ChannelClosed)
        }
    }

    #[tokio::test]
    async fn test_establish_persists_connecting_then_connected() {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();

        let mut engine =
            RewriteEngine::new(TunnelConfiguration::default(), store.clone()).unwrap();
        let (mut iface, _in_tx, _out_rx) = mock_interface(false, store.clone());
        engine.establish(&mut iface).await.unwrap();

        // Connecting was persisted before settings registration,
        // Connected only after.
        assert_eq!(iface.status_at_apply, Some(TunnelStatus::Connecting));
        assert_eq!(store.read_status(), TunnelStatus::Connected);
        let applied = iface.applied.unwrap();
        assert_eq!(applied.address, Ipv4Addr::new(10, 7, 0, 0));
    }

    #[tokio::test]
    async fn test_establish_failure_persists_error() {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        let mut engine =
            RewriteEngine::new(TunnelConfiguration::default(), store.clone()).unwrap();
        let (mut iface, _in_tx, _out_rx) = mock_interface(true, store.clone());

        assert!(engine.establish(&mut iface).await.is_err());
        assert_eq!(store.read_status(), TunnelStatus::Error);
    }

    #[tokio::test]
    async fn test_run_rewrites_and_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        let engine = RewriteEngine::new(TunnelConfiguration::default(), store.clone()).unwrap();
        let (iface, in_tx, mut out_rx) = mock_interface(false, store.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(engine.run(iface, stop_rx));

        let packet = ipv4_packet([10, 7, 0, 0], [10, 7, 0, 1]);
        in_tx
            .send((vec![packet], vec![PacketFamily::Ipv4]))
            .await
            .unwrap();

        let (written, families) = out_rx.recv().await.unwrap();
        assert_eq!(families, vec![PacketFamily::Ipv4]);
        assert_eq!(addrs(&written[0]), ([10, 7, 0, 1], [10, 7, 0, 0]));

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(store.read_status(), TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_run_flow_teardown_still_disconnects() {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        let engine = RewriteEngine::new(TunnelConfiguration::default(), store.clone()).unwrap();
        let (iface, in_tx, _out_rx) = mock_interface(false, store.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(engine.run(iface, stop_rx));
        drop(in_tx); // host tears the flow down
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::FlowClosed)));
        assert_eq!(store.read_status(), TunnelStatus::Disconnected);
    }
}
