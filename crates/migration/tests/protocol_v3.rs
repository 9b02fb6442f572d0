//! End-to-end runs of the v3 peer-to-peer protocol against a bridged
//! destination daemon
mod support;

use migration::domain::{
    DomainEventKind, DomainState, ResumedDetail, StartedDetail, StoppedDetail, SuspendedDetail,
};
use migration::remote::PeerFeature;
use monitor_sdk::dto::MonitorFeature;
use shared::cookie::{Cookie, CookieFlags};
use shared::flags::MigrateFlags;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::*;

const ALL_PEER_FEATURES: &[PeerFeature] = &[
    PeerFeature::Peer2Peer,
    PeerFeature::V3,
    PeerFeature::MigrationParams,
    PeerFeature::OfflineMigration,
];

#[tokio::test]
async fn native_v3_happy_path_moves_the_guest() {
    let source = daemon("src.example.org", &[MonitorFeature::SeamlessGraphics]);
    let dest = daemon("dst.example.org", &[]);
    let bridge = PeerBridge::new(dest.coordinator.clone(), ALL_PEER_FEATURES);
    source.connector.set(bridge.clone());

    let monitor = MockMonitor::new(&[MonitorFeature::SeamlessGraphics]);
    let domain = running_domain(&source, spice_guest("guest"), monitor.clone()).await;

    let mut source_events = source.registry.subscribe();
    let mut dest_events = dest.registry.subscribe();

    let cookie_out = source
        .coordinator
        .perform(
            &domain,
            None,
            Some("tcp://dst.example.org/system"),
            None,
            None,
            MigrateFlags::LIVE | MigrateFlags::PEER2PEER | MigrateFlags::CHANGE_PROTECTION,
            None,
            0,
            false,
            None,
        )
        .await
        .unwrap();
    assert!(cookie_out.is_none());

    // the Begin cookie advertised lockstate as mandatory
    let begin_cookie = bridge.prepare_cookies.lock().unwrap()[0].clone();
    let dest_identity = dest.coordinator.identity().clone();
    let guest_identity = {
        let inner = domain.lock().await;
        inner.guest_identity()
    };
    let eaten = Cookie::decode(
        &begin_cookie,
        &guest_identity,
        &dest_identity,
        CookieFlags::all(),
    )
    .unwrap();
    assert!(eaten.mandatory.contains(CookieFlags::LOCKSTATE));
    assert!(eaten.lockstate.is_some());

    // the Prepare reply carried the destination's graphics endpoint
    let reply_cookie = bridge.reply_cookies.lock().unwrap()[0].clone();
    let source_identity = source.coordinator.identity().clone();
    let reply = Cookie::decode(
        &reply_cookie,
        &guest_identity,
        &source_identity,
        CookieFlags::all(),
    )
    .unwrap();
    assert_eq!(reply.graphics.as_ref().unwrap().port, 5901);

    // source stopped exactly once, destination started then resumed
    let source_kinds: Vec<_> = drain_events(&mut source_events)
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert!(source_kinds.contains(&DomainEventKind::Suspended(SuspendedDetail::Migrated)));
    assert_eq!(
        source_kinds
            .iter()
            .filter(|kind| **kind == DomainEventKind::Stopped(StoppedDetail::Migrated))
            .count(),
        1
    );

    let dest_kinds: Vec<_> = drain_events(&mut dest_events)
        .into_iter()
        .map(|event| event.kind)
        .collect();
    let started = dest_kinds
        .iter()
        .position(|kind| *kind == DomainEventKind::Started(StartedDetail::Migrated))
        .unwrap();
    let resumed = dest_kinds
        .iter()
        .position(|kind| *kind == DomainEventKind::Resumed(ResumedDetail::Migrated))
        .unwrap();
    assert!(started < resumed);

    // terminal states on both ends
    assert_eq!(domain.lock().await.state, DomainState::Shutoff);
    let landed = dest.registry.lookup_by_name("guest").await.unwrap();
    assert_eq!(landed.lock().await.state, DomainState::Running);
    assert!(monitor.took("client-migrate-info"));
    assert!(monitor.took("migrate-to-host dst.example.org:49152"));
}

#[tokio::test]
async fn tunnelled_v3_relays_the_whole_stream() {
    const RAM_BYTES: usize = 256 * 1024;

    let source = daemon("src.example.org", &[]);
    let dest = daemon("dst.example.org", &[]);
    let bridge = PeerBridge::new(dest.coordinator.clone(), ALL_PEER_FEATURES);
    source.connector.set(bridge.clone());

    let monitor = MockMonitor::with_ram(&[MonitorFeature::FdMigration], RAM_BYTES);
    let domain = running_domain(&source, spice_guest("guest"), monitor.clone()).await;

    source
        .coordinator
        .perform(
            &domain,
            None,
            Some("tcp://dst.example.org/system"),
            None,
            None,
            MigrateFlags::LIVE | MigrateFlags::PEER2PEER | MigrateFlags::TUNNELLED,
            None,
            0,
            false,
            None,
        )
        .await
        .unwrap();

    // destination hypervisor was launched reading from standard input
    assert_eq!(dest.process.launched.lock().unwrap().as_slice(), ["stdio"]);

    // the worker moved at least the guest's RAM and finished cleanly
    let stream = bridge.tunnel_stream.lock().unwrap().clone().unwrap();
    assert!(stream.sent.load(Ordering::SeqCst) >= RAM_BYTES);
    assert!(stream.finished.load(Ordering::SeqCst));
    assert!(!stream.aborted.load(Ordering::SeqCst));

    // every relayed byte arrived at the destination guest
    let expected = stream.sent.load(Ordering::SeqCst);
    for _ in 0..200 {
        if dest.process.stdio_bytes.load(Ordering::SeqCst) == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dest.process.stdio_bytes.load(Ordering::SeqCst), expected);

    // no NBD server takes part in a tunnelled migration
    assert_eq!(dest.ports.nbd_in_use(), 0);
    for dest_monitor in dest.process.monitors.lock().unwrap().iter() {
        assert!(!dest_monitor.took("nbd-server-start"));
    }
}

#[tokio::test]
async fn old_hypervisors_tunnel_through_a_unix_socket() {
    const RAM_BYTES: usize = 128 * 1024;

    let socket_dir = tempfile::tempdir().unwrap();
    let mut config = migration::coordinator::DriverConfig::default();
    config.tunnel_socket_dir = socket_dir.path().to_path_buf();

    let source = daemon_with_config("src.example.org", &[], config);
    let dest = daemon("dst.example.org", &[]);
    let bridge = PeerBridge::new(dest.coordinator.clone(), ALL_PEER_FEATURES);
    source.connector.set(bridge.clone());

    // a hypervisor that cannot take a pre-opened descriptor falls back to
    // a listening unix socket
    let monitor = MockMonitor::with_ram(&[MonitorFeature::UnixMigration], RAM_BYTES);
    let domain = running_domain(&source, spice_guest("guest"), monitor.clone()).await;

    source
        .coordinator
        .perform(
            &domain,
            None,
            Some("tcp://dst.example.org/system"),
            None,
            None,
            MigrateFlags::LIVE | MigrateFlags::PEER2PEER | MigrateFlags::TUNNELLED,
            None,
            0,
            false,
            None,
        )
        .await
        .unwrap();

    assert!(monitor.took("migrate-to-unix"));
    let stream = bridge.tunnel_stream.lock().unwrap().clone().unwrap();
    assert!(stream.sent.load(Ordering::SeqCst) >= RAM_BYTES);
    assert!(stream.finished.load(Ordering::SeqCst));

    // the socket was cleaned up behind the transfer
    assert!(!socket_dir.path().join("tunnelmigrate.src.guest").exists());
}

#[tokio::test]
async fn non_shared_disk_is_precopied_over_nbd() {
    let source = daemon("src.example.org", &[]);
    let dest = daemon("dst.example.org", &[MonitorFeature::NbdServer]);
    let bridge = PeerBridge::new(dest.coordinator.clone(), ALL_PEER_FEATURES);
    source.connector.set(bridge.clone());

    let monitor = MockMonitor::new(&[MonitorFeature::NbdServer]);
    let domain = running_domain(&source, disk_guest("guest"), monitor.clone()).await;

    source
        .coordinator
        .perform(
            &domain,
            None,
            Some("tcp://dst.example.org/system"),
            None,
            None,
            MigrateFlags::LIVE | MigrateFlags::PEER2PEER | MigrateFlags::NON_SHARED_DISK,
            None,
            0,
            false,
            None,
        )
        .await
        .unwrap();

    // destination allocated one port and exported the disk
    let dest_monitor = dest.process.monitors.lock().unwrap()[0].clone();
    assert!(dest_monitor.took("nbd-server-start 0.0.0.0:49216"));
    assert!(dest_monitor.took("nbd-server-add drive-ide0-0-0 writable=true"));

    // the mirror reused the destination image and reached sync
    let commands = monitor.commands_snapshot();
    let mirror = commands
        .iter()
        .find(|command| command.starts_with("drive-mirror"))
        .unwrap();
    assert!(mirror.contains("nbd:dst.example.org:49216:exportname=drive-ide0-0-0"));
    assert!(mirror.contains("REUSE_EXT"));

    // the main migration no longer ships block data itself
    let migrate = commands
        .iter()
        .find(|command| command.starts_with("migrate-to-host"))
        .unwrap();
    assert!(!migrate.contains("NON_SHARED"));

    // mirrors are cancelled at handover, the NBD server is gone and the
    // port went back to the pool
    assert!(monitor.took("block-job-abort drive-ide0-0-0"));
    assert!(dest_monitor.took("nbd-server-stop"));
    assert_eq!(dest.ports.nbd_in_use(), 0);
}

#[tokio::test]
async fn direct_vports_are_reassociated_on_the_destination() {
    let source = daemon("src.example.org", &[]);
    let dest = daemon("dst.example.org", &[]);
    let bridge = PeerBridge::new(dest.coordinator.clone(), ALL_PEER_FEATURES);
    source.connector.set(bridge.clone());

    let monitor = MockMonitor::new(&[]);
    let domain = running_domain(&source, direct_nic_guest("guest"), monitor).await;

    source
        .coordinator
        .perform(
            &domain,
            None,
            Some("tcp://dst.example.org/system"),
            None,
            None,
            MigrateFlags::LIVE | MigrateFlags::PEER2PEER,
            None,
            0,
            false,
            None,
        )
        .await
        .unwrap();

    // every directly attached interface was bound to the local switch, in
    // definition order, and nothing was unwound
    assert_eq!(
        dest.vports.events_snapshot(),
        ["associate vnet0", "associate vnet1"]
    );

    // the opaque per-port state arrived with the cookie
    let landed = dest.registry.lookup_by_name("guest").await.unwrap();
    let inner = landed.lock().await;
    assert_eq!(
        inner.def.nets[0].portdata.as_deref(),
        Some("{\"profileid\":\"guest-a\"}")
    );
    assert_eq!(inner.def.nets[1].portdata, None);
}

#[tokio::test]
async fn compressed_migration_needs_support_on_both_ends() {
    let source = daemon("src.example.org", &[]);
    let dest = daemon("dst.example.org", &[]);
    let bridge = PeerBridge::new(dest.coordinator.clone(), ALL_PEER_FEATURES);
    source.connector.set(bridge.clone());

    let monitor = MockMonitor::new(&[]);
    let domain = running_domain(&source, spice_guest("guest"), monitor.clone()).await;

    source
        .coordinator
        .perform(
            &domain,
            None,
            Some("tcp://dst.example.org/system"),
            None,
            None,
            MigrateFlags::LIVE | MigrateFlags::PEER2PEER | MigrateFlags::COMPRESSED,
            None,
            0,
            false,
            None,
        )
        .await
        .unwrap();

    assert!(monitor.took("set-capability Xbzrle=true"));
}
