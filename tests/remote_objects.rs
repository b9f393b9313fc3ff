//! End-to-end remote-object scenarios over the loopback fabric: remote
//! pulls, token fan-out, over-release, peer crash, and shutdown drains.

mod fixtures;

use bytes::Bytes;
use rand::RngCore;
use weft_rs::codec::{Codable, CodecError, Decoder, Encoder, decode};
use weft_rs::config::Config;
use weft_rs::core::InstanceId;
use weft_rs::memory::BlockView;
use weft_rs::remote::{ManagerError, encode_decrement};

use fixtures::{DRAIN_TIMEOUT, Rig, wait_until};

const TRANSFER_TAG: u64 = 0x7EF7;

/// Bulk payload that is always written as a remote-buffer descriptor and
/// decoded into a preallocated destination buffer.
#[derive(Debug, PartialEq, Eq)]
struct BulkPayload(Vec<u8>);

impl Codable for BulkPayload {
    const TYPE_NAME: &'static str = "tests.bulk_payload";

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        let view = BlockView::host(Bytes::copy_from_slice(&self.0));
        encoder.write_remote(&view, false)?;
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        let len = decoder.next_len()? as usize;
        let mut destination = vec![0u8; len];
        decoder.read_remote_into(&mut destination)?;
        Ok(BulkPayload(destination))
    }
}

#[test]
fn remote_pull_and_release_drains_producer() {
    let rig = Rig::new(2);
    let a = rig.node(0);
    let b = rig.node(1);

    let mut payload = vec![0u8; 4 * 1024 * 1024];
    rand::rng().fill_bytes(&mut payload);
    let checksum = crc32c::crc32c(&payload);

    let handle = a.publish_value(&BulkPayload(payload), 1).unwrap();
    assert_eq!(handle.tokens(), 1);
    assert_eq!(a.manager().size(), 1);

    let send = a
        .send_transfer(handle, b.instance_id(), TRANSFER_TAG)
        .unwrap();
    let (remote_handle, layout) = b.receive_transfer(TRANSFER_TAG).unwrap();
    assert!(send.wait().is_ok());
    assert_eq!(remote_handle.instance(), a.instance_id());
    assert_eq!(remote_handle.tokens(), 1);

    // Pull the 4 MiB payload one-sidedly into a preallocated buffer.
    let source = b.manager().pull_source(a.instance_id()).unwrap();
    let pulled: BulkPayload = decode(&layout, &source).unwrap();
    assert_eq!(crc32c::crc32c(&pulled.0), checksum);

    drop(remote_handle);

    assert!(
        wait_until(DRAIN_TIMEOUT, || a.manager().size() == 0),
        "producer store should drain after the remote release"
    );
    assert_eq!(a.provider().registration_count(), 0);

    rig.shutdown();
}

#[test]
fn token_fan_out_releases_once() {
    let rig = Rig::new(4);
    let a = rig.node(0);

    let mut handle = a
        .publish_value(&Bytes::from_static(b"fan-out payload"), 3)
        .unwrap();
    let object_id = handle.object();

    let first = handle.split(1).unwrap();
    let second = handle.split(1).unwrap();
    assert_eq!(handle.tokens(), 1);

    for (index, sub_handle) in [first, second, handle].into_iter().enumerate() {
        let peer = rig.node(index + 1);
        let send = a
            .send_transfer(sub_handle, peer.instance_id(), TRANSFER_TAG + index as u64)
            .unwrap();
        let (received, _layout) = peer.receive_transfer(TRANSFER_TAG + index as u64).unwrap();
        assert!(send.wait().is_ok());
        assert_eq!(received.tokens(), 1);
        drop(received);
    }

    assert!(
        wait_until(DRAIN_TIMEOUT, || a.manager().size() == 0),
        "three single-token releases should erase the object exactly once"
    );
    assert!(matches!(
        a.manager().lookup(object_id),
        Err(ManagerError::NotFound { .. })
    ));

    rig.shutdown();
}

#[test]
fn duplicate_decrement_is_an_over_release() {
    let rig = Rig::new(2);
    let a = rig.node(0);
    let b = rig.node(1);

    let handle = a.publish_value(&7u32, 1).unwrap();
    let object_id = handle.object();

    let send = a
        .send_transfer(handle, b.instance_id(), TRANSFER_TAG)
        .unwrap();
    let (received, _layout) = b.receive_transfer(TRANSFER_TAG).unwrap();
    assert!(send.wait().is_ok());

    // Legitimate release.
    drop(received);
    assert!(wait_until(DRAIN_TIMEOUT, || a.manager().size() == 0));

    // The buggy duplicate: a second decrement of 1 for the same id.
    let endpoint = b.manager().peer_endpoint(a.instance_id()).unwrap();
    let payload = Bytes::copy_from_slice(&encode_decrement(object_id, 1));
    let request =
        b.data_plane()
            .send_active_message(&endpoint, b.config().active_message_id, payload);
    assert!(request.wait().is_ok());

    // The id stays poisoned: lookups miss, further decrements are
    // over-releases.
    assert!(wait_until(DRAIN_TIMEOUT, || {
        matches!(
            a.manager().decrement(object_id, 1, None),
            Err(ManagerError::OverRelease { .. })
        )
    }));
    assert!(matches!(
        a.manager().lookup(object_id),
        Err(ManagerError::NotFound { .. })
    ));

    rig.shutdown();
}

#[test]
fn peer_crash_releases_ledger_tokens() {
    let rig = Rig::new(2);
    let a = rig.node(0);
    let b = rig.node(1);

    let handle = a
        .publish_value(&Bytes::from(vec![5u8; 2048]), 1)
        .unwrap();

    let send = a
        .send_transfer(handle, b.instance_id(), TRANSFER_TAG)
        .unwrap();
    let (received, _layout) = b.receive_transfer(TRANSFER_TAG).unwrap();
    assert!(send.wait().is_ok());
    assert_eq!(a.manager().size(), 1);

    // B dies holding the only outstanding token. Its handle must not
    // emit a decrement through a dead worker.
    std::mem::forget(received);
    rig.fabric.kill(&b.address());

    // A subsequent send surfaces PeerGone.
    let endpoint = a.manager().peer_endpoint(b.instance_id()).unwrap();
    let probe = a
        .data_plane()
        .send_async(&endpoint, Bytes::from_static(b"ping"), 1);
    assert!(matches!(
        probe.wait(),
        Err(weft_rs::DataPlaneError::PeerGone { .. })
    ));

    // The ledger attributes the token to B; releasing it drains the
    // store.
    let erased = a.manager().peer_gone(b.instance_id());
    assert_eq!(erased, 1);
    assert_eq!(a.manager().size(), 0);
    assert_eq!(a.provider().registration_count(), 0);

    rig.shutdown();
}

#[test]
fn concurrent_final_decrement_and_lookup_never_dangle() {
    let rig = Rig::new(1);
    let a = rig.node(0);

    for _ in 0..50 {
        let handle = a.publish_value(&Bytes::from(vec![1u8; 64]), 1).unwrap();
        let object_id = handle.object();
        let manager = a.manager().clone();

        let reader = std::thread::spawn(move || {
            loop {
                match manager.lookup(object_id) {
                    Ok(object) => {
                        // A successful lookup must return a live object.
                        assert!(object.descriptor_count() > 0);
                    }
                    Err(ManagerError::NotFound { .. }) => return,
                    Err(other) => panic!("unexpected lookup error: {other}"),
                }
            }
        });

        drop(handle);
        assert!(wait_until(DRAIN_TIMEOUT, || a.manager().size() == 0));
        reader.join().expect("lookup thread");
    }

    rig.shutdown();
}

#[test]
fn flush_on_idle_worker_reports_no_work() {
    let rig = Rig::new(1);
    let a = rig.node(0);
    assert_eq!(a.data_plane().flush(), 0);
    assert_eq!(a.data_plane().flush(), 0);
    rig.shutdown();
}

#[test]
fn shutdown_with_outstanding_objects_forces_release() {
    let config = Config {
        decrement_channel_capacity: 4,
        ..Config::default()
    };
    let rig = Rig::with_config(2, config);
    let a = rig.node(0);
    let b = rig.node(1);

    let handle = a.publish_value(&1u64, 2).unwrap();
    let send = a
        .send_transfer(handle, b.instance_id(), TRANSFER_TAG)
        .unwrap();
    let (received, _layout) = b.receive_transfer(TRANSFER_TAG).unwrap();
    assert!(send.wait().is_ok());

    // B never releases; A's shutdown must still drain its table.
    std::mem::forget(received);
    assert_eq!(a.manager().size(), 1);

    rig.shutdown();
    assert_eq!(a.manager().size(), 0);
}

#[test]
fn oversized_transfer_fails_without_corrupting_accounting() {
    use weft_rs::core::Limits;
    use weft_rs::runtime::Runtime;
    use weft_rs::test_harness::LoopbackFabric;

    let fabric = LoopbackFabric::new();
    let config = Config {
        limits: Limits {
            max_frame_bytes: 64,
            ..Limits::default()
        },
        ..Config::default()
    };
    // Unstarted runtimes: releases apply inline, so the accounting
    // checks below are deterministic.
    let a = Runtime::build(config.clone(), InstanceId::new(1), fabric.create_worker());
    let b = Runtime::build(config, InstanceId::new(2), fabric.create_worker());
    a.add_peer(b.instance_id(), &b.address()).unwrap();

    let mut handle = a
        .publish_value(&Bytes::from(vec![7u8; 512]), 2)
        .unwrap();
    let object_id = handle.object();

    let split = handle.split(1).unwrap();
    let err = a
        .send_transfer(split, b.instance_id(), TRANSFER_TAG)
        .unwrap_err();
    assert!(matches!(
        err,
        weft_rs::Error::Manager(ManagerError::Transfer(_))
    ));

    // The failed export released its token locally and credited the
    // peer with nothing: peer_gone finds no ledger entry and must not
    // over-release the object out of existence.
    assert!(a.manager().lookup(object_id).is_ok());
    assert_eq!(a.manager().peer_gone(b.instance_id()), 0);
    assert!(a.manager().lookup(object_id).is_ok());

    // The one remaining token still accounts for the object exactly.
    drop(handle);
    assert_eq!(a.manager().size(), 0);
}

#[test]
fn transfer_survives_wire_round_trip_with_eager_payloads() {
    let rig = Rig::new(2);
    let a = rig.node(0);
    let b = rig.node(1);

    let value = vec![(1u32, "alpha".to_string()), (2u32, "beta".to_string())];
    let handle = a.publish_value(&value, 1).unwrap();

    let send = a
        .send_transfer(handle, b.instance_id(), TRANSFER_TAG)
        .unwrap();
    let (received, layout) = b.receive_transfer(TRANSFER_TAG).unwrap();
    assert!(send.wait().is_ok());

    // Everything is eager here, so no pulls are needed on the consumer.
    let decoded: Vec<(u32, String)> = weft_rs::codec::decode_local(&layout).unwrap();
    assert_eq!(decoded, value);

    drop(received);
    assert!(wait_until(DRAIN_TIMEOUT, || a.manager().size() == 0));

    rig.shutdown();
}

#[test]
fn instance_identity_flows_through_transfer() {
    let rig = Rig::new(2);
    let a = rig.node(0);
    let b = rig.node(1);

    let handle = a.publish_value(&9u32, 1).unwrap();
    assert_eq!(handle.instance(), InstanceId::new(1));

    let send = a
        .send_transfer(handle, b.instance_id(), TRANSFER_TAG)
        .unwrap();
    let (received, layout) = b.receive_transfer(TRANSFER_TAG).unwrap();
    assert!(send.wait().is_ok());

    assert_eq!(received.instance(), a.instance_id());
    assert_eq!(layout.instance(), a.instance_id());

    drop(received);
    assert!(wait_until(DRAIN_TIMEOUT, || a.manager().size() == 0));
    rig.shutdown();
}
