// SPDX-License-Identifier: BSD-3-Clause-LBNL
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::constants::*;
use crate::defrag::testutil::{fragments, pattern, FlowSpec};
use crate::defrag::{CollectorOptions, DefragOptions, FragmentType, FullPacket};
use crate::errors::{DetectError, Error};
use crate::manager::{LifecycleState, Manager};
use crate::metrics;

fn options(collectors: usize) -> DefragOptions {
    DefragOptions {
        pick_types: FragmentType::ALL.to_vec(),
        collector: CollectorOptions {
            collectors,
            sweep_interval: Duration::from_millis(100),
            ..CollectorOptions::default()
        },
    }
}

fn started(options: DefragOptions) -> Manager {
    let manager = Manager::new(options).unwrap();
    manager.start().unwrap();
    manager
}

async fn feed(manager: &Manager, frames: &[Vec<u8>]) {
    for (i, frame) in frames.iter().enumerate() {
        manager.process_packet(frame, i as u64).await.unwrap();
    }
}

/// Pops until `expected` packets arrived or a second passed.
async fn drain(manager: &Manager, expected: usize) -> Vec<FullPacket> {
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(1);
    while out.len() < expected && Instant::now() < deadline {
        out.extend(manager.pop_full_packets(expected - out.len()).unwrap());
        sleep(Duration::from_millis(2)).await;
    }
    out
}

/// Gives the collectors a moment, then asserts nothing came out.
async fn assert_nothing_out(manager: &Manager) {
    sleep(Duration::from_millis(50)).await;
    assert!(manager.pop_full_packets(16).unwrap().is_empty());
}

#[tokio::test]
async fn two_fragments_reassemble() {
    let manager = started(options(2));
    let flow = FlowSpec::v4(0x1234);
    let a = pattern(96);
    let b = vec![0xB0u8; 50];
    feed(
        &manager,
        &[
            flow.fragment(0, true, &a),
            flow.fragment(12, false, &b),
        ],
    )
    .await;

    let packets = drain(&manager, 1).await;
    assert_eq!(packets.len(), 1);
    let packet = &packets[0];
    assert_eq!(*packet.group_id(), flow.group_id());
    assert_eq!(packet.mark(), 1);

    let ip = &packet.bytes()[ETH_HEADER_SIZE..];
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    assert_eq!(total_len, IPV4_HEADER_SIZE + 146);
    let mut expected = a.clone();
    expected.extend_from_slice(&b);
    assert_eq!(packet.payload(), expected.as_slice());
    assert_eq!(packet.view.src_ip, flow.src);
    assert_eq!(packet.view.dst_ip, flow.dst);
    assert_eq!(packet.view.protocol, flow.protocol);
    assert_eq!(packet.view.src_mac, flow.src_mac.to_string());

    manager.shutdown().await;
}

#[tokio::test]
async fn overlap_that_leaves_a_gap_never_completes() {
    let manager = started(options(1));
    let flow = FlowSpec::v4(0x4321);
    // 100 bytes at offset 0 run past the second fragment's offset of 96
    feed(
        &manager,
        &[
            flow.fragment(0, true, &[1u8; 100]),
            flow.fragment(12, false, &[2u8; 50]),
        ],
    )
    .await;
    assert_nothing_out(&manager).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn any_arrival_order_yields_offset_ordered_payload() {
    let manager = started(options(3));
    let payload = pattern(1000);
    let flows = [
        FlowSpec::v4(100),
        FlowSpec::v4(101),
        FlowSpec::v6(102),
        FlowSpec::v6(103).with_extensions(vec![(IPV6_NEXT_HOP_BY_HOP, 0), (IPV6_NEXT_ROUTING, 2)]),
    ];

    for (n, flow) in flows.iter().enumerate() {
        let mut frames = fragments(flow, &payload, 128);
        assert_eq!(frames.len(), 8);
        match n % 3 {
            0 => frames.reverse(),
            1 => frames.rotate_left(3),
            _ => {
                let (even, odd): (Vec<_>, Vec<_>) =
                    frames.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
                frames = odd.into_iter().chain(even).map(|(_, f)| f).collect();
            }
        }
        feed(&manager, &frames).await;
    }

    let packets = drain(&manager, flows.len()).await;
    assert_eq!(packets.len(), flows.len());
    let seen: HashSet<_> = packets.iter().map(|p| *p.group_id()).collect();
    for flow in &flows {
        assert!(seen.contains(&flow.group_id()));
    }
    for packet in &packets {
        assert_eq!(packet.payload(), payload.as_slice());
        assert_eq!(packet.view.payload_len, payload.len());
        if packet.view.ip_version == 6 {
            assert_eq!(packet.bytes().len(), ETH_IPV6_HEADER_SIZE + payload.len());
        } else {
            assert_eq!(packet.bytes().len(), ETH_IPV4_HEADER_SIZE + payload.len());
        }
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn duplicate_offset_keeps_first_payload() {
    let manager = started(options(1));
    let flow = FlowSpec::v6(77);
    let before = metrics::FRAGMENTS_DUPLICATE.get();
    feed(
        &manager,
        &[
            flow.fragment(0, true, &[0xAA; 64]),
            flow.fragment(0, true, &[0xEE; 64]),
            flow.fragment(8, false, &[0xBB; 8]),
        ],
    )
    .await;

    let packets = drain(&manager, 1).await;
    assert_eq!(packets.len(), 1);
    let payload = packets[0].payload();
    assert_eq!(payload.len(), 72);
    assert!(payload[..64].iter().all(|&b| b == 0xAA));
    assert!(payload[64..].iter().all(|&b| b == 0xBB));
    assert!(metrics::FRAGMENTS_DUPLICATE.get() >= before + 1.0);
    manager.shutdown().await;
}

#[tokio::test]
async fn ethernet_padding_is_not_payload() {
    let manager = started(options(1));
    let flow = FlowSpec::v4(9);
    let mut first = flow.fragment(0, true, &[1u8; 16]);
    let mut last = flow.fragment(2, false, &[2u8; 4]);
    first.extend_from_slice(&[0u8; 6]);
    last.extend_from_slice(&[0u8; 22]);
    feed(&manager, &[first, last]).await;

    let packets = drain(&manager, 1).await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].payload().len(), 20);
    assert_eq!(packets[0].bytes().len(), ETH_IPV4_HEADER_SIZE + 20);
    manager.shutdown().await;
}

#[tokio::test]
async fn pop_returns_completion_order_and_respects_max() {
    let manager = started(options(1));
    for ident in 1..=5u32 {
        let flow = FlowSpec::v4(ident);
        feed(&manager, &fragments(&flow, &pattern(40), 16)).await;
        // wait for this group before sending the next so the order is known
        while manager.pending_full_packets() < ident as usize {
            sleep(Duration::from_millis(1)).await;
        }
    }

    let first = manager.pop_full_packets(2).unwrap();
    assert_eq!(first.len(), 2);
    let rest = manager.pop_full_packets(10).unwrap();
    assert_eq!(rest.len(), 3);
    let idents: Vec<u32> = first
        .iter()
        .chain(rest.iter())
        .map(|p| p.group_id().identification)
        .collect();
    assert_eq!(idents, vec![1, 2, 3, 4, 5]);
    assert!(manager.pop_full_packets(10).unwrap().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn flows_spread_over_shards_all_complete() {
    let manager = started(options(4));
    let payload = pattern(300);
    let mut frames = Vec::new();
    for i in 0..40u8 {
        let flow = FlowSpec::v4(500 + i as u32).with_src(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)));
        frames.extend(fragments(&flow, &payload, 64));
    }
    feed(&manager, &frames).await;

    let packets = drain(&manager, 40).await;
    assert_eq!(packets.len(), 40);
    assert!(packets.iter().all(|p| p.payload() == payload.as_slice()));
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn expired_group_is_released_and_never_popped() {
    let mut opts = options(1);
    opts.collector.group_expiry = Duration::from_secs(1);
    let manager = started(opts);
    let flow = FlowSpec::v4(31);
    let before = metrics::GROUPS_EXPIRED.get();

    feed(&manager, &[flow.fragment(0, true, &[1u8; 96])]).await;
    sleep(Duration::from_secs(2)).await;
    assert!(manager.pop_full_packets(4).unwrap().is_empty());
    assert!(metrics::GROUPS_EXPIRED.get() >= before + 1.0);

    // the first half is gone, so the second half alone cannot complete
    feed(&manager, &[flow.fragment(12, false, &[2u8; 50])]).await;
    sleep(Duration::from_millis(200)).await;
    assert!(manager.pop_full_packets(4).unwrap().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn callback_sees_fragments_only() {
    let manager = started(options(2));
    let flow = FlowSpec::v4(41);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let unfragmented = flow.fragment(0, false, &[0u8; 32]);
    let frag = flow.fragment(0, true, &[0u8; 32]);
    for frame in [&unfragmented, &frag] {
        let seen = seen.clone();
        manager
            .process_packet_with(frame, 0, move |id| seen.lock().unwrap().push(*id))
            .await
            .unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec![flow.group_id()]);
    assert_nothing_out(&manager).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn unpicked_and_non_ip_frames_are_ignored() {
    let mut opts = options(1);
    opts.pick_types = vec![FragmentType::Ipv4];
    let manager = started(opts);

    let v6 = FlowSpec::v6(5);
    feed(&manager, &fragments(&v6, &pattern(64), 32)).await;
    let mut arp = vec![0u8; 42];
    arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
    manager.process_packet(&arp, 9).await.unwrap();

    assert_nothing_out(&manager).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn detect_errors_are_returned_per_packet() {
    let manager = started(options(1));
    let err = manager.process_packet(&[0u8; 10], 0).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Detect(DetectError::LinkHeaderTooShort { .. })
    ));

    let frame = FlowSpec::v4(3).fragment(0, true, &[0u8; 16]);
    let err = manager
        .process_packet(&frame[..ETH_HEADER_SIZE + 8], 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Detect(DetectError::Ipv4HeaderTooShort { .. })
    ));

    // the engine keeps working afterwards
    let flow = FlowSpec::v4(4);
    feed(&manager, &fragments(&flow, &pattern(48), 24)).await;
    assert_eq!(drain(&manager, 1).await.len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn lifecycle_transitions_are_idempotent() {
    let manager = Manager::new(options(1)).unwrap();
    manager.start().unwrap();
    manager.start().unwrap();
    assert_eq!(manager.state(), LifecycleState::Started);

    manager.stop();
    manager.stop();
    assert_eq!(manager.state(), LifecycleState::Stopped);
    manager.start().unwrap();
    assert_eq!(manager.state(), LifecycleState::Stopped);

    let frame = FlowSpec::v4(1).fragment(0, true, &[0u8; 16]);
    assert!(matches!(
        manager.process_packet(&frame, 0).await,
        Err(Error::NotStarted(LifecycleState::Stopped))
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_in_flight_groups() {
    let manager = started(options(2));
    let before = metrics::GROUPS_ABANDONED.get();
    for ident in 0..3 {
        let flow = FlowSpec::v4(900 + ident);
        feed(&manager, &[flow.fragment(0, true, &[0u8; 64])]).await;
    }
    // let the collectors pick the elements up
    sleep(Duration::from_millis(50)).await;
    manager.shutdown().await;
    assert_eq!(manager.state(), LifecycleState::Stopped);
    assert!(metrics::GROUPS_ABANDONED.get() >= before + 3.0);
    assert_eq!(manager.pending_full_packets(), 0);
}

#[tokio::test]
async fn output_queue_valve_trims_when_consumer_stalls() {
    let mut opts = options(2);
    opts.collector.output_queue_max_len = 4;
    opts.collector.queue_check_interval = Duration::from_millis(20);
    opts.collector.queue_trim_grace = Duration::from_millis(20);
    let manager = started(opts);

    let trimmed_before = metrics::FULL_PACKETS_TRIMMED.get();
    for ident in 0..10 {
        let flow = FlowSpec::v6(3000 + ident);
        feed(&manager, &fragments(&flow, &pattern(32), 16)).await;
    }

    // nothing is popped, so at least 10 - 4 packets must go
    sleep(Duration::from_millis(300)).await;
    assert!(manager.pending_full_packets() <= 4);
    assert!(metrics::FULL_PACKETS_TRIMMED.get() >= trimmed_before + 6.0);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_callers_can_feed_the_engine() {
    let manager = Arc::new(started(options(2)));
    let flow = FlowSpec::v4(55);
    let frames = fragments(&flow, &pattern(200), 80);

    let feeder = manager.clone();
    tokio::task::spawn_blocking(move || {
        for (i, frame) in frames.iter().enumerate() {
            feeder.blocking_process_packet(frame, i as u64).unwrap();
        }
    })
    .await
    .unwrap();

    let packets = drain(&manager, 1).await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].payload(), pattern(200).as_slice());
    manager.shutdown().await;
}

#[tokio::test]
async fn pcap_replay_reports_and_rewrites_reassembled_packets() {
    use crate::defrag::pcap::{self, PcapReader, PcapWriter, ReplayOptions};
    use std::time::UNIX_EPOCH;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");

    let complete = FlowSpec::v4(0x0A0A);
    let partial = FlowSpec::v6(0x0B0B);
    let mut frames = fragments(&complete, &pattern(120), 48);
    frames.insert(1, partial.fragment(0, true, &[7u8; 16]));
    frames.push(vec![0u8; 8]);

    let t0 = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let mut writer = PcapWriter::create(&input).unwrap();
    for (i, frame) in frames.iter().enumerate() {
        writer
            .write_record(t0 + Duration::from_millis(i as u64), frame)
            .unwrap();
    }
    writer.finish().unwrap();

    let manager = started(options(2));
    let replay_options = ReplayOptions {
        settle: Duration::from_millis(100),
        keep_packets: true,
    };
    let report = pcap::replay(&manager, &input, &replay_options).await.unwrap();
    manager.shutdown().await;

    assert_eq!(report.records, 5);
    assert_eq!(report.fragments, 4);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.reassembled.len(), 1);
    let entry = &report.reassembled[0];
    assert_eq!(entry.group_id, complete.group_id());
    assert_eq!(entry.fragments, 3);
    assert_eq!(entry.payload_len, 120);
    assert_eq!(entry.record, 3);
    assert_eq!(entry.timestamp, t0 + Duration::from_millis(3));
    assert_eq!(report.incomplete, vec![(partial.group_id(), 1)]);
    assert!(report.to_string().contains("1 incomplete groups"));

    assert_eq!(pcap::write_reassembled(&report, &output).unwrap(), 1);
    let records: Vec<_> = PcapReader::open(&output)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, report.packets[0].bytes());
}

#[tokio::test]
async fn pcap_replay_drops_frames_unless_asked_to_keep_them() {
    use crate::defrag::pcap::{self, PcapWriter, ReplayOptions};
    use std::time::UNIX_EPOCH;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let mut writer = PcapWriter::create(&input).unwrap();
    for ident in 0..3 {
        let flow = FlowSpec::v4(0x0C00 + ident);
        for frame in fragments(&flow, &pattern(64), 32) {
            writer.write_record(UNIX_EPOCH, &frame).unwrap();
        }
    }
    writer.finish().unwrap();

    let manager = started(options(2));
    let replay_options = ReplayOptions {
        settle: Duration::from_millis(100),
        ..ReplayOptions::default()
    };
    let report = pcap::replay(&manager, &input, &replay_options).await.unwrap();
    manager.shutdown().await;

    assert_eq!(report.reassembled.len(), 3);
    assert_eq!(report.fragments, 6);
    assert!(report.incomplete.is_empty());
    assert!(report.packets.is_empty());
    assert!(matches!(
        pcap::write_reassembled(&report, dir.path().join("out.pcap")),
        Err(Error::InvalidOption(_))
    ));
}
