use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

use crossbeam_channel::unbounded;

use edge_bragg::channel::wire::{read_message, write_message, Message};
use edge_bragg::channel::{ChannelMonitor, ChannelServer, NdArrayRecord, RecordServer};
use edge_bragg::frame::PixelBuffer;
use edge_bragg::ingest::{IngestClient, IngestOutcome, IngestStats};

const WAIT: Duration = Duration::from_secs(5);

fn frame(id: i64) -> NdArrayRecord {
    NdArrayRecord::image(id, 2, 3, PixelBuffer::U16(vec![id as u16; 6]))
        .with_descriptor("test frame")
}

#[test]
fn subscriber_gets_current_value_then_updates() {
    let server = ChannelServer::bind("127.0.0.1:0").expect("bind");
    let addr = server.local_addr().to_string();
    server.add_record("det", NdArrayRecord::default()).expect("add");

    let mut monitor = ChannelMonitor::connect(&addr, "det").expect("connect");
    let (tx, rx) = unbounded();
    monitor
        .start(move |record| {
            let _ = tx.send(record);
        })
        .expect("start");

    let warm_up = rx.recv_timeout(WAIT).expect("current value");
    assert!(warm_up.value.is_none());

    for id in 1..=3 {
        server.update("det", frame(id)).expect("update");
    }
    let ids: Vec<i64> = (0..3)
        .map(|_| rx.recv_timeout(WAIT).expect("update").unique_id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let last = frame(3);
    assert_eq!(last.rows(), Some(2));
    assert_eq!(last.cols(), Some(3));

    assert_eq!(monitor.stop().expect("stop"), 4);
    assert_eq!(monitor.stop().expect("second stop"), 0);
    server.stop().expect("server stop");
}

#[test]
fn updates_on_a_missing_channel_fail() {
    let server = ChannelServer::bind("127.0.0.1:0").expect("bind");
    assert!(server.update("nope", frame(1)).is_err());
    server.add_record("det", frame(1)).expect("add");
    assert!(server.add_record("det", frame(2)).is_err());
    server.stop().expect("stop");
}

#[test]
fn ingest_discards_the_warm_up_record_over_the_wire() {
    let server = ChannelServer::bind("127.0.0.1:0").expect("bind");
    let addr = server.local_addr().to_string();
    server.add_record("det", frame(100)).expect("add");

    let (frames_tx, frames_rx) = unbounded();
    let stats = std::sync::Arc::new(IngestStats::new());
    let mut client = IngestClient::new(frames_tx, stats.clone());
    let (outcome_tx, outcome_rx) = unbounded();
    let mut monitor = ChannelMonitor::connect(&addr, "det").expect("connect");
    monitor
        .start(move |record| {
            let _ = outcome_tx.send(client.on_record(record).map_err(|e| e.to_string()));
        })
        .expect("start");

    assert_eq!(
        outcome_rx.recv_timeout(WAIT).expect("warm-up"),
        Ok(IngestOutcome::WarmUp)
    );
    server.update("det", frame(101)).expect("update");
    server.update("det", frame(103)).expect("update");
    for _ in 0..2 {
        assert!(matches!(
            outcome_rx.recv_timeout(WAIT).expect("frame"),
            Ok(IngestOutcome::Queued { .. })
        ));
    }

    assert_eq!(frames_rx.len(), 2);
    assert_eq!(stats.received(), 2);
    assert_eq!(stats.expected(), 3);
    assert_eq!(stats.missing(), 1);

    monitor.stop().expect("stop");
    server.stop().expect("server stop");
}

#[test]
fn non_finite_float_pixels_reach_the_subscriber() {
    let server = ChannelServer::bind("127.0.0.1:0").expect("bind");
    let addr = server.local_addr().to_string();
    server.add_record("det", NdArrayRecord::default()).expect("add");

    let mut monitor = ChannelMonitor::connect(&addr, "det").expect("connect");
    let (tx, rx) = unbounded();
    monitor
        .start(move |record| {
            let _ = tx.send(record);
        })
        .expect("start");
    rx.recv_timeout(WAIT).expect("current value");

    let masked = PixelBuffer::F32(vec![1.0, f32::NAN, f32::INFINITY, f32::NEG_INFINITY]);
    server
        .update("det", NdArrayRecord::image(1, 2, 2, masked.clone()))
        .expect("update");
    for id in 2..=4 {
        let finite = PixelBuffer::F64(vec![id as f64; 4]);
        server
            .update("det", NdArrayRecord::image(id, 2, 2, finite))
            .expect("update");
    }

    let records: Vec<NdArrayRecord> = (0..4)
        .map(|_| rx.recv_timeout(WAIT).expect("update"))
        .collect();
    let ids: Vec<i64> = records.iter().map(|r| r.unique_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    let first = records[0].value.as_ref().expect("value");
    assert_eq!(first.to_le_bytes(), masked.to_le_bytes());

    monitor.stop().expect("stop");
    server.stop().expect("server stop");
}

#[test]
fn a_malformed_message_does_not_end_the_subscription() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        match read_message(&mut stream).expect("subscribe") {
            Some(Message::Subscribe { channel }) => assert_eq!(channel, "det"),
            other => panic!("unexpected request {:?}", other),
        }
        let garbage = br#"{"type":"record","channel":"det","record":{"uniqueId":null}}"#;
        stream
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .expect("length");
        stream.write_all(garbage).expect("body");
        write_message(
            &mut stream,
            &Message::Record {
                channel: "det".into(),
                record: frame(2),
            },
        )
        .expect("record");
        stream
    });

    let mut monitor = ChannelMonitor::connect(&addr, "det").expect("connect");
    let (tx, rx) = unbounded();
    monitor
        .start(move |record| {
            let _ = tx.send(record);
        })
        .expect("start");

    let record = rx.recv_timeout(WAIT).expect("record after the malformed one");
    assert_eq!(record.unique_id, 2);
    let _stream = peer.join().expect("peer");
    assert_eq!(monitor.stop().expect("stop"), 1);
}
