//! Transport state machine tests
//!
//! These run on a simulated in-process segment with tokio's paused
//! clock, which makes the retry, ack-flush and liveness schedules
//! exactly observable.

use bytes::Bytes;
use mbus_core::{Address, Command, DeliveryType, Message, Value};
use mbus_link::{Link, LinkEvent, MemoryHub};
use mbus_transport::{
    LinkRegistry, SessionConfig, Transport, TransportError, ACK_FLUSH_DELAY, RETRY_INTERVAL,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config() -> SessionConfig {
    SessionConfig {
        digest_key: b"test-session".to_vec(),
        // keep everything on the group so the tap sees it
        prefer_unicast: false,
        ..SessionConfig::default()
    }
}

fn open(hub: &MemoryHub, address: &str) -> Transport {
    Transport::open_with_link(
        config(),
        Address::parse(address).unwrap(),
        Arc::new(hub.link()),
    )
}

struct TapRecord {
    at: Instant,
    wire: Bytes,
    msg: Message,
}

/// Listen on the segment and decode everything that goes by
fn spawn_tap(hub: &MemoryHub) -> Arc<Mutex<Vec<TapRecord>>> {
    let link = hub.link();
    let mut rx = link.subscribe();
    let coder = config().coder();
    let records = Arc::new(Mutex::new(Vec::new()));
    let out = records.clone();
    tokio::spawn(async move {
        let _keep_endpoint = link;
        while let Ok(event) = rx.recv().await {
            if let LinkEvent::Data(wire, _) = event {
                if let Ok(text) = coder.decode(&wire) {
                    if let Ok(msg) = Message::parse(&text) {
                        out.lock().push(TapRecord {
                            at: Instant::now(),
                            wire,
                            msg,
                        });
                    }
                }
            }
        }
    });
    records
}

fn address_collector(bus: &Transport, lost: bool) -> Arc<Mutex<Vec<(Instant, Address)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let out = seen.clone();
    let callback = move |address: &Address| {
        out.lock().push((Instant::now(), address.clone()));
    };
    if lost {
        bus.on_lost_entity(callback);
    } else {
        bus.on_new_entity(callback);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_mutual_discovery_within_one_hello_interval() {
    let hub = MemoryHub::new();
    let a = open(&hub, "(app:a)");
    let b = open(&hub, "(app:b)");

    let a_seen = address_collector(&a, false);
    let b_seen = address_collector(&b, false);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_seen = a_seen.lock();
    let b_seen = b_seen.lock();
    assert_eq!(a_seen.len(), 1, "a should have discovered exactly b");
    assert_eq!(b_seen.len(), 1, "b should have discovered exactly a");
    assert_eq!(&a_seen[0].1, b.local_address());
    assert_eq!(&b_seen[0].1, a.local_address());
    drop(a_seen);
    drop(b_seen);

    assert!(a.entity_available(b.local_address()).await);
    assert!(b.entity_available(a.local_address()).await);
}

#[tokio::test(start_paused = true)]
async fn test_loopback_messages_are_suppressed() {
    let hub = MemoryHub::new();
    let a = open(&hub, "(app:a)");
    let seen = address_collector(&a, false);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(seen.lock().is_empty(), "an entity must not discover itself");
    assert!(a.entities().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reliable_retry_schedule_then_failure() {
    let hub = MemoryHub::new();
    let tap = spawn_tap(&hub);
    let a = open(&hub, "(app:a)");

    let failures = Arc::new(Mutex::new(Vec::new()));
    let failures_out = failures.clone();
    a.on_transport_error(move |error| {
        if let TransportError::ReliableDeliveryFailed(seq) = error {
            failures_out.lock().push((Instant::now(), *seq));
        }
    });

    let started = Instant::now();
    let mut msg = Message::to(Address::parse("(app:ghost id:nobody)").unwrap()).reliable();
    msg.add(Command::new("test"));
    a.send(msg).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let records = tap.lock();
    let reliable: Vec<&TapRecord> = records
        .iter()
        .filter(|r| r.msg.header.delivery == DeliveryType::Reliable)
        .collect();

    // the initial send plus exactly two retransmissions
    assert_eq!(reliable.len(), 3);
    assert_eq!(reliable[0].at, started);
    assert_eq!(reliable[1].at - reliable[0].at, RETRY_INTERVAL);
    assert_eq!(reliable[2].at - reliable[1].at, 2 * RETRY_INTERVAL);

    // retransmissions are byte-identical
    assert_eq!(reliable[0].wire, reliable[1].wire);
    assert_eq!(reliable[1].wire, reliable[2].wire);

    let failures = failures.lock();
    assert_eq!(failures.len(), 1, "exactly one delivery failure");
    assert_eq!(failures[0].0 - started, 6 * RETRY_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_reliable_delivery() {
    let hub = MemoryHub::new();
    let tap = spawn_tap(&hub);
    let a = open(&hub, "(app:a)");
    let b = open(&hub, "(app:b)");

    let failed = Arc::new(Mutex::new(false));
    let failed_out = failed.clone();
    a.on_transport_error(move |error| {
        if matches!(error, TransportError::ReliableDeliveryFailed(_)) {
            *failed_out.lock() = true;
        }
    });

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let delivered_out = delivered.clone();
    b.on_incoming_message(move |msg| {
        delivered_out.lock().push(msg.clone());
    });

    // let the hellos cross so a knows b
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut msg = Message::to(b.local_address().clone()).reliable();
    msg.add(Command::new("test"));
    a.send(msg).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let delivered = delivered.lock();
    assert_eq!(delivered.len(), 1, "the command arrives exactly once");
    assert!(delivered[0].contains("test"));
    assert!(!*failed.lock(), "no delivery failure when the peer acks");

    // b's ack stopped the retries: one reliable datagram from a total
    let records = tap.lock();
    let reliable = records
        .iter()
        .filter(|r| r.msg.header.delivery == DeliveryType::Reliable)
        .count();
    assert_eq!(reliable, 1);
}

#[tokio::test(start_paused = true)]
async fn test_standalone_ack_flush() {
    let hub = MemoryHub::new();
    let tap = spawn_tap(&hub);
    let a = open(&hub, "(app:a)");
    let b = open(&hub, "(app:b)");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let sent_at = Instant::now();
    let mut msg = Message::to(a.local_address().clone()).reliable();
    msg.add(Command::new("test"));
    b.send(msg).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let records = tap.lock();
    let reliable_seq = records
        .iter()
        .find(|r| r.msg.header.delivery == DeliveryType::Reliable)
        .map(|r| r.msg.header.sequence_no)
        .expect("reliable message on the wire");

    // with no return traffic to ride on, the ack gets its own datagram
    let ack = records
        .iter()
        .find(|r| {
            r.msg.payload.is_empty()
                && r.msg.header.acks.contains(&reliable_seq)
                && &r.msg.header.source == a.local_address()
        })
        .expect("standalone ack from a");
    assert_eq!(ack.at - sent_at, ACK_FLUSH_DELAY);
    assert_eq!(&ack.msg.header.destination, b.local_address());
}

#[tokio::test(start_paused = true)]
async fn test_ack_piggyback_cancels_standalone_flush() {
    let hub = MemoryHub::new();
    let tap = spawn_tap(&hub);
    let a = open(&hub, "(app:a)");
    let b = open(&hub, "(app:b)");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut msg = Message::to(a.local_address().clone()).reliable();
    msg.add(Command::new("test"));
    b.send(msg).unwrap();

    // well inside the flush delay, a sends something unrelated to b
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut unrelated = Message::to(b.local_address().clone());
    unrelated.add(Command::with_args("app.data", vec![Value::from(1)]));
    a.send(unrelated).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let records = tap.lock();
    let reliable_seq = records
        .iter()
        .find(|r| r.msg.header.delivery == DeliveryType::Reliable)
        .map(|r| r.msg.header.sequence_no)
        .expect("reliable message on the wire");

    // the unrelated message carries the ack
    let carrier = records
        .iter()
        .find(|r| r.msg.contains("app.data"))
        .expect("unrelated message on the wire");
    assert!(carrier.msg.header.acks.contains(&reliable_seq));

    // and no dedicated ack datagram ever leaves a
    assert!(
        !records
            .iter()
            .any(|r| r.msg.payload.is_empty() && &r.msg.header.source == a.local_address()),
        "standalone flush must have been cancelled"
    );

    // b saw the ack in time, so its reliable send never retried
    let reliable_count = records
        .iter()
        .filter(|r| r.msg.header.delivery == DeliveryType::Reliable)
        .count();
    assert_eq!(reliable_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_entity_is_evicted() {
    let hub = MemoryHub::new();
    let a = open(&hub, "(app:a)");
    let b = open(&hub, "(app:b)");
    let b_address = b.local_address().clone();

    let lost = address_collector(&a, true);
    let silence_began = Instant::now();

    // b says hello once, then leaves without a word
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(b);

    tokio::time::sleep(Duration::from_secs(10)).await;

    let lost = lost.lock();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].1, b_address);

    // one silent peer: deadline is 5 * 1000ms * 1.1, found by a sweep
    let elapsed = lost[0].0 - silence_began;
    assert!(
        elapsed >= Duration::from_millis(4500),
        "evicted too early: {:?}",
        elapsed
    );
    assert!(
        elapsed <= Duration::from_millis(7000),
        "evicted too late: {:?}",
        elapsed
    );

    assert!(!a.entity_available(&b_address).await);
}

#[tokio::test(start_paused = true)]
async fn test_destination_filtering() {
    let hub = MemoryHub::new();
    let a = open(&hub, "(app:a)");
    let b = open(&hub, "(app:b zone:1)");

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let delivered_out = delivered.clone();
    b.on_incoming_message(move |msg| {
        delivered_out.lock().push(msg.clone());
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    for dest in ["(zone:2)", "(zone:1)", "()"] {
        let mut msg = Message::to(Address::parse(dest).unwrap());
        msg.add(Command::new("probe"));
        a.send(msg).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    let delivered = delivered.lock();
    assert_eq!(
        delivered.len(),
        2,
        "only the matching and the empty destination are delivered"
    );
    assert!(delivered
        .iter()
        .all(|msg| b.local_address().is_subset_of(&msg.header.destination)));
}

#[tokio::test(start_paused = true)]
async fn test_observer_removal() {
    let hub = MemoryHub::new();
    let a = open(&hub, "(app:a)");
    let _b = open(&hub, "(app:b)");

    let count = Arc::new(Mutex::new(0u32));
    let count_out = count.clone();
    let id = a.on_new_entity(move |_| *count_out.lock() += 1);
    a.remove_observer(mbus_transport::EventKind::NewEntity, id);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*count.lock(), 0);
}

#[tokio::test]
async fn test_failed_link_setup_leaves_transport_inspectable() {
    let registry = LinkRegistry::new();
    let bad = SessionConfig {
        // not a multicast group
        group: "10.1.2.3:47000".parse::<SocketAddr>().unwrap(),
        ..SessionConfig::default()
    };
    let bus = Transport::open(bad, Address::parse("(app:a)").unwrap(), &registry);

    assert!(!bus.is_operational());
    assert!(bus.setup_error().is_some());

    let mut msg = Message::to(Address::new());
    msg.add(Command::new("test"));
    assert!(matches!(
        bus.send(msg),
        Err(TransportError::NotOperational(_))
    ));
}

#[tokio::test]
async fn test_registry_shares_links_by_configuration() {
    let registry = LinkRegistry::new();
    let base = SessionConfig {
        group: "239.255.222.239:47130".parse::<SocketAddr>().unwrap(),
        bind: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        digest_key: b"one".to_vec(),
        ..SessionConfig::default()
    };

    let first = registry.acquire(&base).unwrap();
    let second = registry.acquire(&base).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);

    let other_key = SessionConfig {
        digest_key: b"two".to_vec(),
        ..base.clone()
    };
    let third = registry.acquire(&other_key).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(registry.len(), 2);

    drop(first);
    drop(second);
    drop(third);
    assert!(registry.is_empty());
}
