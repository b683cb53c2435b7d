// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery, backpressure and shutdown tests for the event bus.

mod common;

use std::time::Duration;

use capsule_agent::events::{
    BusConfig, BusError, Event, EventBus, EventPayload, NotificationLevel,
};

use common::drain;

fn note(n: usize) -> Event {
    Event::new(EventPayload::Notification {
        title: format!("note-{n}"),
        message: String::new(),
        level: NotificationLevel::Info,
    })
}

fn title(event: &Event) -> &str {
    match &event.payload {
        EventPayload::Notification { title, .. } => title,
        _ => "",
    }
}

fn bus(capacity: usize) -> EventBus {
    let bus = EventBus::new(BusConfig {
        capacity,
        ..BusConfig::default()
    });
    bus.start();
    bus
}

#[tokio::test]
async fn test_slow_subscriber_loses_events_without_blocking_others() {
    let bus = bus(4);
    let mut fast = bus.subscribe().unwrap();
    let mut slow = bus.subscribe().unwrap();

    let mut fast_seen = Vec::new();
    for n in 0..10 {
        bus.publish(note(n));
        fast_seen.extend(drain(&mut fast));
    }

    assert_eq!(fast_seen.len(), 10);
    assert_eq!(fast.dropped(), 0);

    let slow_seen = drain(&mut slow);
    assert_eq!(slow_seen.len(), 4);
    assert_eq!(slow.dropped(), 6);
    // The oldest events are the ones kept, in publish order
    let titles: Vec<&str> = slow_seen.iter().map(|e| title(e)).collect();
    assert_eq!(titles, vec!["note-0", "note-1", "note-2", "note-3"]);
}

#[tokio::test]
async fn test_each_subscriber_sees_publish_order() {
    let bus = bus(64);
    let mut a = bus.subscribe().unwrap();
    let mut b = bus.subscribe().unwrap();

    for n in 0..20 {
        assert_eq!(bus.publish(note(n)), 2);
    }

    for sub in [&mut a, &mut b] {
        let titles: Vec<String> = drain(sub).iter().map(|e| title(e).to_string()).collect();
        let expected: Vec<String> = (0..20).map(|n| format!("note-{n}")).collect();
        assert_eq!(titles, expected);
    }
}

#[tokio::test]
async fn test_concurrent_publishers() {
    let bus = bus(1024);
    let mut sub = bus.subscribe().unwrap();

    let mut tasks = Vec::new();
    for t in 0..4 {
        let bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..50 {
                bus.publish(note(t * 100 + n));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(drain(&mut sub).len(), 200);
    assert_eq!(sub.dropped(), 0);
}

#[tokio::test]
async fn test_stop_closes_subscribers_after_buffered_events() {
    let bus = bus(16);
    let mut sub = bus.subscribe().unwrap();
    for n in 0..3 {
        bus.publish(note(n));
    }

    bus.stop(Duration::from_millis(50)).await;

    assert!(!bus.is_running());
    assert_eq!(bus.subscriber_count(), 0);
    for n in 0..3 {
        let event = sub.recv().await.unwrap();
        assert_eq!(title(&event), format!("note-{n}"));
    }
    assert!(sub.recv().await.is_none());
}

#[tokio::test]
async fn test_stop_waits_for_active_reader() {
    let bus = bus(16);
    let mut sub = bus.subscribe().unwrap();
    for n in 0..5 {
        bus.publish(note(n));
    }

    let reader = tokio::spawn(async move {
        let mut count = 0;
        while sub.recv().await.is_some() {
            count += 1;
        }
        count
    });

    bus.stop(Duration::from_secs(2)).await;
    assert_eq!(reader.await.unwrap(), 5);
}

#[tokio::test]
async fn test_stopped_bus_rejects_subscribers_and_discards_events() {
    let bus = bus(16);
    bus.stop(Duration::ZERO).await;

    assert!(matches!(bus.subscribe(), Err(BusError::NotRunning)));
    assert_eq!(bus.publish(note(0)), 0);
}

#[tokio::test]
async fn test_unsubscribe_unknown_id() {
    let bus = bus(16);
    let sub = bus.subscribe().unwrap();
    assert!(bus.unsubscribe(sub.id()));
    assert!(!bus.unsubscribe(sub.id()));
    assert_eq!(bus.subscriber_count(), 0);
}
