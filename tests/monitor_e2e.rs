use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;

use fieldflux::{
    AlgorithmBinding, AlgorithmOptions, AlgorithmRegistry, Deadband, FieldSelector, FieldTree,
    MonitorEngine, MonitorRequest, Record, ScalarKind, SubscriptionId, Value,
};

// powerSupply { value, current, alarm { severity, message }, timeStamp }
// offsets:      0(root) 1      2        3       4         5          6
fn power_supply() -> Arc<Record> {
    Arc::new(Record::new(
        FieldTree::builder("powerSupply")
            .scalar("value", ScalarKind::Float)
            .scalar_with_deadband("current", ScalarKind::Float, Deadband::absolute(2.0))
            .group("alarm", |g| {
                g.scalar("severity", ScalarKind::Int)
                    .scalar("message", ScalarKind::String)
            })
            .timestamp("timeStamp")
            .build()
            .unwrap(),
    ))
}

fn engine_with_channel(
    record: &Arc<Record>,
    request: MonitorRequest,
) -> (Arc<MonitorEngine>, crossbeam_channel::Receiver<SubscriptionId>) {
    let registry = AlgorithmRegistry::with_defaults();
    let (ready_tx, ready_rx) = unbounded();
    let engine = MonitorEngine::new(
        Arc::clone(record),
        &request,
        &registry,
        Box::new(ready_tx),
    )
    .unwrap();
    (engine, ready_rx)
}

fn put_value(record: &Arc<Record>, v: f64) {
    record
        .update(|txn| txn.put("value", Value::Float(v)))
        .unwrap();
}

#[test]
fn first_update_delivers_complete_snapshot() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    put_value(&record, 5.0);
    assert_eq!(ready_rx.recv_timeout(Duration::from_secs(1)).unwrap(), engine.subscription_id());

    let element = engine.poll().expect("first snapshot must be ready");
    // The whole structure is marked changed, compressed to the root bit.
    let changed = element.changed();
    assert!(changed.test(0));
    assert_eq!(changed.count(), 1);
    assert!(element.overrun().is_empty());
    assert_eq!(element.value(1), Value::Float(5.0));
    assert_eq!(element.value(4), Value::Int(0));
    engine.release(element);

    assert!(engine.poll().is_none());
}

#[test]
fn deadband_suppression_sequence() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            algorithms: vec![AlgorithmBinding {
                field: "value".to_string(),
                algorithm: "deadband".to_string(),
                options: AlgorithmOptions {
                    deadband: Some(Deadband::absolute(5.0)),
                },
            }],
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    for v in [10.0, 11.0, 12.0, 20.0] {
        put_value(&record, v);
    }

    // Initial value plus the one transition outside the band.
    let first = engine.poll().expect("initial snapshot");
    assert_eq!(first.value(1), Value::Float(10.0));
    engine.release(first);

    let second = engine.poll().expect("20.0 breaks the band");
    assert_eq!(second.value(1), Value::Float(20.0));
    assert!(second.changed().test(1));
    engine.release(second);

    assert!(engine.poll().is_none());
    assert_eq!(ready_rx.try_iter().count(), 2);

    let stats = engine.stats();
    assert_eq!(stats.updates_observed, 4);
    assert_eq!(stats.updates_suppressed, 2);
    assert_eq!(stats.snapshots_committed, 2);
}

#[test]
fn on_change_suppresses_duplicate_values() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            algorithms: vec![AlgorithmBinding {
                field: "value".to_string(),
                algorithm: "onChange".to_string(),
                options: AlgorithmOptions::default(),
            }],
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    for v in [1.0, 1.0, 2.0, 2.0, 3.0] {
        put_value(&record, v);
    }

    let mut delivered = Vec::new();
    while let Some(element) = engine.poll() {
        delivered.push(element.value(1));
        assert!(element.overrun().is_empty());
        engine.release(element);
    }
    assert_eq!(
        delivered,
        vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]
    );
    assert_eq!(ready_rx.try_iter().count(), 3);
}

#[test]
fn full_ring_coalesces_with_overrun_marks() {
    let record = power_supply();
    // Depth 2 is promoted to a three-slot ring.
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 2,
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
        put_value(&record, v);
    }

    // Three distinct snapshots were announced; the burst beyond capacity
    // coalesced into the newest queued one.
    assert_eq!(ready_rx.try_iter().count(), 3);
    let stats = engine.stats();
    assert_eq!(stats.snapshots_committed, 3);
    assert_eq!(stats.overrun_coalesces, 2);

    let first = engine.poll().unwrap();
    assert_eq!(first.value(1), Value::Float(1.0));
    assert!(first.overrun().is_empty());
    engine.release(first);

    let second = engine.poll().unwrap();
    assert_eq!(second.value(1), Value::Float(2.0));
    assert!(second.overrun().is_empty());
    engine.release(second);

    // The last snapshot retained the final value and flags the field as
    // having changed more than once during the gap.
    let third = engine.poll().unwrap();
    assert_eq!(third.value(1), Value::Float(5.0));
    assert!(third.changed().test(1));
    assert!(third.overrun().test(1));
    engine.release(third);

    assert!(engine.poll().is_none());
}

#[test]
fn no_field_change_is_lost_without_polling() {
    let record = power_supply();
    let (engine, _ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    for v in 1..=10 {
        put_value(&record, f64::from(v));
    }

    // Every delivered snapshot together must still signal the field change.
    let mut signalled = false;
    let mut last = None;
    while let Some(element) = engine.poll() {
        let changed = element.changed();
        let overrun = element.overrun();
        if changed.test(1) || changed.test(0) || overrun.test(1) {
            signalled = true;
        }
        last = Some(element.value(1));
        engine.release(element);
    }
    assert!(signalled);
    assert_eq!(last, Some(Value::Float(10.0)));
}

#[test]
fn no_queue_coalesces_into_latest_state() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(&record, MonitorRequest::default());
    engine.start().unwrap();

    for v in [1.0, 2.0, 3.0] {
        put_value(&record, v);
    }

    // Three internal updates collapse to one ready signal.
    assert_eq!(ready_rx.try_iter().count(), 1);

    let element = engine.poll().expect("coalesced snapshot");
    assert_eq!(element.value(1), Value::Float(3.0));
    // First cycle marked everything; the repeats made `value` an overrun.
    assert!(element.changed().test(0));
    assert!(element.overrun().test(1));
    engine.release(element);
    assert!(engine.poll().is_none());

    // The next update is a fresh snapshot with a precise diff.
    put_value(&record, 4.0);
    assert_eq!(ready_rx.try_iter().count(), 1);
    let element = engine.poll().unwrap();
    assert_eq!(element.value(1), Value::Float(4.0));
    assert!(element.changed().test(1));
    assert!(!element.changed().test(0));
    assert!(element.overrun().is_empty());
    engine.release(element);
}

#[test]
fn no_queue_keeps_updates_arriving_during_hold() {
    let record = power_supply();
    let (engine, _ready_rx) = engine_with_channel(&record, MonitorRequest::default());
    engine.start().unwrap();

    put_value(&record, 1.0);
    let element = engine.poll().unwrap();
    // An update lands while the consumer still holds the hand-off snapshot.
    put_value(&record, 2.0);
    assert_eq!(element.value(1), Value::Float(1.0));
    engine.release(element);

    let element = engine.poll().expect("held-gap update must survive release");
    assert_eq!(element.value(1), Value::Float(2.0));
    engine.release(element);
}

#[test]
fn periodic_delivery_is_timer_gated() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            period_ms: Some(25),
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    for v in [1.0, 2.0, 3.0] {
        put_value(&record, v);
    }

    // Nothing is announced until a tick observes the dirty slot.
    let id = ready_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("tick must announce");
    assert_eq!(id, engine.subscription_id());

    let element = engine.poll().expect("coalesced snapshot");
    assert_eq!(element.value(1), Value::Float(3.0));
    engine.release(element);

    // A clean slot stays silent across further ticks.
    assert!(ready_rx.recv_timeout(Duration::from_millis(120)).is_err());

    engine.stop().unwrap();
}

#[test]
fn on_put_suppresses_pure_restamp() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            algorithms: vec![AlgorithmBinding {
                field: String::new(),
                algorithm: "onPut".to_string(),
                options: AlgorithmOptions::default(),
            }],
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    // First cycle is the complete-state delivery.
    record.update(|txn| txn.stamp(chrono::Utc::now())).unwrap();
    let element = engine.poll().expect("initial snapshot");
    engine.release(element);

    // A pure re-stamp is suppressed.
    record.update(|txn| txn.stamp(chrono::Utc::now())).unwrap();
    assert!(engine.poll().is_none());
    assert_eq!(engine.stats().updates_suppressed, 1);

    // A real value change alongside the stamp is delivered.
    record
        .update(|txn| {
            txn.put("value", Value::Float(7.0))?;
            txn.stamp(chrono::Utc::now())
        })
        .unwrap();
    let element = engine.poll().expect("value change fires");
    assert_eq!(element.value(1), Value::Float(7.0));
    engine.release(element);

    let _ = ready_rx.try_iter().count();
}

#[test]
fn subset_subscription_sees_only_its_fields() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            fields: FieldSelector::fields(["alarm.severity"]),
            queue_depth: 3,
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    // A change outside the subset never reaches the engine's copy.
    put_value(&record, 9.0);
    assert!(engine.poll().is_none());
    assert_eq!(ready_rx.try_iter().count(), 0);

    record
        .update(|txn| txn.put("alarm.severity", Value::Int(2)))
        .unwrap();
    let element = engine.poll().expect("subset change delivered");
    // Copy space: root(0) -> alarm(1) -> severity(2).
    assert_eq!(element.value(2), Value::Int(2));
    engine.release(element);
}

#[test]
fn restart_rearms_first_monitor() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();
    put_value(&record, 1.0);
    let element = engine.poll().unwrap();
    engine.release(element);

    engine.stop().unwrap();
    engine.stop().unwrap();

    // Updates while stopped are not observed.
    put_value(&record, 2.0);
    assert_eq!(engine.stats().updates_observed, 1);

    engine.start().unwrap();
    put_value(&record, 3.0);
    let element = engine.poll().expect("restart delivers again");
    // The first snapshot after a restart carries the complete state.
    assert!(element.changed().test(0));
    assert_eq!(element.value(1), Value::Float(3.0));
    engine.release(element);

    let _ = ready_rx.try_iter().count();
}

#[test]
fn destroyed_engine_drops_late_changes() {
    let record = power_supply();
    let (engine, _ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();
    engine.destroy();
    engine.destroy();

    // The record keeps processing; the dead subscription stays silent.
    put_value(&record, 1.0);
    assert_eq!(engine.stats().updates_observed, 0);

    let err = engine.start().unwrap_err();
    assert!(err.is_engine());
}

#[test]
#[should_panic(expected = "poll on a destroyed monitor")]
fn poll_after_destroy_panics() {
    let record = power_supply();
    let (engine, _ready_rx) = engine_with_channel(&record, MonitorRequest::default());
    engine.start().unwrap();
    engine.destroy();
    let _ = engine.poll();
}

#[test]
#[should_panic(expected = "different monitor")]
fn releasing_foreign_element_panics() {
    let record = power_supply();
    let (first, _rx1) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            ..MonitorRequest::default()
        },
    );
    let (second, _rx2) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 3,
            ..MonitorRequest::default()
        },
    );
    first.start().unwrap();
    second.start().unwrap();

    put_value(&record, 1.0);
    let element = first.poll().unwrap();
    second.release(element);
}

#[test]
fn setup_errors_reject_synchronously() {
    let record = power_supply();
    let registry = AlgorithmRegistry::with_defaults();
    let ready: Box<dyn fieldflux::ReadyCallback> = Box::new(|_: SubscriptionId| {});

    // Queue depth 0.
    let err = MonitorEngine::new(
        Arc::clone(&record),
        &MonitorRequest {
            queue_depth: 0,
            ..MonitorRequest::default()
        },
        &registry,
        ready,
    )
    .unwrap_err();
    assert!(err.is_validation());

    // Unknown algorithm name.
    let err = MonitorEngine::new(
        Arc::clone(&record),
        &MonitorRequest {
            algorithms: vec![AlgorithmBinding {
                field: "value".to_string(),
                algorithm: "noSuchBand".to_string(),
                options: AlgorithmOptions::default(),
            }],
            ..MonitorRequest::default()
        },
        &registry,
        Box::new(|_: SubscriptionId| {}),
    )
    .unwrap_err();
    assert!(err.is_validation());

    // Deadband bound to a non-numeric field.
    let err = MonitorEngine::new(
        Arc::clone(&record),
        &MonitorRequest {
            algorithms: vec![AlgorithmBinding {
                field: "alarm.message".to_string(),
                algorithm: "deadband".to_string(),
                options: AlgorithmOptions::default(),
            }],
            ..MonitorRequest::default()
        },
        &registry,
        Box::new(|_: SubscriptionId| {}),
    )
    .unwrap_err();
    assert!(err.is_validation());

    // Periodic delivery combined with a deeper queue.
    let err = MonitorEngine::new(
        Arc::clone(&record),
        &MonitorRequest {
            queue_depth: 3,
            period_ms: Some(50),
            ..MonitorRequest::default()
        },
        &registry,
        Box::new(|_: SubscriptionId| {}),
    )
    .unwrap_err();
    assert!(err.is_validation());

    // Unknown selector path.
    let err = MonitorEngine::new(
        Arc::clone(&record),
        &MonitorRequest {
            fields: FieldSelector::fields(["bogus"]),
            ..MonitorRequest::default()
        },
        &registry,
        Box::new(|_: SubscriptionId| {}),
    )
    .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn producer_and_consumer_run_on_their_own_threads() {
    let record = power_supply();
    let (engine, ready_rx) = engine_with_channel(
        &record,
        MonitorRequest {
            queue_depth: 4,
            ..MonitorRequest::default()
        },
    );
    engine.start().unwrap();

    const UPDATES: i32 = 200;
    let producer_record = Arc::clone(&record);
    let producer = std::thread::spawn(move || {
        for v in 1..=UPDATES {
            producer_record
                .update(|txn| txn.put("value", Value::Float(f64::from(v))))
                .unwrap();
        }
    });

    // The final value always survives coalescing, so the consumer drains
    // until it arrives.
    let mut last_seen = 0.0;
    while last_seen < f64::from(UPDATES) {
        match engine.poll() {
            Some(element) => {
                if let Value::Float(v) = element.value(1) {
                    assert!(v >= last_seen, "values must be delivered in order");
                    last_seen = v;
                }
                engine.release(element);
            }
            None => {
                let _ = ready_rx.recv_timeout(Duration::from_millis(50));
            }
        }
    }
    producer.join().unwrap();
    assert_eq!(last_seen, f64::from(UPDATES));
}
