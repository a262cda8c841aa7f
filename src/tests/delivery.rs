// src/tests/delivery.rs
use std::cell::Cell;
use std::time::Duration;

use serde_json::json;

use crate::compliance_ingest::SnapshotRulesEngine;
use crate::config::DeliveryConfig;
use crate::delivery::{Deadline, Delivery, Dispatcher};
use crate::errors::PipelineError;
use crate::records::ComplianceState::NonCompliant;
use crate::tests::test_utils::{eval, pack, temp_context, temp_store, RejectingEngine};

fn policy() -> DeliveryConfig {
    DeliveryConfig {
        retry_backoff_secs: 0,
        ..DeliveryConfig::default()
    }
}

fn throttled() -> PipelineError {
    PipelineError::RulesEngine {
        operation: "list_pack_scores".into(),
        message: "throttled".into(),
        transient: true,
    }
}

#[test]
pub fn transient_failures_are_redelivered_then_dead_lettered() {
    let store = temp_store();
    let dispatcher = Dispatcher::new(&store, policy());
    let calls = Cell::new(0);
    let payload = json!({ "snapshot": "poll.json" });

    let delivery = dispatcher
        .dispatch::<(), _>("compliance_poll", &payload, |_| {
            calls.set(calls.get() + 1);
            Err(throttled())
        })
        .unwrap();

    // first delivery plus two redeliveries
    assert_eq!(calls.get(), 3);
    let Delivery::DeadLettered { letter_id, attempts } = delivery else {
        panic!("expected dead letter");
    };
    assert_eq!(attempts, 3);

    let letters = store.dead_letters().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, letter_id);
    assert_eq!(letters[0].handler, "compliance_poll");
    assert_eq!(letters[0].payload, payload);
    assert!(letters[0].reason.contains("throttled"));
}

#[test]
pub fn recovery_within_policy_completes() {
    let store = temp_store();
    let dispatcher = Dispatcher::new(&store, policy());
    let calls = Cell::new(0);

    let delivery = dispatcher
        .dispatch("prioritize", &json!(null), |_| {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(throttled())
            } else {
                Ok(7)
            }
        })
        .unwrap();

    match delivery {
        Delivery::Completed { value, attempts } => {
            assert_eq!(value, 7);
            assert_eq!(attempts, 2);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(store.dead_letters().unwrap().is_empty());
}

#[test]
pub fn malformed_input_is_dropped_without_retry() {
    let store = temp_store();
    let dispatcher = Dispatcher::new(&store, policy());
    let calls = Cell::new(0);

    let delivery = dispatcher
        .dispatch::<(), _>("risk_event", &json!({}), |_| {
            calls.set(calls.get() + 1);
            Err(PipelineError::malformed("workloadId", "missing or empty"))
        })
        .unwrap();

    assert_eq!(calls.get(), 1);
    assert!(matches!(delivery, Delivery::Dropped { .. }));
    assert!(store.dead_letters().unwrap().is_empty());
}

#[test]
pub fn permanent_failures_are_dead_lettered_immediately() {
    let store = temp_store();
    let dispatcher = Dispatcher::new(&store, policy());
    let calls = Cell::new(0);

    let delivery = dispatcher
        .dispatch::<(), _>("prioritize", &json!(null), |_| {
            calls.set(calls.get() + 1);
            Err(PipelineError::encryption("open row"))
        })
        .unwrap();

    assert_eq!(calls.get(), 1);
    assert!(matches!(delivery, Delivery::DeadLettered { attempts: 1, .. }));
}

#[test]
pub fn zero_redeliveries_dead_letters_on_first_failure() {
    let store = temp_store();
    let dispatcher = Dispatcher::new(
        &store,
        DeliveryConfig {
            max_redeliveries: 0,
            ..policy()
        },
    );
    let delivery = dispatcher
        .dispatch::<(), _>("compliance_poll", &json!(null), |_| Err(throttled()))
        .unwrap();
    assert!(matches!(delivery, Delivery::DeadLettered { attempts: 1, .. }));
}

#[test]
pub fn deadline_reports_stage_on_expiry() {
    let spent = Deadline::start(Duration::ZERO);
    match spent.check("backlog commit") {
        Err(PipelineError::Timeout { stage, .. }) => assert_eq!(stage, "backlog commit"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(Deadline::unbounded().check("anything").is_ok());
}

#[test]
pub fn sub_second_budget_is_reported_in_milliseconds() {
    let spent = Deadline::start(Duration::from_millis(20));
    std::thread::sleep(Duration::from_millis(30));
    match spent.check("pack pack-1") {
        Err(PipelineError::Timeout { budget_ms, .. }) => assert_eq!(budget_ms, 20),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(Deadline::unbounded().budget_ms(), u64::MAX);
}

#[test]
pub fn cycle_with_only_rejected_packs_is_dead_lettered_on_first_attempt() {
    let ctx = temp_context();
    let engine = RejectingEngine {
        inner: SnapshotRulesEngine::new(vec![
            pack("pack-1", 10.0, vec![eval("rule-a", "r1", NonCompliant)]),
            pack("pack-2", 20.0, vec![eval("rule-b", "r2", NonCompliant)]),
        ]),
        rejected_pack: "pack-1",
    };
    let calls = Cell::new(0);

    let delivery = ctx
        .dispatcher()
        .dispatch("compliance_poll", &json!(null), |deadline| {
            calls.set(calls.get() + 1);
            ctx.compliance_cycle(&engine, deadline)
        })
        .unwrap();

    assert_eq!(calls.get(), 1);
    assert!(matches!(delivery, Delivery::DeadLettered { attempts: 1, .. }));
    // the healthy pack still committed
    assert_eq!(ctx.store.pack_details("pack-2").unwrap().len(), 1);
    let letters = ctx.store.dead_letters().unwrap();
    assert!(letters[0].reason.contains("pack-1"), "{}", letters[0].reason);
}
