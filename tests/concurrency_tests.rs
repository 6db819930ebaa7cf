//! Races on the participation ledger and the lifecycle: many threads, one key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use abtest_engine::clock::ManualClock;
use abtest_engine::model::{ConversionOutcome, ParticipationKey};
use abtest_engine::random::{SeededRandom, SequenceRandom};
use abtest_engine::{
    ConversionType, ExperimentService, InMemoryStorage, SqliteStorage, Storage, TestConfig,
    TestStatus, TestType, VariantConfig,
};
use chrono::{Duration, TimeZone, Utc};
use rstest::rstest;
use serde_json::json;

const THREADS: usize = 16;

fn backend(kind: &str) -> Arc<dyn Storage> {
    match kind {
        "memory" => Arc::new(InMemoryStorage::new()),
        "sqlite" => Arc::new(SqliteStorage::open_in_memory().unwrap()),
        other => panic!("unknown backend {other}"),
    }
}

fn running_test(svc: &ExperimentService) -> String {
    let cfg = TestConfig::new(
        "race",
        TestType::FollowUp,
        vec![
            VariantConfig::new("A", json!({}), 25.0),
            VariantConfig::new("B", json!({}), 25.0),
            VariantConfig::new("C", json!({}), 25.0),
            VariantConfig::new("D", json!({}), 25.0),
        ],
    );
    let test = svc.create_test("alice", cfg).unwrap();
    svc.start(&test.id).unwrap();
    test.id
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn test_concurrent_assignment_creates_one_participation(#[case] kind: &str) {
    let storage = backend(kind);
    let svc = ExperimentService::new(storage.clone()).with_random(Arc::new(SeededRandom::new(7)));
    let test_id = running_test(&svc);

    let variants: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| s.spawn(|| svc.assign(&test_id, "same-user", Some("app-1"), None).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap().variant_id).collect()
    });

    assert_eq!(storage.count_participations(&test_id).unwrap(), 1);
    let stored = storage.list_participations(&test_id).unwrap().remove(0);
    assert!(variants.iter().all(|v| *v == stored.variant_id));
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn test_concurrent_null_application_keys_collapse(#[case] kind: &str) {
    let storage = backend(kind);
    let svc = ExperimentService::new(storage.clone()).with_random(Arc::new(SeededRandom::new(11)));
    let test_id = running_test(&svc);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| svc.assign(&test_id, "no-app", None, None).unwrap());
        }
    });
    assert_eq!(storage.count_participations(&test_id).unwrap(), 1);
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn test_concurrent_conversion_transitions_once(#[case] kind: &str) {
    let storage = backend(kind);
    let svc = ExperimentService::new(storage.clone());
    let test_id = running_test(&svc);
    svc.assign(&test_id, "u1", None, None).unwrap();

    let key = ParticipationKey::new(test_id.as_str(), "u1", None);
    let transitions = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let outcome = storage
                    .mark_converted(&key, ConversionType::Response, None, Utc::now())
                    .unwrap();
                if outcome == ConversionOutcome::Converted {
                    transitions.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });
    assert_eq!(transitions.load(Ordering::SeqCst), 1);

    // Through the service, repeats stay silent no-ops.
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                svc.record_conversion(&test_id, "u1", ConversionType::Offer, None, None).unwrap()
            });
        }
    });
    let p = storage.get_participation(&key).unwrap().unwrap();
    assert_eq!(p.conversion_type, Some(ConversionType::Response));
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn test_concurrent_distinct_users_all_recorded(#[case] kind: &str) {
    let storage = backend(kind);
    let svc = ExperimentService::new(storage.clone());
    let test_id = running_test(&svc);

    thread::scope(|s| {
        for t in 0..THREADS {
            let svc = &svc;
            let test_id = &test_id;
            s.spawn(move || {
                for i in 0..25 {
                    svc.assign(test_id, &format!("user-{t}-{i}"), None, None).unwrap();
                }
            });
        }
    });
    assert_eq!(storage.count_participations(&test_id).unwrap(), (THREADS * 25) as u64);
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn test_concurrent_auto_completion_completes_once(#[case] kind: &str) {
    let t0 = Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let svc = ExperimentService::new(backend(kind))
        .with_clock(clock.clone())
        .with_random(Arc::new(SequenceRandom::new(vec![10.0, 90.0])));

    let mut cfg = TestConfig::new(
        "race to finish",
        TestType::SubjectLine,
        vec![
            VariantConfig::new("A", json!({}), 50.0),
            VariantConfig::new("B", json!({}), 50.0),
        ],
    );
    cfg.minimum_sample_size = 20;
    let test = svc.create_test("alice", cfg).unwrap();
    svc.start(&test.id).unwrap();
    for i in 0..25 {
        svc.assign(&test.id, &format!("u{i}"), None, None).unwrap();
    }
    // Even users drew variant A.
    for i in (0..16).step_by(2) {
        svc.record_conversion(&test.id, &format!("u{i}"), ConversionType::Response, None, None)
            .unwrap();
    }
    assert_eq!(svc.get_test(&test.id).unwrap().status, TestStatus::Running);

    clock.advance(Duration::days(8));
    let wins = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                if svc.check_auto_completion(&test.id).unwrap() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    let done = svc.get_test(&test.id).unwrap();
    assert_eq!(done.status, TestStatus::Completed);
    assert_eq!(done.end_date, Some(t0 + Duration::days(8)));
}
