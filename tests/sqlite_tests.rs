//! SQLite persistence across process restarts.

use std::sync::Arc;

use abtest_engine::clock::ManualClock;
use abtest_engine::random::SequenceRandom;
use abtest_engine::{
    ConversionType, ExperimentService, ParticipantContext, SqliteStorage, TemplateCustomizations,
    TestStatus,
};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

fn open(dir: &TempDir) -> ExperimentService {
    let storage = SqliteStorage::open(dir.path().join("abtest.db")).unwrap();
    ExperimentService::new(Arc::new(storage))
        .with_clock(Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())))
        .with_random(Arc::new(SequenceRandom::new(vec![5.0, 95.0])))
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let test_id = {
        let svc = open(&dir);
        let custom = TemplateCustomizations {
            duration_days: Some(21),
            tags: Some(vec!["q1".into()]),
            ..Default::default()
        };
        let test = svc.create_from_template("bob", "subject_line_style", custom).unwrap();
        svc.start(&test.id).unwrap();
        let ctx = ParticipantContext { device_type: Some("mobile".into()), ..Default::default() };
        svc.assign(&test.id, "u1", None, Some(ctx)).unwrap();
        svc.assign(&test.id, "u2", Some("app-9"), None).unwrap();
        svc.record_conversion(&test.id, "u2", ConversionType::Open, Some("app-9"), Some(1.5))
            .unwrap();
        svc.analyze(&test.id).unwrap();
        test.id
    };

    let svc = open(&dir);
    let test = svc.get_test(&test_id).unwrap();
    assert_eq!(test.status, TestStatus::Running);
    assert_eq!(test.tags, vec!["q1".to_string()]);
    assert!(test.end_date.is_some());
    let results = test.results.expect("analysis persisted");
    assert_eq!(results.variants.iter().map(|v| v.participants).sum::<u64>(), 2);

    let participations = svc.participations(&test_id).unwrap();
    assert_eq!(participations.len(), 2);
    let u1 = participations.iter().find(|p| p.participant_id == "u1").unwrap();
    assert_eq!(u1.application_id, None);
    assert_eq!(u1.context.as_ref().and_then(|c| c.device_type.as_deref()), Some("mobile"));
    let u2 = participations.iter().find(|p| p.participant_id == "u2").unwrap();
    assert_eq!(u2.application_id.as_deref(), Some("app-9"));
    assert!(u2.converted);
    assert_eq!(u2.conversion_type, Some(ConversionType::Open));

    // Returning participant after restart keeps the recorded variant.
    let again = svc.assign(&test_id, "u1", None, None).unwrap();
    assert_eq!(again.variant_id, u1.variant_id);
}

#[test]
fn test_lifecycle_updates_do_not_drop_results() {
    let dir = TempDir::new().unwrap();
    let svc = open(&dir);
    let test = svc
        .create_from_template("bob", "follow_up_timing", TemplateCustomizations::default())
        .unwrap();
    svc.start(&test.id).unwrap();
    svc.analyze(&test.id).unwrap();
    svc.pause(&test.id).unwrap();

    let reopened = open(&dir);
    let stored = reopened.get_test(&test.id).unwrap();
    assert_eq!(stored.status, TestStatus::Paused);
    assert!(stored.results.is_some());
}
