#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{Duration, TimeZone, Utc};
use eva_core::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn read_config(path: &str) -> EvaResult<String> {
    Ok(std::fs::read_to_string(path)?)
}

#[test]
fn io_errors_propagate_with_question_mark() {
    let err = read_config("/definitely/not/here/eva.toml").unwrap_err();
    assert!(matches!(err, EvaError::Io(_)));
    assert!(err.to_string().starts_with("IO error"));
}

#[test]
fn error_variants_render_their_context() {
    let cases = [
        (
            EvaError::AgentUnavailable("no agent for 'search'".into()),
            "Agent unavailable: no agent for 'search'",
        ),
        (
            EvaError::Validation("priority must be between 1 and 10, got 0".into()),
            "Validation error: priority must be between 1 and 10, got 0",
        ),
        (
            EvaError::Store("database is locked".into()),
            "Store error: database is locked",
        ),
        (
            EvaError::Workflow("failed workflows need an error message".into()),
            "Workflow error: failed workflows need an error message",
        ),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
        assert!(!err.is_invalid_transition());
    }
}

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

#[test]
fn manual_clock_is_shared_between_handles() {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let manual = Arc::new(ManualClock::new(start));
    let shared: SharedClock = manual.clone();

    manual.advance(Duration::minutes(5));
    assert_eq!(shared.now(), start + Duration::minutes(5));

    let later = start + Duration::days(1);
    manual.set(later);
    assert_eq!(shared.now(), later);
}

#[test]
fn system_clock_tracks_wall_time() {
    let clock = SystemClock::shared();
    let before = Utc::now();
    let now = clock.now();
    assert!(now >= before);
    assert!(now - before < Duration::seconds(5));
}
