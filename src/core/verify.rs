//! Verification engine: replay the log and compare against the stored view.
//!
//! Outcomes:
//! - `ok`: recomputed hash and `last_event_seq` equal the stored ones
//! - `mismatch`: both sides are well-formed but differ, or no view is stored
//! - `corrupted`: the log cannot be parsed or replayed

use crate::core::projection::{project, Views};
use crate::core::state::VerifyStatus;
use crate::storage::event_store::{parse_log, EventStoreError};
use crate::core::events::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Result of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub verify_status: VerifyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection_hash_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_last_event_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_projection_hash_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl VerifyReport {
    #[must_use]
    pub fn corrupted(code: &str, message: impl Into<String>) -> Self {
        Self {
            verify_status: VerifyStatus::Corrupted,
            last_event_seq: None,
            projection_hash_sha256: None,
            stored_last_event_seq: None,
            stored_projection_hash_sha256: None,
            reason: Some(message.into()),
            error_code: Some(code.to_string()),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.verify_status == VerifyStatus::Ok
    }
}

/// Stored hash and sequence read from a roadmap document.
///
/// The document is read as loose JSON so that a hand-edited or truncated
/// view still yields a comparison instead of an error.
fn stored_fingerprint(stored: &Value) -> (Option<String>, Option<u64>) {
    let run = &stored["meta"]["run"];
    (
        run["projection_hash_sha256"].as_str().map(str::to_string),
        run["last_event_seq"].as_u64(),
    )
}

/// Compares an already projected state against the stored roadmap.
#[must_use]
pub fn compare(views: &Views, stored_roadmap: Option<&Value>) -> VerifyReport {
    let computed_hash = views.projection_hash().to_string();
    let computed_seq = views.last_event_seq();

    let Some(stored) = stored_roadmap else {
        return VerifyReport {
            verify_status: VerifyStatus::Mismatch,
            last_event_seq: Some(computed_seq),
            projection_hash_sha256: Some(computed_hash),
            stored_last_event_seq: None,
            stored_projection_hash_sha256: None,
            reason: Some("roadmap_missing".to_string()),
            error_code: None,
        };
    };

    let (stored_hash, stored_seq) = stored_fingerprint(stored);
    let matches =
        stored_hash.as_deref() == Some(computed_hash.as_str()) && stored_seq == Some(computed_seq);
    if matches {
        debug!(last_event_seq = computed_seq, "verify ok");
        return VerifyReport {
            verify_status: VerifyStatus::Ok,
            last_event_seq: Some(computed_seq),
            projection_hash_sha256: Some(computed_hash),
            stored_last_event_seq: None,
            stored_projection_hash_sha256: None,
            reason: None,
            error_code: None,
        };
    }

    warn!(
        computed = %computed_hash,
        stored = stored_hash.as_deref().unwrap_or("-"),
        "projection mismatch"
    );
    VerifyReport {
        verify_status: VerifyStatus::Mismatch,
        last_event_seq: Some(computed_seq),
        projection_hash_sha256: Some(computed_hash),
        stored_last_event_seq: stored_seq,
        stored_projection_hash_sha256: stored_hash,
        reason: Some("hash_or_sequence_differs".to_string()),
        error_code: None,
    }
}

/// Replays parsed events and compares against the stored roadmap.
#[must_use]
pub fn verify_events(events: &[Event], stored_roadmap: Option<&Value>) -> VerifyReport {
    match project(events) {
        Ok(views) => compare(&views, stored_roadmap),
        Err(e) => {
            warn!(code = e.code(), error = %e, "log replay failed");
            VerifyReport::corrupted(e.code(), e.to_string())
        }
    }
}

/// Full verification from raw log text.
#[must_use]
pub fn verify_log(content: &str, stored_roadmap: Option<&Value>) -> VerifyReport {
    match parse_log(content) {
        Ok(events) => verify_events(&events, stored_roadmap),
        Err(e) => report_store_error(&e),
    }
}

/// Maps a store read failure to a verification outcome.
#[must_use]
pub fn report_store_error(err: &EventStoreError) -> VerifyReport {
    warn!(code = err.code(), error = %err, "event store unreadable");
    VerifyReport::corrupted(err.code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::projection::tests::LogBuilder;
    use crate::storage::event_store::encode_lines;

    fn stored(views: &Views) -> Value {
        serde_json::to_value(&views.roadmap).unwrap()
    }

    #[test]
    fn matching_view_is_ok() {
        let events = LogBuilder::new().create("T-1", "spec").build();
        let views = project(&events).unwrap();
        let report = verify_events(&events, Some(&stored(&views)));
        assert!(report.is_ok());
        assert_eq!(report.last_event_seq, Some(1));
    }

    #[test]
    fn missing_view_is_mismatch() {
        let events = LogBuilder::new().create("T-1", "spec").build();
        let report = verify_events(&events, None);
        assert_eq!(report.verify_status, VerifyStatus::Mismatch);
        assert_eq!(report.reason.as_deref(), Some("roadmap_missing"));
    }

    #[test]
    fn stale_view_is_mismatch() {
        let events = LogBuilder::new().create("T-1", "spec").claim("a", "T-1").build();
        let stale = project(&events[..1]).unwrap();
        let report = verify_events(&events, Some(&stored(&stale)));
        assert_eq!(report.verify_status, VerifyStatus::Mismatch);
        assert_eq!(report.stored_last_event_seq, Some(1));
        assert_eq!(report.last_event_seq, Some(2));
    }

    #[test]
    fn garbage_view_is_mismatch_not_error() {
        let events = LogBuilder::new().create("T-1", "spec").build();
        let report = verify_events(&events, Some(&Value::from("not a roadmap")));
        assert_eq!(report.verify_status, VerifyStatus::Mismatch);
    }

    #[test]
    fn broken_log_is_corrupted() {
        let report = verify_log("{not json}\n", None);
        assert_eq!(report.verify_status, VerifyStatus::Corrupted);
        assert_eq!(report.error_code.as_deref(), Some("jsonl_invalid"));
    }

    #[test]
    fn done_regression_is_corrupted() {
        let events = LogBuilder::new()
            .create("T-1", "spec")
            .claim("a", "T-1")
            .complete("a", "T-1", &[])
            .review("a", "T-1", crate::core::events::ReviewDecision::Approve)
            .review("a", "T-1", crate::core::events::ReviewDecision::RequestChanges)
            .build();
        let content = encode_lines(&events).unwrap();
        let report = verify_log(&content, None);
        assert_eq!(report.verify_status, VerifyStatus::Corrupted);
        assert_eq!(report.error_code.as_deref(), Some("done_regression"));
    }
}
