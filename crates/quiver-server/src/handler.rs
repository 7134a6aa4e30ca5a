//! Response collection.
//!
//! Each request produces any number of record responses followed by
//! exactly one summary. Records go straight out through a [`RecordSink`]
//! while the operation runs; the summary is accumulated here and rendered
//! once the operation settles. Keeping the summary in one place lets an
//! outcome be overridden late, such as an interrupt arriving after
//! metadata was already collected.

use quiver_bolt::{ResponseMessage, Value, ValueMap};

use crate::processor::Bookmark;
use crate::status::Failure;

/// Where records go while a result streams.
pub trait RecordSink {
    /// Emit one record to the client.
    fn emit(&mut self, fields: Vec<Value>) -> Result<(), Failure>;
}

/// Accumulates the summary response of the request in flight.
///
/// Outcomes rank ignored above failure above success: an ignored request
/// reports nothing else, and a failed one reports no metadata collected
/// before the failure.
#[derive(Default)]
pub struct ResponseCollector {
    metadata: ValueMap,
    failure: Option<Failure>,
    ignored: bool,
    bookmark: Option<Bookmark>,
}

impl ResponseCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry to the pending success metadata.
    pub fn put_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key, value);
    }

    /// Record a failure outcome.
    pub fn on_failure(&mut self, failure: Failure) {
        self.failure = Some(failure);
    }

    /// Record an ignored outcome.
    pub fn on_ignored(&mut self) {
        self.ignored = true;
    }

    /// Stash a bookmark for the next success summary.
    pub fn set_bookmark(&mut self, bookmark: Bookmark) {
        self.bookmark = Some(bookmark);
    }

    /// Render the summary for the completed request and clear the
    /// collector for the next one.
    pub fn finish(&mut self) -> ResponseMessage {
        let ignored = std::mem::take(&mut self.ignored);
        let failure = self.failure.take();
        let bookmark = self.bookmark.take();
        let mut metadata = std::mem::take(&mut self.metadata);

        if ignored {
            return ResponseMessage::ignored();
        }
        if let Some(failure) = failure {
            return failure.into_response();
        }
        if let Some(bookmark) = bookmark {
            metadata.insert("bookmark", bookmark.as_str());
        }
        ResponseMessage::success(metadata)
    }

    /// Discard everything collected so far.
    pub fn reset(&mut self) {
        self.metadata = ValueMap::new();
        self.failure = None;
        self.ignored = false;
        self.bookmark = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::codes;

    #[test]
    fn test_finish_empty_is_bare_success() {
        let mut collector = ResponseCollector::new();
        match collector.finish() {
            ResponseMessage::Success { metadata } => assert!(metadata.is_empty()),
            other => panic!("expected SUCCESS, got {other:?}"),
        }
    }

    #[test]
    fn test_finish_carries_metadata() {
        let mut collector = ResponseCollector::new();
        collector.put_metadata("fields", Value::List(vec![Value::String("n".into())]));
        collector.put_metadata("first_record_available_ms", 3i64);

        match collector.finish() {
            ResponseMessage::Success { metadata } => {
                assert!(metadata.get("fields").is_some());
                assert_eq!(metadata.get("first_record_available_ms"), Some(&Value::Int(3)));
            }
            other => panic!("expected SUCCESS, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_discards_metadata() {
        let mut collector = ResponseCollector::new();
        collector.put_metadata("fields", Value::List(vec![]));
        collector.on_failure(Failure::new(codes::REQUEST_INVALID, "bad"));

        match collector.finish() {
            ResponseMessage::Failure { code, .. } => assert_eq!(code, codes::REQUEST_INVALID),
            other => panic!("expected FAILURE, got {other:?}"),
        }

        // The next request starts clean.
        match collector.finish() {
            ResponseMessage::Success { metadata } => assert!(metadata.is_empty()),
            other => panic!("expected SUCCESS, got {other:?}"),
        }
    }

    #[test]
    fn test_ignored_outranks_failure() {
        let mut collector = ResponseCollector::new();
        collector.on_failure(Failure::new(codes::REQUEST_INVALID, "bad"));
        collector.on_ignored();
        assert_eq!(collector.finish(), ResponseMessage::Ignored);

        // The suppressed failure does not leak into later requests.
        assert!(matches!(collector.finish(), ResponseMessage::Success { .. }));
    }

    #[test]
    fn test_fatal_failure_renders_fatally() {
        let mut collector = ResponseCollector::new();
        collector.on_failure(Failure::fatal(codes::GENERAL_UNKNOWN, "boom"));
        assert!(matches!(collector.finish(), ResponseMessage::FatalFailure { .. }));
    }

    #[test]
    fn test_bookmark_drains_into_success() {
        let mut collector = ResponseCollector::new();
        collector.set_bookmark(Bookmark::new("quiver:bookmark:1"));

        match collector.finish() {
            ResponseMessage::Success { metadata } => {
                assert_eq!(
                    metadata.get("bookmark"),
                    Some(&Value::String("quiver:bookmark:1".into()))
                );
            }
            other => panic!("expected SUCCESS, got {other:?}"),
        }

        match collector.finish() {
            ResponseMessage::Success { metadata } => assert!(metadata.get("bookmark").is_none()),
            other => panic!("expected SUCCESS, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_discards_pending_outcome() {
        let mut collector = ResponseCollector::new();
        collector.put_metadata("fields", Value::List(vec![]));
        collector.on_failure(Failure::new(codes::GENERAL_UNKNOWN, "boom"));
        collector.set_bookmark(Bookmark::new("quiver:bookmark:2"));
        collector.reset();

        match collector.finish() {
            ResponseMessage::Success { metadata } => assert!(metadata.is_empty()),
            other => panic!("expected SUCCESS, got {other:?}"),
        }
    }
}
