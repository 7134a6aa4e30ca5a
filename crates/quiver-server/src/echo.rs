//! Echo statement processor.
//!
//! A stand-in engine for the standalone server and for protocol testing.
//! It understands just enough statement shapes to exercise every session
//! path: `RETURN` followed by integer literals yields one record of those
//! integers, a statement starting with `FAIL` is accepted and then fails
//! when its result streams, and anything else echoes the statement text
//! back as a single record. Committed work is numbered with sequential
//! bookmarks.

use quiver_bolt::{Value, ValueMap};

use crate::interrupt::InterruptSignal;
use crate::processor::{
    Bookmark, ProcessorError, ProcessorFactory, RecordConsumer, StatementMetadata,
    StatementProcessor,
};
use crate::status::{codes, Failure};

/// Builds an [`EchoProcessor`] per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoFactory;

impl ProcessorFactory for EchoFactory {
    fn create(&self, connection_id: u64, interrupt: InterruptSignal) -> Box<dyn StatementProcessor> {
        Box::new(EchoProcessor::new(connection_id, interrupt))
    }
}

struct Pending {
    records: Vec<Vec<Value>>,
    failure: Option<Failure>,
}

/// Session-scoped echo engine state.
pub struct EchoProcessor {
    connection_id: u64,
    interrupt: InterruptSignal,
    pending: Option<Pending>,
    in_tx: bool,
    committed: u64,
}

impl EchoProcessor {
    /// Create a processor for one connection.
    pub fn new(connection_id: u64, interrupt: InterruptSignal) -> Self {
        Self {
            connection_id,
            interrupt,
            pending: None,
            in_tx: false,
            committed: 0,
        }
    }

    fn next_bookmark(&mut self) -> Bookmark {
        self.committed += 1;
        Bookmark::new(format!("quiver:bookmark:{}", self.committed))
    }
}

impl StatementProcessor for EchoProcessor {
    fn run(
        &mut self,
        statement: &str,
        _parameters: &ValueMap,
    ) -> Result<StatementMetadata, ProcessorError> {
        let statement = statement.trim();
        tracing::debug!(
            connection_id = self.connection_id,
            statement,
            "run statement"
        );

        if statement.is_empty() {
            return Err(Failure::new("Statement.SyntaxError", "empty statement").into());
        }

        if statement.starts_with("FAIL") {
            self.pending = Some(Pending {
                records: Vec::new(),
                failure: Some(Failure::new(
                    "Statement.ExecutionFailed",
                    format!("statement failed: {statement}"),
                )),
            });
            return Ok(StatementMetadata { fields: Vec::new() });
        }

        if let Some(values) = parse_return_ints(statement) {
            let fields = values.iter().map(|(text, _)| text.clone()).collect();
            let record = values.into_iter().map(|(_, n)| Value::Int(n)).collect();
            self.pending = Some(Pending {
                records: vec![record],
                failure: None,
            });
            return Ok(StatementMetadata { fields });
        }

        self.pending = Some(Pending {
            records: vec![vec![Value::String(statement.to_string())]],
            failure: None,
        });
        Ok(StatementMetadata {
            fields: vec!["echo".into()],
        })
    }

    fn stream_result(
        &mut self,
        consumer: &mut dyn RecordConsumer,
    ) -> Result<Option<Bookmark>, ProcessorError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Failure::new(codes::REQUEST_INVALID, "no result pending"))?;

        if let Some(failure) = pending.failure {
            return Err(failure.into());
        }

        for record in pending.records {
            if self.interrupt.is_raised() {
                return Err(ProcessorError::Interrupted);
            }
            consumer.consume(record)?;
        }

        if self.in_tx {
            Ok(None)
        } else {
            Ok(Some(self.next_bookmark()))
        }
    }

    fn begin_transaction(&mut self, _extra: &ValueMap) -> Result<(), ProcessorError> {
        self.in_tx = true;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<Option<Bookmark>, ProcessorError> {
        self.in_tx = false;
        Ok(Some(self.next_bookmark()))
    }

    fn rollback_transaction(&mut self) -> Result<(), ProcessorError> {
        self.in_tx = false;
        self.pending = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.pending = None;
        self.in_tx = false;
    }
}

// "RETURN 1, 2, 3" parses to the literal texts and their values; any
// non-integer argument falls back to echo mode.
fn parse_return_ints(statement: &str) -> Option<Vec<(String, i64)>> {
    let rest = statement.strip_prefix("RETURN ")?;
    let mut values = Vec::new();
    for part in rest.split(',') {
        let text = part.trim();
        let value = text.parse::<i64>().ok()?;
        values.push((text.to_string(), value));
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collected(Vec<Vec<Value>>);

    impl RecordConsumer for Collected {
        fn consume(&mut self, record: Vec<Value>) -> Result<(), ProcessorError> {
            self.0.push(record);
            Ok(())
        }
    }

    fn processor() -> EchoProcessor {
        EchoProcessor::new(1, InterruptSignal::new())
    }

    #[test]
    fn test_return_integer_literals() {
        let mut p = processor();
        let metadata = p.run("RETURN 1, 2", &ValueMap::new()).unwrap();
        assert_eq!(metadata.fields, vec!["1".to_string(), "2".to_string()]);

        let mut consumer = Collected::default();
        let bookmark = p.stream_result(&mut consumer).unwrap();
        assert_eq!(consumer.0, vec![vec![Value::Int(1), Value::Int(2)]]);
        assert_eq!(bookmark.unwrap().as_str(), "quiver:bookmark:1");
    }

    #[test]
    fn test_echoes_other_statements() {
        let mut p = processor();
        let metadata = p.run("MATCH (n) RETURN n", &ValueMap::new()).unwrap();
        assert_eq!(metadata.fields, vec!["echo".to_string()]);

        let mut consumer = Collected::default();
        p.stream_result(&mut consumer).unwrap();
        assert_eq!(
            consumer.0,
            vec![vec![Value::String("MATCH (n) RETURN n".into())]]
        );
    }

    #[test]
    fn test_return_with_non_integer_falls_back_to_echo() {
        let mut p = processor();
        let metadata = p.run("RETURN banana", &ValueMap::new()).unwrap();
        assert_eq!(metadata.fields, vec!["echo".to_string()]);
    }

    #[test]
    fn test_empty_statement_rejected() {
        let mut p = processor();
        match p.run("   ", &ValueMap::new()).unwrap_err() {
            ProcessorError::Failure(f) => assert_eq!(f.code, "Statement.SyntaxError"),
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn test_fail_statement_fails_at_streaming() {
        let mut p = processor();
        p.run("FAIL on purpose", &ValueMap::new()).unwrap();

        let mut consumer = Collected::default();
        match p.stream_result(&mut consumer).unwrap_err() {
            ProcessorError::Failure(f) => {
                assert_eq!(f.code, "Statement.ExecutionFailed");
                assert!(!f.is_fatal());
            }
            other => panic!("expected Failure, got {other:?}"),
        }
        assert!(consumer.0.is_empty());
    }

    #[test]
    fn test_bookmarks_only_on_commit_inside_transaction() {
        let mut p = processor();
        p.begin_transaction(&ValueMap::new()).unwrap();
        p.run("RETURN 1", &ValueMap::new()).unwrap();

        let mut consumer = Collected::default();
        assert_eq!(p.stream_result(&mut consumer).unwrap(), None);

        let bookmark = p.commit_transaction().unwrap();
        assert_eq!(bookmark.unwrap().as_str(), "quiver:bookmark:1");

        // Autocommit work keeps counting from there.
        p.run("RETURN 2", &ValueMap::new()).unwrap();
        let bookmark = p.stream_result(&mut Collected::default()).unwrap();
        assert_eq!(bookmark.unwrap().as_str(), "quiver:bookmark:2");
    }

    #[test]
    fn test_stream_without_pending_result_fails() {
        let mut p = processor();
        match p.stream_result(&mut Collected::default()).unwrap_err() {
            ProcessorError::Failure(f) => assert_eq!(f.code, codes::REQUEST_INVALID),
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_discards_pending_state() {
        let mut p = processor();
        p.begin_transaction(&ValueMap::new()).unwrap();
        p.run("RETURN 1", &ValueMap::new()).unwrap();
        p.reset();

        assert!(!p.in_tx);
        assert!(p.stream_result(&mut Collected::default()).is_err());
    }

    #[test]
    fn test_interrupt_abandons_stream() {
        let interrupt = InterruptSignal::new();
        let mut p = EchoProcessor::new(7, interrupt.clone());
        p.run("RETURN 1", &ValueMap::new()).unwrap();

        interrupt.raise();
        match p.stream_result(&mut Collected::default()).unwrap_err() {
            ProcessorError::Interrupted => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }
}
