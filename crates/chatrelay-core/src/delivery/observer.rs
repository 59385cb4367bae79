//! Pull-mode observer.

use std::sync::Arc;

use chatrelay_types::error::SessionError;
use chatrelay_types::session::{SessionStatus, SessionView};

use crate::session::record::SessionRecord;

/// A cursor into one session's accumulated output.
///
/// Each [`pull`](Observer::pull) returns exactly the bytes appended since the
/// previous pull, so concatenating every pull reproduces the replay log with
/// nothing skipped or repeated.
#[derive(Debug, Clone)]
pub struct Observer {
    record: Arc<SessionRecord>,
    offset: usize,
}

impl Observer {
    pub fn new(record: Arc<SessionRecord>) -> Self {
        Self { record, offset: 0 }
    }

    /// Resume from a byte offset a client got from an earlier pull.
    pub fn at_offset(record: Arc<SessionRecord>, offset: usize) -> Result<Self, SessionError> {
        if record.read_from(offset).is_none() {
            return Err(SessionError::InvalidOffset {
                offset,
                len: record.total_len(),
            });
        }
        Ok(Self { record, offset })
    }

    /// Output appended since the last pull. Empty when nothing is new.
    pub fn pull(&mut self) -> String {
        match self.record.read_from(self.offset) {
            Some((fresh, end)) => {
                self.offset = end;
                fresh
            }
            None => String::new(),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn status(&self) -> SessionStatus {
        self.record.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.record.is_terminal()
    }

    pub fn view(&self) -> SessionView {
        self.record.view()
    }

    pub fn total_progress(&self) -> String {
        self.record.total_progress()
    }

    pub fn record(&self) -> &Arc<SessionRecord> {
        &self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_types::config::SessionConfig;

    fn record() -> Arc<SessionRecord> {
        Arc::new(SessionRecord::new(
            1,
            1,
            "m".to_string(),
            vec![],
            &SessionConfig::default(),
        ))
    }

    #[test]
    fn test_pulls_concatenate_to_total() {
        let record = record();
        let mut observer = Observer::new(record.clone());
        let mut seen = String::new();

        record.append_progress("Hel");
        seen.push_str(&observer.pull());
        assert_eq!(observer.pull(), "");
        record.append_progress("lo");
        record.append_progress(", wörld");
        seen.push_str(&observer.pull());

        assert_eq!(seen, record.total_progress());
        assert_eq!(observer.offset(), record.total_len());
    }

    #[test]
    fn test_observers_are_independent() {
        let record = record();
        record.append_progress("abc");
        let mut first = Observer::new(record.clone());
        let mut second = Observer::new(record.clone());

        assert_eq!(first.pull(), "abc");
        record.append_progress("def");
        assert_eq!(first.pull(), "def");
        assert_eq!(second.pull(), "abcdef");
    }

    #[test]
    fn test_at_offset_validates() {
        let record = record();
        record.append_progress("ab");
        record.append_progress("é");

        let mut observer = Observer::at_offset(record.clone(), 2).unwrap();
        assert_eq!(observer.pull(), "é");

        assert!(matches!(
            Observer::at_offset(record.clone(), 3),
            Err(SessionError::InvalidOffset { offset: 3, len: 4 })
        ));
        assert!(Observer::at_offset(record, 99).is_err());
    }
}
