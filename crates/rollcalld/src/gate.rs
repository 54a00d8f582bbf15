//! Per-student cooldown in front of the attendance write.

use crate::attendance::{AttendanceRecord, AttendanceSink, MarkError, MarkRequest};
use chrono::{DateTime, Duration, Utc};
use rollcall_core::MatchResult;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// Marked by this session within the cooldown window.
    Cooldown,
    /// The attendance log reported a recent mark.
    RecentlyMarked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Marked(AttendanceRecord),
    Suppressed(SuppressReason),
    /// The write failed for a reason other than a duplicate; eligible for retry.
    Failed(String),
}

/// Last-marked memory for one scan session.
pub struct CooldownGate {
    window: Duration,
    write_timeout: std::time::Duration,
    last_marked: HashMap<String, DateTime<Utc>>,
}

impl CooldownGate {
    pub fn new(window: Duration, write_timeout: std::time::Duration) -> Self {
        Self {
            window,
            write_timeout,
            last_marked: HashMap::new(),
        }
    }

    /// True if the student has no mark yet or the last one is older than the window.
    pub fn is_due(&self, student_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_marked.get(student_id) {
            None => true,
            Some(&last) => now - last > self.window,
        }
    }

    pub fn last_marked(&self, student_id: &str) -> Option<DateTime<Utc>> {
        self.last_marked.get(student_id).copied()
    }

    /// Write an attendance mark for `matched` unless it is cooling down.
    ///
    /// Memory is only updated when the mark is known to exist: after a
    /// successful write or a duplicate rejection.
    pub async fn consider_mark<A: AttendanceSink>(
        &mut self,
        matched: &MatchResult,
        subject: &str,
        now: DateTime<Utc>,
        sink: &A,
    ) -> MarkOutcome {
        if !self.is_due(&matched.student_id, now) {
            return MarkOutcome::Suppressed(SuppressReason::Cooldown);
        }

        let request = MarkRequest {
            student_id: matched.student_id.clone(),
            name: matched.name.clone(),
            subject: subject.to_string(),
            confidence: matched.confidence,
        };

        match tokio::time::timeout(self.write_timeout, sink.mark(request)).await {
            Ok(Ok(record)) => {
                self.last_marked.insert(matched.student_id.clone(), now);
                MarkOutcome::Marked(record)
            }
            Ok(Err(MarkError::Duplicate(_))) => {
                self.last_marked.insert(matched.student_id.clone(), now);
                MarkOutcome::Suppressed(SuppressReason::RecentlyMarked)
            }
            Ok(Err(e)) => MarkOutcome::Failed(e.to_string()),
            Err(_) => MarkOutcome::Failed(format!(
                "attendance write timed out after {:?}",
                self.write_timeout
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// How the fake sink answers the next write.
    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum Reply {
        Accept,
        Duplicate,
        Fail,
        Hang,
    }

    pub(crate) struct FakeSink {
        pub(crate) writes: Mutex<Vec<MarkRequest>>,
        pub(crate) replies: Mutex<Vec<Reply>>,
    }

    impl FakeSink {
        pub(crate) fn new() -> Self {
            Self::with_replies(Vec::new())
        }

        /// Replies are consumed front to back; once exhausted every write is accepted.
        pub(crate) fn with_replies(replies: Vec<Reply>) -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                replies: Mutex::new(replies),
            }
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl AttendanceSink for FakeSink {
        async fn mark(&self, request: MarkRequest) -> Result<AttendanceRecord, MarkError> {
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    Reply::Accept
                } else {
                    replies.remove(0)
                }
            };
            self.writes.lock().unwrap().push(request.clone());
            match reply {
                Reply::Accept => Ok(AttendanceRecord {
                    id: format!("rec-{}", self.write_count()),
                    student_id: request.student_id,
                    name: request.name,
                    subject: request.subject,
                    confidence: request.confidence,
                    marked_at: Utc::now(),
                }),
                Reply::Duplicate => Err(MarkError::Duplicate(request.student_id)),
                Reply::Fail => Err(MarkError::Transient("connection refused".into())),
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn matched(id: &str) -> MatchResult {
        MatchResult {
            student_id: id.into(),
            name: "Alice".into(),
            distance: 0.3,
            confidence: 0.5,
        }
    }

    fn gate() -> CooldownGate {
        CooldownGate::new(Duration::seconds(300), std::time::Duration::from_secs(5))
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_second_mark_within_cooldown_suppressed() {
        let sink = FakeSink::new();
        let mut gate = gate();

        let first = gate.consider_mark(&matched("S1"), "Intro to CS", t(0), &sink).await;
        assert!(matches!(first, MarkOutcome::Marked(_)));

        let second = gate.consider_mark(&matched("S1"), "Intro to CS", t(120), &sink).await;
        assert_eq!(second, MarkOutcome::Suppressed(SuppressReason::Cooldown));
        assert_eq!(sink.write_count(), 1);

        let req = &sink.writes.lock().unwrap()[0];
        assert_eq!(req.student_id, "S1");
        assert_eq!(req.subject, "Intro to CS");
        assert_eq!(req.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_cooldown_boundary() {
        let mut gate = gate();
        let sink = FakeSink::new();
        gate.consider_mark(&matched("S1"), "", t(0), &sink).await;

        let just_before = t(0) + Duration::seconds(300) - Duration::milliseconds(1);
        let just_after = t(0) + Duration::seconds(300) + Duration::milliseconds(1);
        assert!(!gate.is_due("S1", just_before));
        assert!(!gate.is_due("S1", t(300)));
        assert!(gate.is_due("S1", just_after));

        let outcome = gate.consider_mark(&matched("S1"), "", just_after, &sink).await;
        assert!(matches!(outcome, MarkOutcome::Marked(_)));
        assert_eq!(sink.write_count(), 2);
        assert_eq!(gate.last_marked("S1"), Some(just_after));
    }

    #[tokio::test]
    async fn test_identities_cool_down_independently() {
        let mut gate = gate();
        let sink = FakeSink::new();
        gate.consider_mark(&matched("S1"), "", t(0), &sink).await;
        let other = gate.consider_mark(&matched("S2"), "", t(1), &sink).await;
        assert!(matches!(other, MarkOutcome::Marked(_)));
        assert_eq!(sink.write_count(), 2);
    }

    #[tokio::test]
    async fn test_remote_duplicate_treated_as_suppression() {
        let sink = FakeSink::with_replies(vec![Reply::Duplicate]);
        let mut gate = gate();

        let outcome = gate.consider_mark(&matched("S1"), "", t(0), &sink).await;
        assert_eq!(outcome, MarkOutcome::Suppressed(SuppressReason::RecentlyMarked));
        assert_eq!(gate.last_marked("S1"), Some(t(0)));

        let again = gate.consider_mark(&matched("S1"), "", t(10), &sink).await;
        assert_eq!(again, MarkOutcome::Suppressed(SuppressReason::Cooldown));
        assert_eq!(sink.write_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_identity_eligible() {
        let sink = FakeSink::with_replies(vec![Reply::Fail]);
        let mut gate = gate();

        let outcome = gate.consider_mark(&matched("S1"), "", t(0), &sink).await;
        assert!(matches!(outcome, MarkOutcome::Failed(reason) if reason.contains("connection refused")));
        assert_eq!(gate.last_marked("S1"), None);

        let retry = gate.consider_mark(&matched("S1"), "", t(2), &sink).await;
        assert!(matches!(retry, MarkOutcome::Marked(_)));
        assert_eq!(sink.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_is_recoverable() {
        let sink = FakeSink::with_replies(vec![Reply::Hang]);
        let mut gate = gate();

        let outcome = gate.consider_mark(&matched("S1"), "", t(0), &sink).await;
        assert!(matches!(outcome, MarkOutcome::Failed(reason) if reason.contains("timed out")));
        assert!(gate.is_due("S1", t(1)));
    }
}
