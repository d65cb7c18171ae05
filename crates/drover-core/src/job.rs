use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Queue-assigned job identifier
pub type JobId = u64;

/// Identifies the backend connection a job was reserved from (server address)
pub type ConnectionId = String;

/// Counters the queue reports for a single job. Unknown keys in the stats
/// reply are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStats {
    /// Seconds since the job was inserted
    #[serde(default)]
    pub age: u64,

    /// Delay that was applied on the last release
    #[serde(default)]
    pub delay: u64,

    #[serde(default = "default_pri")]
    pub pri: u32,

    #[serde(default)]
    pub releases: u64,

    #[serde(default)]
    pub timeouts: u64,
}

fn default_pri() -> u32 {
    1024
}

impl Default for JobStats {
    fn default() -> Self {
        JobStats {
            age: 0,
            delay: 0,
            pri: default_pri(),
            releases: 0,
            timeouts: 0,
        }
    }
}

/// A job reserved from the queue. Owned by exactly one worker while
/// reserved; the worker never mutates it except through the terminal queue
/// operations (delete, release, decay).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,

    /// The connection this job was reserved from; terminal operations must
    /// go back through it
    pub conn: ConnectionId,

    /// Raw body as inserted by the producer
    pub body: Bytes,

    /// Decoded body, discriminated on the `kind` field
    pub payload: Payload,

    pub stats: JobStats,
}

impl Job {
    pub fn new(id: JobId, conn: ConnectionId, body: impl Into<Bytes>, stats: JobStats) -> Self {
        let body = body.into();
        let payload = Payload::decode(&body);
        Job {
            id,
            conn,
            body,
            payload,
            stats,
        }
    }

    /// Time since the job was inserted into the queue
    pub fn age(&self) -> Duration {
        Duration::from_secs(self.stats.age)
    }

    /// Release delay to apply when this job is decayed: the previous delay
    /// grown by 30%, never less than a second.
    pub fn decay_delay(&self) -> u32 {
        let prev = self.stats.delay.max(1) as f64;
        (prev * 1.3).ceil() as u32
    }
}

/// Decoded job body. Bodies that are not JSON, or whose `kind` is not one
/// this worker executes natively, are `Foreign` and get routed to the
/// foreign-job hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A job dispatched through the handler registry
    Task(TaskPayload),
    /// Produced by some other system; the worker has no native handler
    Foreign,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskPayload {
    /// Handler name to dispatch to (e.g. "send_email")
    pub task_type: String,

    /// Arbitrary arguments passed through to the handler
    #[serde(default)]
    pub args: serde_json::Value,

    /// Delete the job before running it instead of after; a crash mid-run
    /// then drops the job rather than retrying it
    #[serde(default)]
    pub delete_first: bool,

    /// When the producer enqueued the job
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl Payload {
    pub fn decode(body: &[u8]) -> Payload {
        #[derive(Deserialize)]
        #[serde(tag = "kind", rename_all = "snake_case")]
        enum Tagged {
            Task(TaskPayload),
        }

        match serde_json::from_slice::<Tagged>(body) {
            Ok(Tagged::Task(task)) => Payload::Task(task),
            Err(_) => Payload::Foreign,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_task_payload() {
        let body = br#"{"kind": "task", "task_type": "send_email", "args": {"to": "x"}}"#;
        match Payload::decode(body) {
            Payload::Task(task) => {
                assert_eq!(task.task_type, "send_email");
                assert_eq!(task.args["to"], "x");
                assert!(!task.delete_first);
            }
            other => panic!("expected task payload, got {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_foreign() {
        let body = br#"{"kind": "mailer", "to": "x"}"#;
        assert_eq!(Payload::decode(body), Payload::Foreign);
    }

    #[test]
    fn non_json_body_is_foreign() {
        assert_eq!(Payload::decode(b"plain text job"), Payload::Foreign);
    }

    #[test]
    fn delete_first_flag_round_trips() {
        let body = br#"{"kind": "task", "task_type": "t", "delete_first": true}"#;
        match Payload::decode(body) {
            Payload::Task(task) => assert!(task.delete_first),
            other => panic!("expected task payload, got {:?}", other),
        }
    }

    #[test]
    fn decay_delay_grows_previous_delay() {
        let mut job = Job::new(1, "a:1".to_string(), Vec::new(), JobStats::default());
        // No previous delay: floor of one second, grown
        assert_eq!(job.decay_delay(), 2);

        job.stats.delay = 10;
        assert_eq!(job.decay_delay(), 13);

        job.stats.delay = 100;
        assert_eq!(job.decay_delay(), 130);
    }

    #[test]
    fn age_comes_from_stats() {
        let job = Job::new(
            1,
            "a:1".to_string(),
            Vec::new(),
            JobStats {
                age: 75,
                ..Default::default()
            },
        );
        assert_eq!(job.age(), Duration::from_secs(75));
    }
}
