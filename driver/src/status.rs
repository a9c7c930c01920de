//! This module persists submission status rows and publishes final status
//! events.
//!

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use judge::{Error, ErrorKind, JudgeResult, JudgeStatus, Result, unix_now};
use judge::worker::{StatusReporter, StatusUpdate};
use sandbox::Context;

use crate::ports::{MessageQueue, QueueMessage, StatusCache};

/// Prefix of status row keys in the cache.
const STATUS_KEY_PREFIX: &str = "judge:status:";

/// The status row published for one submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JudgeStatusResponse {
    /// Id of the submission.
    pub submission_id: String,

    /// Current lifecycle status.
    pub status: JudgeStatus,

    /// Verdict code, once known.
    #[serde(default)]
    pub verdict: Option<String>,

    /// Total score, once known.
    #[serde(default)]
    pub score: i64,

    /// Number of tests of the submission.
    #[serde(default)]
    pub total_tests: usize,

    /// Number of tests finished so far.
    #[serde(default)]
    pub done_tests: usize,

    /// Error code for `failed` rows; empty otherwise.
    #[serde(default)]
    pub error_code: String,

    /// Human-readable error for `failed` rows; empty otherwise.
    #[serde(default)]
    pub error_message: String,

    /// Full judge result, attached to terminal rows.
    #[serde(default)]
    pub result: Option<JudgeResult>,

    /// Unix timestamp of this update.
    pub updated_at: u64,
}

impl JudgeStatusResponse {
    /// A non-terminal progress row.
    pub fn progress(update: &StatusUpdate) -> Self {
        JudgeStatusResponse {
            submission_id: update.submission_id.clone(),
            status: update.status,
            verdict: None,
            score: 0,
            total_tests: update.total_tests,
            done_tests: update.done_tests,
            error_code: String::new(),
            error_message: String::new(),
            result: None,
            updated_at: unix_now(),
        }
    }

    /// The terminal row of a normally finished judging.
    pub fn finished(result: &JudgeResult) -> Self {
        JudgeStatusResponse {
            submission_id: result.submission_id.clone(),
            status: result.status,
            verdict: Some(result.verdict.code().to_owned()),
            score: result.summary.total_score,
            total_tests: result.tests.len(),
            done_tests: result.tests.len(),
            error_code: String::new(),
            error_message: String::new(),
            result: Some(result.clone()),
            updated_at: unix_now(),
        }
    }

    /// The terminal row of a failed judging.
    pub fn failed(submission_id: &str, error: &Error) -> Self {
        JudgeStatusResponse {
            submission_id: submission_id.to_owned(),
            status: JudgeStatus::Failed,
            verdict: Some(judge::Verdict::SystemError.code().to_owned()),
            score: 0,
            total_tests: 0,
            done_tests: 0,
            error_code: error.code().to_owned(),
            error_message: error.to_string(),
            result: None,
            updated_at: unix_now(),
        }
    }
}

/// The event published to the final status topic. Tagged so downstream
/// processors can dispatch on `type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatusEvent {
    /// A submission reached a terminal status.
    Final {
        /// The terminal status row.
        status: JudgeStatusResponse,

        /// Unix timestamp the event was created at.
        created_at: u64,
    },
}

/// Persists status rows to the cache and final events to the status topic.
pub struct StatusRepository {
    cache: Arc<dyn StatusCache>,
    queue: Arc<dyn MessageQueue>,
    final_topic: String,
    ttl: Duration,
}

impl StatusRepository {
    /// Create a repository writing rows with the given TTL and final events
    /// to `final_topic`.
    pub fn new(
        cache: Arc<dyn StatusCache>,
        queue: Arc<dyn MessageQueue>,
        final_topic: String,
        ttl: Duration) -> Self {
        StatusRepository { cache, queue, final_topic, ttl }
    }

    fn key(submission_id: &str) -> String {
        format!("{}{}", STATUS_KEY_PREFIX, submission_id)
    }

    /// Persist one status row. Terminal rows additionally publish a final
    /// event; the save fails when that publish fails, so the downstream
    /// processor sees every terminal status at least once.
    pub fn save(&self, ctx: &Context, response: &JudgeStatusResponse) -> Result<()> {
        let raw = serde_json::to_string(response)?;
        self.cache.set(&Self::key(&response.submission_id), &raw, self.ttl)?;

        if response.status.is_terminal() {
            let event = StatusEvent::Final {
                status: response.clone(),
                created_at: unix_now(),
            };
            let message = QueueMessage::new(
                response.submission_id.clone(),
                serde_json::to_string(&event)?);
            self.queue.publish(ctx, &self.final_topic, &message)
                .map_err(|e| Error::from(ErrorKind::System(format!(
                    "failed to publish final status for {}: {}",
                    response.submission_id, e))))?;
        }

        Ok(())
    }

    /// Read one status row.
    pub fn get(&self, submission_id: &str) -> Result<Option<JudgeStatusResponse>> {
        match self.cache.get(&Self::key(submission_id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read many status rows in input order. Missing submissions yield an
    /// empty string at their position and are listed in the second return.
    pub fn get_batch(&self, submission_ids: &[String])
        -> Result<(Vec<String>, Vec<String>)> {
        let keys: Vec<String> = submission_ids.iter()
            .map(|id| Self::key(id))
            .collect();
        let rows = self.cache.mget(&keys)?;

        let mut statuses = Vec::with_capacity(submission_ids.len());
        let mut missing = Vec::new();
        for (id, row) in submission_ids.iter().zip(rows) {
            match row {
                Some(raw) => statuses.push(raw),
                None => {
                    statuses.push(String::new());
                    missing.push(id.clone());
                }
            }
        }

        Ok((statuses, missing))
    }
}

/// Adapts the repository to the worker's reporter seam for intermediate
/// updates.
pub struct RepositoryReporter {
    repository: Arc<StatusRepository>,
}

impl RepositoryReporter {
    /// Create a reporter over the given repository.
    pub fn new(repository: Arc<StatusRepository>) -> Self {
        RepositoryReporter { repository }
    }
}

impl StatusReporter for RepositoryReporter {
    fn report(&self, update: &StatusUpdate) -> Result<()> {
        // Terminal transitions are persisted by the admission loop together
        // with the full result; reporting them here would race with it.
        if update.status.is_terminal() {
            return Ok(());
        }
        let response = JudgeStatusResponse::progress(update);
        self.repository.save(&Context::background(), &response)
    }
}
