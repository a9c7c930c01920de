//! This module implements the judge task message received from the bus.
//!

use serde::{Serialize, Deserialize};

use judge::{Result, validation_error};

/// A validated judge task, decoded from the JSON body of a queue message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JudgeMessage {
    /// Id of the submission to judge.
    pub submission_id: String,

    /// Id of the judged problem.
    pub problem_id: i64,

    /// Language the submission is written in.
    pub language_id: String,

    /// Object storage key of the source file.
    pub source_key: String,

    /// Expected sha-256 of the source, hex encoded; empty disables the
    /// check.
    #[serde(default)]
    pub source_hash: String,

    /// Contest the submission belongs to, zero for practice.
    #[serde(default)]
    pub contest_id: i64,

    /// Id of the submitting user.
    #[serde(default)]
    pub user_id: i64,

    /// Scheduling priority assigned by the gateway.
    #[serde(default)]
    pub priority: i32,

    /// Extra flags appended to the compile command.
    #[serde(default)]
    pub extra_compile_flags: Vec<String>,
}

impl JudgeMessage {
    /// Decode and validate a message body.
    pub fn decode(raw: &str) -> Result<JudgeMessage> {
        let message: JudgeMessage = serde_json::from_str(raw)
            .map_err(|e| validation_error(format!("malformed judge message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    /// Encode this message as a JSON body.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(judge::Error::from)
    }

    /// Check the required fields.
    pub fn validate(&self) -> Result<()> {
        if self.submission_id.is_empty() {
            return Err(validation_error("empty submission id"));
        }
        if self.problem_id <= 0 {
            return Err(validation_error(format!(
                "invalid problem id {}", self.problem_id)));
        }
        if self.language_id.is_empty() {
            return Err(validation_error("empty language id"));
        }
        if self.source_key.is_empty() {
            return Err(validation_error("empty source key"));
        }

        Ok(())
    }
}
