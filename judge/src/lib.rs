//! This crate implements the core logic of the judge: the verdict and result
//! model, the language and isolation profile tables, the data-pack manifest,
//! the runner that drives single sandboxed tasks and the worker that
//! orchestrates a whole submission.
//!

pub mod languages;
pub mod limits;
pub mod manifest;
pub mod profiles;
pub mod runner;
pub mod worker;

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Serialize, Deserialize};

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(sandbox::Error, sandbox::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
    }

    errors {
        Validation(message: String) {
            description("validation failure")
            display("validation failure: {}", message)
        }

        LanguageNotSupported(language: String) {
            description("language not supported")
            display("language not supported: {}", language)
        }

        ProfileNotFound(profile: String) {
            description("isolation profile not found")
            display("isolation profile not found: {}", profile)
        }

        ProblemNotFound(problem_id: i64) {
            description("problem not found")
            display("problem not found: {}", problem_id)
        }

        QueueFull {
            description("judge worker pool is full")
        }

        Cache(message: String) {
            description("data pack cache failure")
            display("data pack cache failure: {}", message)
        }

        LockFailed(message: String) {
            description("lock service failure")
            display("lock service failure: {}", message)
        }

        Timeout(message: String) {
            description("operation timed out")
            display("operation timed out: {}", message)
        }

        System(message: String) {
            description("judge system error")
            display("judge system error: {}", message)
        }

        Cancelled {
            description("judging cancelled")
        }
    }
}

impl Error {
    /// Whether this error is the non-retryable kind: the message must be
    /// acknowledged and the failure recorded in the status row instead of
    /// being handed back to the broker.
    pub fn is_non_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Validation(..)
            | ErrorKind::LanguageNotSupported(..)
            | ErrorKind::ProfileNotFound(..)
            | ErrorKind::ProblemNotFound(..) => true,
            _ => false,
        }
    }

    /// Whether this error came from a cancelled context.
    pub fn is_cancelled(&self) -> bool {
        match self.kind() {
            ErrorKind::Cancelled => true,
            ErrorKind::Sandbox(sandbox::ErrorKind::Cancelled) => true,
            _ => false,
        }
    }

    /// Short machine-readable code of this error kind, recorded in failed
    /// status rows.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation(..) => "VALIDATION_FAILURE",
            ErrorKind::LanguageNotSupported(..) => "LANGUAGE_NOT_SUPPORTED",
            ErrorKind::ProfileNotFound(..) => "PROFILE_NOT_FOUND",
            ErrorKind::ProblemNotFound(..) => "PROBLEM_NOT_FOUND",
            ErrorKind::QueueFull => "JUDGE_QUEUE_FULL",
            ErrorKind::Cache(..) => "CACHE_ERROR",
            ErrorKind::LockFailed(..) => "LOCK_FAILED",
            ErrorKind::Timeout(..) => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Sandbox(sandbox::ErrorKind::Cancelled) => "CANCELLED",
            _ => "JUDGE_SYSTEM_ERROR",
        }
    }
}

/// Build a validation failure.
pub fn validation_error<T>(message: T) -> Error
    where T: Into<String> {
    Error::from(ErrorKind::Validation(message.into()))
}

/// Verdict of a single test case or of a whole submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// The program produced the expected answer.
    #[serde(rename = "AC")]
    Accepted,

    /// The program produced a wrong answer.
    #[serde(rename = "WA")]
    WrongAnswer,

    /// The program ran out of CPU or wall clock time.
    #[serde(rename = "TLE")]
    TimeLimitExceeded,

    /// The program ran out of memory.
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,

    /// The program produced more output than allowed.
    #[serde(rename = "OLE")]
    OutputLimitExceeded,

    /// The program exited abnormally.
    #[serde(rename = "RE")]
    RuntimeError,

    /// The program could not be compiled.
    #[serde(rename = "CE")]
    CompileError,

    /// The judge itself failed; the verdict carries no information about the
    /// program.
    #[serde(rename = "SE")]
    SystemError,
}

impl Verdict {
    /// Determine whether this verdict is `Verdict::Accepted`.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    /// Short code of this verdict, as published in status rows.
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::OutputLimitExceeded => "OLE",
            Verdict::RuntimeError => "RE",
            Verdict::CompileError => "CE",
            Verdict::SystemError => "SE",
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Lifecycle state of one submission inside the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeStatus {
    /// Accepted from the queue, waiting for a worker slot.
    Pending,

    /// A worker slot is executing the submission.
    Running,

    /// The submission's source is being compiled.
    Compiling,

    /// All tests are done; scores are being aggregated.
    Judging,

    /// Judging completed normally; the verdict is meaningful.
    Finished,

    /// Judging aborted; the status row carries an error code.
    Failed,
}

impl JudgeStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JudgeStatus::Finished | JudgeStatus::Failed)
    }
}

impl Display for JudgeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JudgeStatus::Pending => "pending",
            JudgeStatus::Running => "running",
            JudgeStatus::Compiling => "compiling",
            JudgeStatus::Judging => "judging",
            JudgeStatus::Finished => "finished",
            JudgeStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of compiling a submission's source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    /// Whether compilation succeeded.
    pub ok: bool,

    /// Exit code of the compiler.
    pub exit_code: i32,

    /// Compiler diagnostics on failure, engine error text on engine failure.
    pub error: String,

    /// Host-side path of the captured compile log, if any.
    pub log_path: Option<PathBuf>,
}

impl CompileResult {
    /// A successful compilation that did not need to run a compiler.
    pub fn skipped() -> Self {
        CompileResult {
            ok: true,
            exit_code: 0,
            error: String::new(),
            log_path: None,
        }
    }
}

/// Judged outcome of one executed test case.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseResult {
    /// Id of the test case within the manifest.
    pub test_id: String,

    /// Verdict of this test case.
    pub verdict: Verdict,

    /// CPU time consumed, in milliseconds.
    pub time_ms: i64,

    /// Peak memory usage, in kilobytes.
    pub memory_kb: i64,

    /// Captured output size, in kilobytes.
    pub output_kb: i64,

    /// Exit code of the program (`-1` for deadline kills).
    pub exit_code: i32,

    /// Host-side path of the runtime log.
    pub runtime_log_path: PathBuf,

    /// Host-side path of the checker log, when a checker ran.
    pub checker_log_path: Option<PathBuf>,

    /// Truncated standard output of the program.
    pub stdout: String,

    /// Truncated standard error of the program.
    pub stderr: String,

    /// Score awarded for this test case.
    pub score: i64,

    /// Subtask this test case belongs to, if any.
    pub subtask_id: Option<String>,
}

/// Aggregate figures of one judged submission.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Total CPU time over all executed tests, in milliseconds.
    pub total_time_ms: i64,

    /// Maximum peak memory over all executed tests, in kilobytes.
    pub max_memory_kb: i64,

    /// Total score awarded.
    pub total_score: i64,

    /// Id of the first failing test, if any.
    pub failed_test_id: Option<String>,
}

/// Complete outcome of one judged submission.
///
/// `tests` holds results in manifest order and may be shorter than the
/// manifest's test list: tests skipped by the early exit on the first non-AC
/// verdict do not appear at all.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    /// Id of the judged submission.
    pub submission_id: String,

    /// Final lifecycle status.
    pub status: JudgeStatus,

    /// Final verdict.
    pub verdict: Verdict,

    /// Language the submission was judged as.
    pub language: String,

    /// Compilation outcome, when the language compiles.
    pub compile: Option<CompileResult>,

    /// Per-test results of every executed test, in manifest order.
    pub tests: Vec<TestcaseResult>,

    /// Aggregate figures.
    pub summary: Summary,

    /// Unix timestamp at which the worker received the submission.
    pub received_at: u64,

    /// Unix timestamp at which judging finished.
    pub finished_at: u64,
}

/// Current unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod verdict {
        use super::*;

        #[test]
        fn codes_round_trip_through_json() {
            for verdict in &[
                Verdict::Accepted,
                Verdict::WrongAnswer,
                Verdict::TimeLimitExceeded,
                Verdict::MemoryLimitExceeded,
                Verdict::OutputLimitExceeded,
                Verdict::RuntimeError,
                Verdict::CompileError,
                Verdict::SystemError,
            ] {
                let encoded = serde_json::to_string(verdict).unwrap();
                assert_eq!(format!("\"{}\"", verdict.code()), encoded);
                let decoded: Verdict = serde_json::from_str(&encoded).unwrap();
                assert_eq!(*verdict, decoded);
            }
        }

        #[test]
        fn only_accepted_is_accepted() {
            assert!(Verdict::Accepted.is_accepted());
            assert!(!Verdict::WrongAnswer.is_accepted());
            assert!(!Verdict::SystemError.is_accepted());
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn validation_is_non_retryable() {
            assert!(validation_error("bad message").is_non_retryable());
            assert!(Error::from(ErrorKind::LanguageNotSupported(String::from("cobol")))
                .is_non_retryable());
        }

        #[test]
        fn infrastructure_errors_are_retryable() {
            assert!(!Error::from(ErrorKind::Cache(String::from("boom"))).is_non_retryable());
            assert!(!Error::from(ErrorKind::System(String::from("boom"))).is_non_retryable());
            assert!(!Error::from(ErrorKind::QueueFull).is_non_retryable());
        }

        #[test]
        fn cancelled_is_detected_through_the_sandbox_link() {
            let engine_err = sandbox::Error::from(sandbox::ErrorKind::Cancelled);
            let err: Error = engine_err.into();
            assert!(err.is_cancelled());
        }
    }

    mod status {
        use super::*;

        #[test]
        fn terminal_states() {
            assert!(JudgeStatus::Finished.is_terminal());
            assert!(JudgeStatus::Failed.is_terminal());
            assert!(!JudgeStatus::Running.is_terminal());
            assert!(!JudgeStatus::Judging.is_terminal());
        }
    }
}
