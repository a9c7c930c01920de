//! This module implements the judge worker: the orchestrator that takes one
//! validated judge request through compile, per-test execution and scoring,
//! reporting status transitions along the way.
//!
//! ```text
//! Pending -> (slot acquired) -> Running -> [Compiling -> Running] -> Judging -> Finished
//!                          \-> Failed
//! ```
//!

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sandbox::{Context, ResourceLimit};

use crate::{
    CompileResult,
    JudgeResult,
    JudgeStatus,
    Result,
    ResultExt,
    Summary,
    Verdict,
    unix_now,
    validation_error,
};
use crate::manifest::{Checker, IoConfig, Manifest, ProblemConfig, Subtask, Testcase};
use crate::runner::{CompileRequest, RunRequest, Runner};

/// One emitted status transition.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    /// Submission the update belongs to.
    pub submission_id: String,

    /// The state entered.
    pub status: JudgeStatus,

    /// Number of tests the submission has in total.
    pub total_tests: usize,

    /// Number of tests finished so far.
    pub done_tests: usize,
}

/// Capability interface for publishing intermediate status.
pub trait StatusReporter: Send + Sync {
    /// Publish one status transition. Failures are logged by the worker but
    /// do not abort the judging.
    fn report(&self, update: &StatusUpdate) -> Result<()>;
}

/// A reporter that drops every update.
pub struct NullReporter;

impl StatusReporter for NullReporter {
    fn report(&self, _update: &StatusUpdate) -> Result<()> {
        Ok(())
    }
}

/// Execution plan of one test case, with every path resolved host-side.
#[derive(Clone, Debug)]
pub struct TestPlan {
    /// Id of the test case.
    pub test_id: String,

    /// Host path of the input file inside the data pack.
    pub input_path: PathBuf,

    /// Host path of the answer file, if the test has one.
    pub answer_path: Option<PathBuf>,

    /// Score of this test under per-test scoring.
    pub score: i64,

    /// Subtask this test belongs to.
    pub subtask_id: Option<String>,

    /// Per-test limit overrides.
    pub limits: Option<ResourceLimit>,

    /// Per-test checker override.
    pub checker: Option<Checker>,

    /// Language whose checker profile the checker uses.
    pub checker_language_id: Option<String>,

    /// Per-test IO override.
    pub io: Option<IoConfig>,
}

/// A fully resolved judge request, ready for execution.
#[derive(Clone, Debug)]
pub struct JudgeRequest {
    /// Id of the submission.
    pub submission_id: String,

    /// Id of the judged problem.
    pub problem_id: i64,

    /// Language of the submission.
    pub language_id: String,

    /// Host path of the downloaded source file.
    pub source_path: PathBuf,

    /// Extra compile flags carried by the queue message and the problem
    /// configuration.
    pub extra_compile_flags: Vec<String>,

    /// Problem-level default limits (language overrides already merged in).
    pub default_limits: ResourceLimit,

    /// Default IO configuration for tests without an override.
    pub io: IoConfig,

    /// Default checker for tests without an override.
    pub checker: Option<Checker>,

    /// Tests in execution order.
    pub tests: Vec<TestPlan>,

    /// Subtask structure; empty means per-test scoring.
    pub subtasks: Vec<Subtask>,
}

impl JudgeRequest {
    /// Assemble a request from a decoded manifest and problem configuration,
    /// resolving data-pack-relative paths against `pack_dir`.
    pub fn from_manifest(
        submission_id: String,
        problem_id: i64,
        language_id: String,
        source_path: PathBuf,
        message_compile_flags: &[String],
        manifest: &Manifest,
        config: &ProblemConfig,
        pack_dir: &Path) -> JudgeRequest {
        let mut default_limits = config.default_limits;
        let mut extra_compile_flags = message_compile_flags.to_vec();
        if let Some(entry) = config.language_override(&language_id) {
            extra_compile_flags.extend(entry.extra_compile_flags.iter().cloned());
            if let Some(limits) = &entry.limits {
                default_limits = limits.merge(&default_limits);
            }
        }

        let plan_of = |test: &Testcase| TestPlan {
            test_id: test.test_id.clone(),
            input_path: pack_dir.join(&test.input_path),
            answer_path: test.answer_path.as_ref().map(|p| pack_dir.join(p)),
            score: test.score,
            subtask_id: test.subtask_id.clone(),
            limits: test.limits,
            checker: test.checker.clone(),
            checker_language_id: test.checker_language_id.clone(),
            io: test.io.clone(),
        };

        JudgeRequest {
            submission_id,
            problem_id,
            language_id,
            source_path,
            extra_compile_flags,
            default_limits,
            io: manifest.io.clone(),
            checker: manifest.checker.clone(),
            tests: manifest.tests.iter().map(plan_of).collect(),
            subtasks: manifest.subtasks.clone().unwrap_or_default(),
        }
    }
}

/// Removes the submission work tree when dropped, on every exit path.
struct WorkDirGuard {
    path: PathBuf,
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove work tree {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Book-keeping of one subtask while the tests run.
struct SubtaskState {
    spec: Subtask,
    expected: usize,
    executed: usize,
    failed: bool,
}

/// The judge worker.
pub struct Worker {
    runner: Runner,
    reporter: Arc<dyn StatusReporter>,
    work_root: PathBuf,
}

impl Worker {
    /// Create a new worker storing per-submission trees under `work_root`.
    pub fn new<P>(runner: Runner, reporter: Arc<dyn StatusReporter>, work_root: P) -> Self
        where P: Into<PathBuf> {
        Worker {
            runner,
            reporter,
            work_root: work_root.into(),
        }
    }

    /// Judge one submission to completion.
    ///
    /// Compile rejection is a `Finished` result carrying the `CE` verdict.
    /// `Err` is reserved for failures of the judge itself; the caller
    /// persists those as a `Failed` status and decides retryability.
    pub fn execute(&self, ctx: &Context, req: &JudgeRequest) -> Result<JudgeResult> {
        let received_at = unix_now();
        Self::validate(req)?;

        let language = self.runner.languages().find(&req.language_id)?;
        let compile_enabled = language.compile_enabled;
        let artifact_name = if compile_enabled {
            language.binary_file.clone()
        } else {
            language.source_file.clone()
        };

        let total_tests = req.tests.len();
        let submission_root = self.work_root.join(&req.submission_id);
        std::fs::create_dir_all(&submission_root)
            .chain_err(|| format!(
                "failed to create work tree {}", submission_root.display()))?;
        let _work_guard = WorkDirGuard { path: submission_root.clone() };

        // Compile. For interpreted languages this only stages the source
        // under the language's file name.
        let compile_dir = submission_root.join("compile");
        if compile_enabled {
            self.report(req, JudgeStatus::Compiling, 0, total_tests);
        }
        let compile_result = match self.runner.compile(ctx, &CompileRequest {
            submission_id: req.submission_id.clone(),
            language_id: req.language_id.clone(),
            source_path: req.source_path.clone(),
            work_dir: compile_dir.clone(),
            extra_flags: req.extra_compile_flags.clone(),
            limits: ResourceLimit::default(),
        }) {
            Ok(result) => result,
            Err(e) => {
                self.report(req, JudgeStatus::Failed, 0, total_tests);
                return Err(e);
            }
        };

        if !compile_result.ok {
            log::info!("submission {} rejected by the compiler", req.submission_id);
            self.report(req, JudgeStatus::Finished, 0, total_tests);
            return Ok(JudgeResult {
                submission_id: req.submission_id.clone(),
                status: JudgeStatus::Finished,
                verdict: Verdict::CompileError,
                language: req.language_id.clone(),
                compile: Some(compile_result),
                tests: Vec::new(),
                summary: Summary::default(),
                received_at,
                finished_at: unix_now(),
            });
        }

        let mut subtask_states = Self::subtask_states(req);

        let mut tests = Vec::new();
        let mut summary = Summary::default();
        let mut global_failed = false;

        for (index, test) in req.tests.iter().enumerate() {
            self.report(req, JudgeStatus::Running, index, total_tests);

            let test_dir = submission_root.join(&test.test_id);
            std::fs::create_dir_all(&test_dir)
                .chain_err(|| format!(
                    "failed to create test dir {}", test_dir.display()))?;
            Self::stage_artifact(
                &compile_dir.join(&artifact_name),
                &test_dir.join(&artifact_name),
                compile_enabled)?;

            let run_req = RunRequest {
                submission_id: req.submission_id.clone(),
                test_id: test.test_id.clone(),
                language_id: req.language_id.clone(),
                work_dir: test_dir,
                input_path: test.input_path.clone(),
                answer_path: test.answer_path.clone(),
                io: test.io.clone().unwrap_or_else(|| req.io.clone()),
                limits: test.limits.unwrap_or_default().merge(&req.default_limits),
                checker: test.checker.clone().or_else(|| req.checker.clone()),
                checker_language_id: test.checker_language_id.clone(),
            };

            let mut result = match self.runner.run(ctx, &run_req) {
                Ok(result) => result,
                Err(e) => {
                    self.report(req, JudgeStatus::Failed, index, total_tests);
                    return Err(e);
                }
            };
            result.subtask_id = test.subtask_id.clone();

            let accepted = result.verdict.is_accepted();
            if accepted && req.subtasks.is_empty() {
                result.score = test.score;
            }

            summary.total_time_ms += result.time_ms;
            if result.memory_kb > summary.max_memory_kb {
                summary.max_memory_kb = result.memory_kb;
            }

            if let Some(subtask_id) = &test.subtask_id {
                if let Some(state) = subtask_states.get_mut(subtask_id) {
                    state.executed += 1;
                    state.failed |= !accepted;
                }
            }

            tests.push(result);

            if !accepted {
                if summary.failed_test_id.is_none() {
                    summary.failed_test_id = Some(test.test_id.clone());
                }
                global_failed = true;
                break;
            }
        }

        self.report(req, JudgeStatus::Judging, tests.len(), total_tests);

        summary.total_score = if req.subtasks.is_empty() {
            tests.iter()
                .filter(|tc| tc.verdict.is_accepted())
                .map(|tc| tc.score)
                .sum()
        } else {
            subtask_states.values()
                .filter(|state| state.executed == state.expected && !state.failed)
                .map(|state| state.spec.score)
                .sum()
        };

        let verdict = if global_failed {
            tests.last().map(|tc| tc.verdict).unwrap_or(Verdict::SystemError)
        } else {
            Verdict::Accepted
        };

        self.report(req, JudgeStatus::Finished, tests.len(), total_tests);

        Ok(JudgeResult {
            submission_id: req.submission_id.clone(),
            status: JudgeStatus::Finished,
            verdict,
            language: req.language_id.clone(),
            compile: if compile_enabled { Some(compile_result) } else { None },
            tests,
            summary,
            received_at,
            finished_at: unix_now(),
        })
    }

    fn validate(req: &JudgeRequest) -> Result<()> {
        if req.submission_id.is_empty() {
            return Err(validation_error("empty submission id"));
        }
        if req.language_id.is_empty() {
            return Err(validation_error("empty language id"));
        }
        if req.tests.is_empty() {
            return Err(validation_error("no test cases to run"));
        }
        req.io.validate()?;

        for test in &req.tests {
            if let Some(io) = &test.io {
                io.validate()?;
            }
            let checker = test.checker.as_ref().or(req.checker.as_ref());
            if checker.is_some() && test.answer_path.is_none() {
                return Err(validation_error(format!(
                    "test {} has a checker but no answer file", test.test_id)));
            }
            if let Some(subtask_id) = &test.subtask_id {
                if !req.subtasks.iter().any(|subtask| &subtask.id == subtask_id) {
                    return Err(validation_error(format!(
                        "test {} references unknown subtask {}",
                        test.test_id, subtask_id)));
                }
            }
        }

        Ok(())
    }

    fn subtask_states(req: &JudgeRequest) -> HashMap<String, SubtaskState> {
        let mut states: HashMap<String, SubtaskState> = req.subtasks.iter()
            .map(|subtask| (subtask.id.clone(), SubtaskState {
                spec: subtask.clone(),
                expected: 0,
                executed: 0,
                failed: false,
            }))
            .collect();
        for test in &req.tests {
            if let Some(subtask_id) = &test.subtask_id {
                if let Some(state) = states.get_mut(subtask_id) {
                    state.expected += 1;
                }
            }
        }
        states
    }

    /// Copy the compile artifact into a test work dir, marking it executable
    /// when it is a binary.
    fn stage_artifact(source: &Path, target: &Path, executable: bool) -> Result<()> {
        std::fs::copy(source, target)
            .chain_err(|| format!("failed to stage {}", target.display()))?;
        if executable {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
                .chain_err(|| format!(
                    "failed to mark {} executable", target.display()))?;
        }
        Ok(())
    }

    fn report(&self, req: &JudgeRequest, status: JudgeStatus, done: usize, total: usize) {
        let update = StatusUpdate {
            submission_id: req.submission_id.clone(),
            status,
            total_tests: total,
            done_tests: done,
        };
        if let Err(e) = self.reporter.report(&update) {
            log::warn!("failed to report {} for {}: {}",
                status, req.submission_id, e);
        }
    }
}
