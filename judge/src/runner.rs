//! This module implements the runner: the layer that turns compile, run and
//! checker requests into sandbox executions and maps raw results onto
//! verdicts.
//!

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sandbox::{BindMount, Context, Engine, ResourceLimit, RunResult, RunSpec};

use crate::{
    CompileResult,
    Error,
    ErrorKind,
    Result,
    ResultExt,
    TestcaseResult,
    Verdict,
    validation_error,
};
use crate::languages::{self, LanguageRegistry};
use crate::limits::apply_limits;
use crate::manifest::{Checker, IoConfig, IoMode};
use crate::profiles::{ProfileResolver, TaskType};

/// The in-sandbox work directory every task runs under.
const SANDBOX_WORK_DIR: &str = "/work";

/// Synthetic task id of compile runs.
const COMPILE_TASK_ID: &str = "compile";

/// A request to compile one submission's source.
#[derive(Clone, Debug)]
pub struct CompileRequest {
    /// Id of the submission.
    pub submission_id: String,

    /// Language the source is written in.
    pub language_id: String,

    /// Host path of the downloaded source file.
    pub source_path: PathBuf,

    /// Host path of the directory the compilation runs in.
    pub work_dir: PathBuf,

    /// Extra flags substituted into the compile template.
    pub extra_flags: Vec<String>,

    /// Limit overrides for the compile task.
    pub limits: ResourceLimit,
}

/// A request to run one submission against one test case.
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// Id of the submission.
    pub submission_id: String,

    /// Id of the test case.
    pub test_id: String,

    /// Language the submission runs as.
    pub language_id: String,

    /// Host path of the directory the run executes in. The compiled binary
    /// (or the source, for interpreted languages) must already be inside.
    pub work_dir: PathBuf,

    /// Host path of the test input file.
    pub input_path: PathBuf,

    /// Host path of the answer file, when the test has one.
    pub answer_path: Option<PathBuf>,

    /// IO configuration of this test.
    pub io: IoConfig,

    /// Limit overrides of this test.
    pub limits: ResourceLimit,

    /// Checker to run on accepted output, if any.
    pub checker: Option<Checker>,

    /// Language whose checker profile applies; falls back to the
    /// submission's language.
    pub checker_language_id: Option<String>,
}

/// The runner drives single sandboxed tasks on behalf of the worker.
pub struct Runner {
    engine: Arc<dyn Engine>,
    languages: Arc<LanguageRegistry>,
    profiles: Arc<ProfileResolver>,
}

impl Runner {
    /// Create a new `Runner` over the given engine and tables.
    pub fn new(
        engine: Arc<dyn Engine>,
        languages: Arc<LanguageRegistry>,
        profiles: Arc<ProfileResolver>) -> Self {
        Runner { engine, languages, profiles }
    }

    /// The language registry this runner resolves against.
    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    /// Compile the submission source into the request's work directory.
    ///
    /// Returns `Ok` with `ok = false` when the compiler rejected the source
    /// (a verdict, not an error) and `Err` when the sandbox itself failed.
    pub fn compile(&self, ctx: &Context, req: &CompileRequest) -> Result<CompileResult> {
        let language = self.languages.find(&req.language_id)?;

        std::fs::create_dir_all(&req.work_dir)
            .chain_err(|| format!("failed to create work dir {}", req.work_dir.display()))?;
        let source_target = req.work_dir.join(&language.source_file);
        std::fs::copy(&req.source_path, &source_target)
            .chain_err(|| format!("failed to place source at {}", source_target.display()))?;

        if !language.compile_enabled {
            return Ok(CompileResult::skipped());
        }

        let profile = self.profiles.resolve(&req.language_id, TaskType::Compile)?;
        let cmd = languages::expand_command(
            &language.compile_cmd_tpl,
            &language.source_file,
            &language.binary_file,
            &req.extra_flags)?;

        let log_path = req.work_dir.join("compile.log");
        let spec = RunSpec {
            submission_id: req.submission_id.clone(),
            test_id: String::from(COMPILE_TASK_ID),
            work_dir: PathBuf::from(SANDBOX_WORK_DIR),
            cmd,
            env: language.env.clone(),
            stdin_path: None,
            stdout_path: req.work_dir.join("compile.out.log"),
            stderr_path: log_path.clone(),
            mounts: vec![BindMount::new(&req.work_dir, SANDBOX_WORK_DIR)],
            profile: profile.name(),
            limits: apply_limits(&req.limits, &profile.default_limits, language),
        };

        let result = self.engine.run(ctx, &spec)?;
        log::debug!("compile of {} exited with {}", req.submission_id, result.exit_code);

        let ok = result.exit_code == 0;
        Ok(CompileResult {
            ok,
            exit_code: result.exit_code,
            error: if ok { String::new() } else { result.stderr },
            log_path: Some(log_path),
        })
    }

    /// Run the submission against one test case and judge the outcome.
    pub fn run(&self, ctx: &Context, req: &RunRequest) -> Result<TestcaseResult> {
        let language = self.languages.find(&req.language_id)?;
        let profile = self.profiles.resolve(&req.language_id, TaskType::Run)?;

        req.io.validate()?;
        if req.input_path.as_os_str().is_empty() {
            return Err(validation_error(format!(
                "test {} has no input path", req.test_id)));
        }
        if req.checker.is_some() && req.answer_path.is_none() {
            return Err(validation_error(format!(
                "test {} has a checker but no answer file", req.test_id)));
        }

        let input_name = req.io.input_name().to_owned();
        let output_name = req.io.output_name().to_owned();

        let cmd = languages::expand_command(
            &language.run_cmd_tpl,
            &language.source_file,
            &language.binary_file,
            &[])?;

        let sandbox_work = Path::new(SANDBOX_WORK_DIR);
        let runtime_log = req.work_dir.join("runtime.log");

        // In stdio mode the program's stdout is the answer file; in file IO
        // mode the program writes the named output file itself and stdout is
        // only kept as a log.
        let (stdin_path, stdout_path) = match req.io.mode {
            IoMode::Stdio => (
                Some(sandbox_work.join(&input_name)),
                req.work_dir.join(&output_name),
            ),
            IoMode::FileIo => (
                None,
                req.work_dir.join("stdout.log"),
            ),
        };

        let mut mounts = vec![
            BindMount::new(&req.work_dir, SANDBOX_WORK_DIR),
            BindMount::read_only(&req.input_path, sandbox_work.join(&input_name)),
        ];
        if let Some(answer) = &req.answer_path {
            mounts.push(BindMount::read_only(answer, sandbox_work.join("answer.txt")));
        }

        let limits = apply_limits(&req.limits, &profile.default_limits, language);
        let spec = RunSpec {
            submission_id: req.submission_id.clone(),
            test_id: req.test_id.clone(),
            work_dir: PathBuf::from(SANDBOX_WORK_DIR),
            cmd,
            env: language.env.clone(),
            stdin_path,
            stdout_path: stdout_path.clone(),
            stderr_path: runtime_log.clone(),
            mounts,
            profile: profile.name(),
            limits,
        };

        let result = self.engine.run(ctx, &spec)?;
        let mut verdict = map_verdict(&result, &limits);
        log::debug!("test {}:{} raw verdict {}", req.submission_id, req.test_id, verdict);

        let mut checker_log_path = None;
        if verdict.is_accepted() {
            if let Some(checker) = &req.checker {
                let output_host = match req.io.mode {
                    IoMode::Stdio => stdout_path.clone(),
                    IoMode::FileIo => req.work_dir.join(&output_name),
                };
                let (checker_verdict, log) = self.run_checker(
                    ctx, req, checker, &input_name, &output_name, &output_host)?;
                verdict = checker_verdict;
                checker_log_path = Some(log);
            }
        }

        Ok(TestcaseResult {
            test_id: req.test_id.clone(),
            verdict,
            time_ms: result.time_ms,
            memory_kb: result.memory_kb,
            output_kb: result.output_kb,
            exit_code: result.exit_code,
            runtime_log_path: runtime_log,
            checker_log_path,
            stdout: result.stdout,
            stderr: result.stderr,
            score: 0,
            subtask_id: None,
        })
    }

    /// Run the answer checker in its own sandbox. A checker that exits
    /// non-zero votes wrong answer; a sandbox failure while checking is a
    /// system error verdict (cancellation still propagates).
    fn run_checker(
        &self,
        ctx: &Context,
        req: &RunRequest,
        checker: &Checker,
        input_name: &str,
        output_name: &str,
        output_host: &Path) -> Result<(Verdict, PathBuf)> {
        let checker_language = checker.language_id.as_deref()
            .or(req.checker_language_id.as_deref())
            .unwrap_or(&req.language_id);
        let profile = self.profiles.resolve(checker_language, TaskType::Checker)?;

        let sandbox_work = Path::new(SANDBOX_WORK_DIR);
        let answer = req.answer_path.as_ref().ok_or_else(|| {
            validation_error(format!("test {} has no answer file", req.test_id))
        })?;

        let mut cmd = Vec::with_capacity(checker.args.len() + 4);
        cmd.push(checker.binary.clone());
        cmd.extend(checker.args.iter().cloned());
        cmd.push(sandbox_work.join(input_name).to_string_lossy().into_owned());
        cmd.push(sandbox_work.join(output_name).to_string_lossy().into_owned());
        cmd.push(sandbox_work.join("answer.txt").to_string_lossy().into_owned());

        let checker_log = req.work_dir.join("checker.log");
        let spec = RunSpec {
            submission_id: req.submission_id.clone(),
            test_id: format!("{}-checker", req.test_id),
            work_dir: PathBuf::from(SANDBOX_WORK_DIR),
            cmd,
            env: Vec::new(),
            stdin_path: None,
            stdout_path: req.work_dir.join("checker.out.log"),
            stderr_path: checker_log.clone(),
            mounts: vec![
                BindMount::new(&req.work_dir, SANDBOX_WORK_DIR),
                BindMount::read_only(&req.input_path, sandbox_work.join(input_name)),
                // The program's output must not be rewritable by the checker.
                BindMount::read_only(output_host, sandbox_work.join(output_name)),
                BindMount::read_only(answer, sandbox_work.join("answer.txt")),
            ],
            profile: profile.name(),
            limits: profile.default_limits,
        };

        match self.engine.run(ctx, &spec) {
            Ok(result) if result.exit_code == 0 => Ok((Verdict::Accepted, checker_log)),
            Ok(..) => Ok((Verdict::WrongAnswer, checker_log)),
            Err(e) => {
                let err: Error = e.into();
                if err.is_cancelled() {
                    return Err(err);
                }
                log::error!("checker failed for test {}:{}: {}",
                    req.submission_id, req.test_id, err);
                Ok((Verdict::SystemError, checker_log))
            }
        }
    }

    /// Interactive judging is declared in the task model but has no
    /// protocol; refuse it explicitly rather than guessing one.
    pub fn run_interactive(&self, _ctx: &Context, req: &RunRequest) -> Result<TestcaseResult> {
        let _ = req;
        Err(Error::from(ErrorKind::LanguageNotSupported(
            String::from("interactive judging"))))
    }
}

/// Map a raw sandbox result onto a verdict under the given limits.
///
/// The order is fixed: deadline kills are time limits; the OOM killer and
/// memory-over-cap are memory limits; the output cap is only considered once
/// memory is known to be within bounds.
pub fn map_verdict(result: &RunResult, limits: &ResourceLimit) -> Verdict {
    if result.exit_code == -1 {
        return Verdict::TimeLimitExceeded;
    }
    if result.oom_killed {
        return Verdict::MemoryLimitExceeded;
    }
    if limits.memory_mb > 0 && result.memory_kb > limits.memory_mb * 1024 {
        return Verdict::MemoryLimitExceeded;
    }
    if limits.output_mb > 0 && result.output_kb > limits.output_mb * 1024 {
        return Verdict::OutputLimitExceeded;
    }
    if result.exit_code != 0 {
        return Verdict::RuntimeError;
    }

    Verdict::Accepted
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::languages::LanguageSpec;
    use crate::profiles::TaskProfile;

    /// An engine stand-in that records specs and replays scripted results.
    pub(crate) struct MockEngine {
        pub specs: Mutex<Vec<RunSpec>>,
        script: Box<dyn Fn(&RunSpec) -> sandbox::Result<RunResult> + Send + Sync>,
    }

    impl MockEngine {
        pub fn new<F>(script: F) -> Arc<Self>
            where F: Fn(&RunSpec) -> sandbox::Result<RunResult> + Send + Sync + 'static {
            Arc::new(MockEngine {
                specs: Mutex::new(Vec::new()),
                script: Box::new(script),
            })
        }
    }

    impl Engine for MockEngine {
        fn run(&self, _ctx: &Context, spec: &RunSpec) -> sandbox::Result<RunResult> {
            self.specs.lock().unwrap().push(spec.clone());
            (self.script)(spec)
        }

        fn kill_submission(&self, _submission_id: &str) -> sandbox::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn accepted_result() -> RunResult {
        RunResult {
            exit_code: 0,
            time_ms: 42,
            memory_kb: 10_240,
            output_kb: 1,
            stdout: String::from("42\n"),
            stderr: String::new(),
            oom_killed: false,
            wall_time_ms: 50,
        }
    }

    fn cpp_language() -> LanguageSpec {
        let mut spec = LanguageSpec::plain("cpp", "main.cpp", "main");
        spec.compile_enabled = true;
        spec.compile_cmd_tpl = String::from("g++ -O2 {extraFlags} -o {bin} {src}");
        spec.run_cmd_tpl = String::from("./{bin}");
        spec
    }

    fn python_language() -> LanguageSpec {
        let mut spec = LanguageSpec::plain("python", "main.py", "main.py");
        spec.run_cmd_tpl = String::from("python3 {src}");
        spec
    }

    fn profile(language_id: &str, task_type: TaskType) -> TaskProfile {
        TaskProfile {
            language_id: language_id.to_owned(),
            task_type,
            root_fs: PathBuf::from("/srv/rootfs/default"),
            seccomp_profile: String::from("default"),
            default_limits: ResourceLimit {
                cpu_time_ms: 1000,
                wall_time_ms: 3000,
                memory_mb: 256,
                stack_mb: 64,
                output_mb: 16,
                pids: 16,
            },
        }
    }

    fn runner(engine: Arc<MockEngine>) -> Runner {
        Runner::new(
            engine,
            Arc::new(LanguageRegistry::new(vec![cpp_language(), python_language()])),
            Arc::new(ProfileResolver::new(vec![
                profile("cpp", TaskType::Compile),
                profile("cpp", TaskType::Run),
                profile("cpp", TaskType::Checker),
                profile("python", TaskType::Run),
            ])),
        )
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    mod verdict_mapping {
        use super::*;

        fn limits() -> ResourceLimit {
            ResourceLimit {
                cpu_time_ms: 1000,
                wall_time_ms: 3000,
                memory_mb: 256,
                stack_mb: 0,
                output_mb: 16,
                pids: 0,
            }
        }

        #[test]
        fn deadline_kill_is_tle() {
            let result = RunResult { exit_code: -1, ..accepted_result() };
            assert_eq!(Verdict::TimeLimitExceeded, map_verdict(&result, &limits()));
        }

        #[test]
        fn oom_kill_is_mle() {
            let result = RunResult {
                exit_code: 128 + 9,
                oom_killed: true,
                ..accepted_result()
            };
            assert_eq!(Verdict::MemoryLimitExceeded, map_verdict(&result, &limits()));
        }

        #[test]
        fn memory_over_cap_is_mle() {
            let result = RunResult { memory_kb: 256 * 1024 + 1, ..accepted_result() };
            assert_eq!(Verdict::MemoryLimitExceeded, map_verdict(&result, &limits()));
        }

        #[test]
        fn output_over_cap_is_ole_only_without_mle() {
            let over_output = RunResult { output_kb: 16 * 1024 + 1, ..accepted_result() };
            assert_eq!(Verdict::OutputLimitExceeded, map_verdict(&over_output, &limits()));

            // When both caps are blown, memory wins.
            let over_both = RunResult {
                memory_kb: 256 * 1024 + 1,
                output_kb: 16 * 1024 + 1,
                ..accepted_result()
            };
            assert_eq!(Verdict::MemoryLimitExceeded, map_verdict(&over_both, &limits()));
        }

        #[test]
        fn nonzero_exit_is_re() {
            let result = RunResult { exit_code: 1, ..accepted_result() };
            assert_eq!(Verdict::RuntimeError, map_verdict(&result, &limits()));
        }

        #[test]
        fn clean_run_is_ac() {
            assert_eq!(Verdict::Accepted, map_verdict(&accepted_result(), &limits()));
        }

        #[test]
        fn unbounded_limits_never_fire() {
            let result = RunResult {
                memory_kb: 10_000_000,
                output_kb: 10_000_000,
                ..accepted_result()
            };
            assert_eq!(Verdict::Accepted, map_verdict(&result, &ResourceLimit::default()));
        }
    }

    mod compile {
        use super::*;

        #[test]
        fn interpreted_language_skips_the_compiler() {
            let dir = tempfile::tempdir().unwrap();
            let source = write_file(dir.path(), "sub.py", "print(42)");
            let engine = MockEngine::new(|_| Ok(accepted_result()));
            let runner = runner(engine.clone());

            let result = runner.compile(&Context::background(), &CompileRequest {
                submission_id: String::from("sub-1"),
                language_id: String::from("python"),
                source_path: source,
                work_dir: dir.path().join("compile"),
                extra_flags: Vec::new(),
                limits: ResourceLimit::default(),
            }).unwrap();

            assert!(result.ok);
            assert!(engine.specs.lock().unwrap().is_empty());
            // The source was still staged under the language's file name.
            assert!(dir.path().join("compile").join("main.py").exists());
        }

        #[test]
        fn compile_builds_the_expected_spec() {
            let dir = tempfile::tempdir().unwrap();
            let source = write_file(dir.path(), "sub.cpp", "int main() {}");
            let engine = MockEngine::new(|_| Ok(accepted_result()));
            let runner = runner(engine.clone());

            let result = runner.compile(&Context::background(), &CompileRequest {
                submission_id: String::from("sub-1"),
                language_id: String::from("cpp"),
                source_path: source,
                work_dir: dir.path().join("compile"),
                extra_flags: vec![String::from("-std=c++17")],
                limits: ResourceLimit::default(),
            }).unwrap();

            assert!(result.ok);
            let specs = engine.specs.lock().unwrap();
            assert_eq!(1, specs.len());
            let spec = &specs[0];
            assert_eq!("cpp-compile", spec.profile);
            assert_eq!(PathBuf::from("/work"), spec.work_dir);
            assert_eq!(vec![
                "g++", "-O2", "-std=c++17", "-o", "main", "main.cpp",
            ], spec.cmd);
            assert_eq!(1, spec.mounts.len());
            assert!(!spec.mounts[0].read_only);
            assert!(spec.stderr_path.ends_with("compile.log"));
            assert_eq!(1000, spec.limits.cpu_time_ms);
        }

        #[test]
        fn compiler_rejection_is_a_verdict_not_an_error() {
            let dir = tempfile::tempdir().unwrap();
            let source = write_file(dir.path(), "sub.cpp", "int main() {");
            let engine = MockEngine::new(|_| Ok(RunResult {
                exit_code: 1,
                stderr: String::from("error: expected '}'"),
                ..accepted_result()
            }));
            let runner = runner(engine);

            let result = runner.compile(&Context::background(), &CompileRequest {
                submission_id: String::from("sub-1"),
                language_id: String::from("cpp"),
                source_path: source,
                work_dir: dir.path().join("compile"),
                extra_flags: Vec::new(),
                limits: ResourceLimit::default(),
            }).unwrap();

            assert!(!result.ok);
            assert_eq!(1, result.exit_code);
            assert!(result.error.contains("expected '}'"));
        }
    }

    mod run {
        use super::*;

        fn run_request(dir: &Path) -> RunRequest {
            let input = write_file(dir, "t1.in", "1 2\n");
            let answer = write_file(dir, "t1.ans", "3\n");
            RunRequest {
                submission_id: String::from("sub-1"),
                test_id: String::from("t1"),
                language_id: String::from("cpp"),
                work_dir: dir.join("t1"),
                input_path: input,
                answer_path: Some(answer),
                io: IoConfig::default(),
                limits: ResourceLimit::default(),
                checker: None,
                checker_language_id: None,
            }
        }

        #[test]
        fn stdio_run_wires_input_and_output() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("t1")).unwrap();
            let engine = MockEngine::new(|_| Ok(accepted_result()));
            let runner = runner(engine.clone());

            let result = runner.run(&Context::background(), &run_request(dir.path())).unwrap();
            assert_eq!(Verdict::Accepted, result.verdict);
            assert!(result.runtime_log_path.ends_with("runtime.log"));
            assert!(result.checker_log_path.is_none());

            let specs = engine.specs.lock().unwrap();
            let spec = &specs[0];
            assert_eq!("cpp-run", spec.profile);
            assert_eq!(Some(PathBuf::from("/work/input.txt")), spec.stdin_path);
            assert!(spec.stdout_path.ends_with("output.txt"));
            // work dir read-write, input and answer read-only
            assert_eq!(3, spec.mounts.len());
            assert!(spec.mounts[1].read_only);
            assert!(spec.mounts[2].read_only);
        }

        #[test]
        fn file_io_requires_names_and_unsets_stdio() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("t1")).unwrap();
            let engine = MockEngine::new(|_| Ok(accepted_result()));
            let runner = runner(engine.clone());

            let mut req = run_request(dir.path());
            req.io = IoConfig {
                mode: IoMode::FileIo,
                input_file_name: None,
                output_file_name: None,
            };
            assert!(runner.run(&Context::background(), &req).is_err());

            req.io = IoConfig {
                mode: IoMode::FileIo,
                input_file_name: Some(String::from("problem.in")),
                output_file_name: Some(String::from("problem.out")),
            };
            runner.run(&Context::background(), &req).unwrap();

            let specs = engine.specs.lock().unwrap();
            let spec = specs.last().unwrap();
            assert!(spec.stdin_path.is_none());
            assert!(spec.stdout_path.ends_with("stdout.log"));
            assert_eq!(PathBuf::from("/work/problem.in"), spec.mounts[1].target);
        }

        #[test]
        fn checker_downgrade_to_wrong_answer() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("t1")).unwrap();
            let engine = MockEngine::new(|spec| {
                if spec.test_id.ends_with("-checker") {
                    Ok(RunResult { exit_code: 1, ..accepted_result() })
                } else {
                    Ok(accepted_result())
                }
            });
            let runner = runner(engine.clone());

            let mut req = run_request(dir.path());
            req.checker = Some(Checker {
                binary: String::from("/work/checker"),
                args: Vec::new(),
                language_id: None,
            });

            let result = runner.run(&Context::background(), &req).unwrap();
            assert_eq!(Verdict::WrongAnswer, result.verdict);
            assert!(result.checker_log_path.unwrap().ends_with("checker.log"));

            let specs = engine.specs.lock().unwrap();
            assert_eq!(2, specs.len());
            let checker_spec = &specs[1];
            assert_eq!("cpp-checker", checker_spec.profile);
            assert_eq!(vec![
                "/work/checker", "/work/input.txt", "/work/output.txt", "/work/answer.txt",
            ], checker_spec.cmd);
            // The program output is remounted read-only for the checker.
            assert!(checker_spec.mounts.iter().any(|m| {
                m.target == PathBuf::from("/work/output.txt") && m.read_only
            }));
        }

        #[test]
        fn checker_engine_failure_is_system_error() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("t1")).unwrap();
            let engine = MockEngine::new(|spec| {
                if spec.test_id.ends_with("-checker") {
                    Err(sandbox::Error::from(sandbox::ErrorKind::EngineConfig(
                        String::from("helper missing"))))
                } else {
                    Ok(accepted_result())
                }
            });
            let runner = runner(engine);

            let mut req = run_request(dir.path());
            req.checker = Some(Checker {
                binary: String::from("/work/checker"),
                args: Vec::new(),
                language_id: None,
            });

            let result = runner.run(&Context::background(), &req).unwrap();
            assert_eq!(Verdict::SystemError, result.verdict);
        }

        #[test]
        fn checker_without_answer_is_invalid() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("t1")).unwrap();
            let runner = runner(MockEngine::new(|_| Ok(accepted_result())));

            let mut req = run_request(dir.path());
            req.answer_path = None;
            req.checker = Some(Checker {
                binary: String::from("/work/checker"),
                args: Vec::new(),
                language_id: None,
            });

            let err = runner.run(&Context::background(), &req).unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Validation(..)));
        }

        #[test]
        fn interactive_tasks_are_refused() {
            let dir = tempfile::tempdir().unwrap();
            let runner = runner(MockEngine::new(|_| Ok(accepted_result())));
            let err = runner
                .run_interactive(&Context::background(), &run_request(dir.path()))
                .unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::LanguageNotSupported(..)));
        }
    }
}
