//! This module maintains application wide configurations.
//!

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use judge::{Result, ResultExt, validation_error};
use judge::languages::LanguageSpec;
use judge::profiles::TaskProfile;

/// Topic weights assigned when the configuration does not name any: the
/// first four topics poll at 8:4:2:1, any further topic at 1.
const DEFAULT_TOPIC_WEIGHTS: [u32; 4] = [8, 4, 2, 1];

/// Provide application wide configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Worker pool related configurations.
    pub worker: WorkerConfig,

    /// Message bus related configurations.
    pub queue: QueueConfig,

    /// Data pack cache related configurations.
    pub cache: CacheConfig,

    /// Sandbox engine related configurations.
    pub sandbox: SandboxConfig,

    /// Problem service client related configurations.
    pub problem: ProblemConfig,

    /// Status persistence related configurations.
    pub status: StatusConfig,

    /// Redis endpoint shared by the bus, the lock service and the status
    /// cache.
    pub redis: RedisConfig,

    /// Object storage related configurations.
    pub storage: StorageConfig,

    /// Language and isolation profile tables.
    pub language: LanguageConfig,

    /// Logging related configurations.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate the configuration from the given YAML file.
    pub fn from_file<P>(path: P) -> Result<AppConfig>
        where P: AsRef<Path> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .chain_err(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .map_err(|e| validation_error(format!(
                "invalid config file {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.pool_size == 0 {
            return Err(validation_error("worker.poolSize must be positive"));
        }
        if self.queue.topics.is_empty() {
            return Err(validation_error("queue.topics must not be empty"));
        }
        if self.language.languages.is_empty() {
            return Err(validation_error("language.languages must not be empty"));
        }
        Ok(())
    }
}

/// Worker pool related configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Capacity of the admission semaphore.
    pub pool_size: usize,

    /// Per-submission wall deadline, in seconds.
    #[serde(default = "defaults::worker_timeout_secs")]
    pub timeout_secs: u64,

    /// Directory the per-submission work trees are created under.
    pub work_root: PathBuf,
}

impl WorkerConfig {
    /// The per-submission deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Message bus related configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Submission topics, polled with weighted round-robin.
    pub topics: Vec<String>,

    /// Weights of the submission topics; missing positions fall back to
    /// 8, 4, 2, 1 and then 1.
    #[serde(default)]
    pub topic_weights: Vec<u32>,

    /// Topic pool-full requeues are published to.
    #[serde(default = "defaults::retry_topic")]
    pub retry_topic: String,

    /// Dead letter topic; empty disables dead lettering.
    #[serde(default)]
    pub dead_letter: String,

    /// Maximum number of pool-full requeues before dead lettering.
    #[serde(default = "defaults::pool_retry_max")]
    pub pool_retry_max: u32,

    /// Base delay of the exponential requeue backoff, in milliseconds.
    #[serde(default = "defaults::pool_retry_base_delay_ms")]
    pub pool_retry_base_delay_ms: u64,

    /// Cap of the exponential requeue backoff, in milliseconds.
    #[serde(default = "defaults::pool_retry_max_delay_ms")]
    pub pool_retry_max_delay_ms: u64,

    /// How long one fetch blocks waiting for a message, in seconds.
    #[serde(default = "defaults::fetch_wait_secs")]
    pub fetch_wait_secs: u64,
}

impl QueueConfig {
    /// The effective weight of the topic at the given position.
    pub fn weight_of(&self, index: usize) -> u32 {
        if let Some(weight) = self.topic_weights.get(index) {
            return *weight;
        }
        DEFAULT_TOPIC_WEIGHTS.get(index).copied().unwrap_or(1)
    }

    /// Topics paired with their effective weights.
    pub fn weighted_topics(&self) -> Vec<(String, u32)> {
        self.topics.iter()
            .enumerate()
            .map(|(index, topic)| (topic.clone(), self.weight_of(index)))
            .collect()
    }

    /// The dead letter topic, if configured.
    pub fn dead_letter_topic(&self) -> Option<&str> {
        if self.dead_letter.is_empty() {
            None
        } else {
            Some(&self.dead_letter)
        }
    }
}

/// Data pack cache related configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Directory extracted data packs are stored under.
    pub root_dir: PathBuf,

    /// Lifetime of a cached data pack, in seconds.
    #[serde(default = "defaults::cache_ttl_secs")]
    pub ttl_secs: u64,

    /// How long a contended fetch waits for the lock holder, in seconds.
    #[serde(default = "defaults::cache_lock_wait_secs")]
    pub lock_wait_secs: u64,

    /// Maximum number of cached data packs; zero disables the bound.
    #[serde(default)]
    pub max_entries: usize,

    /// Maximum total bytes of cached data packs; zero disables the bound.
    #[serde(default)]
    pub max_bytes: u64,
}

/// Sandbox engine related configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Root of the cgroup v2 hierarchy run cgroups are created under.
    #[serde(default = "defaults::cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Directory containing seccomp profile files.
    pub seccomp_dir: PathBuf,

    /// Path of the sandbox helper binary.
    pub helper_path: PathBuf,

    /// Read-back cap for captured stdout/stderr, in bytes.
    #[serde(default = "defaults::stdout_stderr_max_bytes")]
    pub stdout_stderr_max_bytes: u64,

    /// Whether seccomp filters are installed.
    #[serde(default = "defaults::enabled")]
    pub enable_seccomp: bool,

    /// Whether runs are confined through cgroups.
    #[serde(default = "defaults::enabled")]
    pub enable_cgroup: bool,

    /// Whether namespaces are unshared and the root pivoted.
    #[serde(default = "defaults::enabled")]
    pub enable_namespaces: bool,
}

/// Problem service client related configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemConfig {
    /// Base URL of the problem service.
    pub addr: String,

    /// Per-call timeout, in seconds.
    #[serde(default = "defaults::rpc_timeout_secs")]
    pub timeout_secs: u64,

    /// Lifetime of cached problem metadata, in seconds; zero disables the
    /// cache.
    #[serde(default = "defaults::meta_ttl_secs")]
    pub meta_ttl_secs: u64,
}

/// Status persistence related configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    /// Lifetime of status rows, in seconds.
    #[serde(default = "defaults::status_ttl_secs")]
    pub ttl_secs: u64,

    /// Bound on one status write, in seconds.
    #[serde(default = "defaults::rpc_timeout_secs")]
    pub timeout_secs: u64,

    /// Topic final status events are published to.
    #[serde(default = "defaults::status_final_topic")]
    pub final_topic: String,
}

/// Redis endpoint configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub addr: String,
}

/// Object storage related configurations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Base URL of the object storage gateway.
    pub addr: String,

    /// Bucket holding submission sources.
    #[serde(default = "defaults::source_bucket")]
    pub source_bucket: String,

    /// Bucket holding problem data packs.
    #[serde(default = "defaults::data_pack_bucket")]
    pub data_pack_bucket: String,
}

/// Language and isolation profile tables.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageConfig {
    /// Judgeable languages.
    pub languages: Vec<LanguageSpec>,

    /// Isolation profiles.
    pub profiles: Vec<TaskProfile>,
}

/// Logging related configurations.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Log level filter: error, warn, info, debug or trace.
    pub level: Option<String>,

    /// Log file; console-only when absent.
    pub file: Option<PathBuf>,
}

mod defaults {
    use std::path::PathBuf;

    pub fn worker_timeout_secs() -> u64 { 600 }
    pub fn retry_topic() -> String { String::from("judge.retry") }
    pub fn pool_retry_max() -> u32 { 5 }
    pub fn pool_retry_base_delay_ms() -> u64 { 1_000 }
    pub fn pool_retry_max_delay_ms() -> u64 { 30_000 }
    pub fn fetch_wait_secs() -> u64 { 1 }
    pub fn cache_ttl_secs() -> u64 { 3_600 }
    pub fn cache_lock_wait_secs() -> u64 { 120 }
    pub fn cgroup_root() -> PathBuf { PathBuf::from("/sys/fs/cgroup/judge") }
    pub fn stdout_stderr_max_bytes() -> u64 { 64 * 1024 }
    pub fn enabled() -> bool { true }
    pub fn rpc_timeout_secs() -> u64 { 10 }
    pub fn meta_ttl_secs() -> u64 { 60 }
    pub fn status_ttl_secs() -> u64 { 24 * 3_600 }
    pub fn status_final_topic() -> String { String::from("judge.status.final") }
    pub fn source_bucket() -> String { String::from("sources") }
    pub fn data_pack_bucket() -> String { String::from("data-packs") }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        worker:
            poolSize: 4
            timeoutSecs: 300
            workRoot: "/var/lib/judge/work"
        queue:
            topics: ["judge.normal", "judge.contest"]
            topicWeights: [4]
            retryTopic: "judge.retry"
            deadLetter: "judge.dead"
            poolRetryMax: 5
            poolRetryBaseDelayMs: 1000
            poolRetryMaxDelayMs: 30000
        cache:
            rootDir: "/var/lib/judge/packs"
            ttlSecs: 1800
            lockWaitSecs: 60
            maxEntries: 64
            maxBytes: 1073741824
        sandbox:
            cgroupRoot: "/sys/fs/cgroup/judge"
            seccompDir: "/etc/judge/seccomp"
            helperPath: "/usr/local/bin/sandbox-helper"
            stdoutStderrMaxBytes: 65536
        problem:
            addr: "http://problem-service:8080"
            timeoutSecs: 5
            metaTtlSecs: 120
        status:
            ttlSecs: 86400
            finalTopic: "judge.status.final"
        redis:
            addr: "redis://127.0.0.1:6379/0"
        storage:
            addr: "http://storage:9000"
        language:
            languages:
                - id: "cpp"
                  sourceFile: "main.cpp"
                  binaryFile: "main"
                  compileEnabled: true
                  compileCmdTpl: "g++ -O2 {extraFlags} -o {bin} {src}"
                  runCmdTpl: "./{bin}"
            profiles:
                - languageId: "cpp"
                  taskType: "run"
                  rootFs: "/srv/rootfs/cpp"
                  seccompProfile: "default"
                  defaultLimits:
                      cpuTimeMs: 1000
                      memoryMb: 256
        logging:
            level: "info"
    "#;

    #[test]
    fn deserialize_app_config_yaml() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();

        assert_eq!(4, config.worker.pool_size);
        assert_eq!(Duration::from_secs(300), config.worker.timeout());

        assert_eq!(vec!["judge.normal", "judge.contest"], config.queue.topics);
        assert_eq!(Some("judge.dead"), config.queue.dead_letter_topic());
        assert_eq!(5, config.queue.pool_retry_max);

        assert_eq!(64, config.cache.max_entries);
        assert_eq!(1_073_741_824, config.cache.max_bytes);

        assert!(config.sandbox.enable_seccomp);
        assert_eq!(PathBuf::from("/usr/local/bin/sandbox-helper"),
            config.sandbox.helper_path);

        assert_eq!(120, config.problem.meta_ttl_secs);
        assert_eq!("judge.status.final", config.status.final_topic);

        assert_eq!(1, config.language.languages.len());
        assert_eq!(1.0, config.language.languages[0].time_multiplier);
        assert_eq!(1000, config.language.profiles[0].default_limits.cpu_time_ms);

        config.validate().unwrap();
    }

    #[test]
    fn topic_weights_fall_back_to_defaults() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();

        // Explicit weight for the first topic, default for the second.
        assert_eq!(vec![
            (String::from("judge.normal"), 4),
            (String::from("judge.contest"), 4),
        ], config.queue.weighted_topics());

        // Past the default table every topic polls at weight 1.
        assert_eq!(2, config.queue.weight_of(2));
        assert_eq!(1, config.queue.weight_of(4));
        assert_eq!(1, config.queue.weight_of(9));
    }

    #[test]
    fn empty_topics_are_rejected() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.queue.topics.clear();
        assert!(config.validate().is_err());
    }
}
