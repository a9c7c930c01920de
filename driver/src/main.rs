//! The judge worker daemon: consumes submission tasks from the bus, judges
//! them inside the sandbox and publishes their status.
//!

mod bus;
mod config;
mod consumer;
mod datapack;
mod message;
mod meta;
mod ports;
mod restful;
mod status;
mod submission;
mod sync;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{App, Arg};
use log::LevelFilter;

use judge::{Result, ResultExt};
use judge::languages::LanguageRegistry;
use judge::profiles::ProfileResolver;
use judge::runner::Runner;
use judge::worker::Worker;
use sandbox::{Context, EngineOptions};

use crate::bus::RedisBus;
use crate::config::{AppConfig, LoggingConfig};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::datapack::{CacheOptions, DataPackCache};
use crate::meta::MetaClient;
use crate::restful::{HttpObjectStorage, RestfulClient};
use crate::status::{RepositoryReporter, StatusRepository};
use crate::submission::{PipelineOptions, SubmissionPipeline};

/// Set by the signal handler; the main thread watches it and cancels the
/// root context.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_shutdown_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as usize);
        libc::signal(libc::SIGTERM, handler as usize);
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    use log4rs::append::console::ConsoleAppender;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l:<5} {t} - {m}{n}";

    let level = match config.level.as_deref() {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let mut builder = log4rs::config::Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(file) = &config.file {
        let appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(file)
            .chain_err(|| format!("failed to open log file {}", file.display()))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(appender)));
        root = root.appender("file");
    }

    let log_config: Config = builder.build(root.build(level))
        .map_err(|e| judge::validation_error(format!("invalid logging config: {}", e)))?;
    log4rs::init_config(log_config)
        .map_err(|e| judge::validation_error(format!(
            "failed to initialize logging: {}", e)))?;

    Ok(())
}

fn run(config_path: &str) -> Result<()> {
    let config = AppConfig::from_file(config_path)?;
    init_logging(&config.logging)?;
    log::info!("tide-judged starting with config {}", config_path);

    let bus = Arc::new(RedisBus::connect(&config.redis.addr)?);

    let languages = Arc::new(LanguageRegistry::new(
        config.language.languages.clone()));
    let profiles = Arc::new(ProfileResolver::new(
        config.language.profiles.clone()));

    let engine = sandbox::create_engine(EngineOptions {
        cgroup_root: config.sandbox.cgroup_root.clone(),
        helper_path: config.sandbox.helper_path.clone(),
        seccomp_dir: config.sandbox.seccomp_dir.clone(),
        stdout_stderr_max_bytes: config.sandbox.stdout_stderr_max_bytes,
        enable_seccomp: config.sandbox.enable_seccomp,
        enable_cgroup: config.sandbox.enable_cgroup,
        enable_namespaces: config.sandbox.enable_namespaces,
        profiles: profiles.isolation_profiles(),
    })?;

    let status = Arc::new(StatusRepository::new(
        bus.clone(),
        bus.clone(),
        config.status.final_topic.clone(),
        Duration::from_secs(config.status.ttl_secs)));
    let reporter = Arc::new(RepositoryReporter::new(status.clone()));

    let runner = Runner::new(engine.clone(), languages, profiles);
    let worker = Arc::new(Worker::new(runner, reporter, &config.worker.work_root));

    let problem_timeout = Duration::from_secs(config.problem.timeout_secs);
    let meta_service = Arc::new(RestfulClient::new(&config.problem.addr, problem_timeout)?);
    let meta = Arc::new(MetaClient::new(
        meta_service,
        Duration::from_secs(config.problem.meta_ttl_secs)));

    let storage = Arc::new(HttpObjectStorage::new(
        &config.storage.addr, problem_timeout)?);
    let cache = Arc::new(DataPackCache::new(CacheOptions {
        root_dir: config.cache.root_dir.clone(),
        bucket: config.storage.data_pack_bucket.clone(),
        ttl: Duration::from_secs(config.cache.ttl_secs),
        lock_wait: Duration::from_secs(config.cache.lock_wait_secs),
        max_entries: config.cache.max_entries,
        max_bytes: config.cache.max_bytes,
    }, storage.clone(), bus.clone())?);

    let pipeline = Arc::new(SubmissionPipeline::new(
        worker,
        engine,
        meta,
        cache,
        storage,
        PipelineOptions {
            source_bucket: config.storage.source_bucket.clone(),
            scratch_dir: config.worker.work_root.join("sources"),
            submission_timeout: config.worker.timeout(),
        })?);

    let consumer = Consumer::new(
        bus,
        status,
        pipeline,
        config.worker.pool_size,
        ConsumerOptions {
            topics: config.queue.weighted_topics(),
            retry_topic: config.queue.retry_topic.clone(),
            dead_letter: config.queue.dead_letter_topic().map(String::from),
            pool_retry_max: config.queue.pool_retry_max,
            pool_retry_base_delay: Duration::from_millis(
                config.queue.pool_retry_base_delay_ms),
            pool_retry_max_delay: Duration::from_millis(
                config.queue.pool_retry_max_delay_ms),
            fetch_wait: Duration::from_secs(config.queue.fetch_wait_secs),
        });

    let ctx = Context::background();
    install_signal_handlers();
    {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            while !SHUTDOWN.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            }
            log::info!("shutdown signal received; cancelling");
            ctx.cancel();
        });
    }

    consumer.run(&ctx)?;
    log::info!("tide-judged stopped");
    Ok(())
}

fn main() {
    let matches = App::new("tide-judged")
        .about("Judge worker daemon")
        .arg(Arg::with_name("config")
            .short("c")
            .long("config")
            .value_name("FILE")
            .help("Path to the YAML configuration file")
            .takes_value(true)
            .required(true))
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    if let Err(e) = run(config_path) {
        eprintln!("tide-judged failed: {}", e);
        for cause in e.iter().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
        std::process::exit(1);
    }
}
