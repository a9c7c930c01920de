//! This module glues one admitted message through the judging pipeline:
//! problem metadata, data pack, source download, request assembly and the
//! worker itself.
//!

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use judge::{Error, JudgeResult, Result, ResultExt, validation_error};
use judge::manifest::{Manifest, ProblemConfig};
use judge::worker::{JudgeRequest, Worker};
use sandbox::{Context, Engine};

use crate::consumer::SubmissionProcessor;
use crate::datapack::DataPackCache;
use crate::message::JudgeMessage;
use crate::meta::MetaClient;
use crate::ports::ObjectStorage;

/// Options of the submission pipeline.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Storage bucket holding submission sources.
    pub source_bucket: String,

    /// Directory downloaded sources are staged under.
    pub scratch_dir: PathBuf,

    /// Wall deadline of one whole judging.
    pub submission_timeout: Duration,
}

/// The per-submission pipeline.
pub struct SubmissionPipeline {
    worker: Arc<Worker>,
    engine: Arc<dyn Engine>,
    meta: Arc<MetaClient>,
    cache: Arc<DataPackCache>,
    storage: Arc<dyn ObjectStorage>,
    options: PipelineOptions,
}

impl SubmissionPipeline {
    /// Create a pipeline over the given collaborators.
    pub fn new(
        worker: Arc<Worker>,
        engine: Arc<dyn Engine>,
        meta: Arc<MetaClient>,
        cache: Arc<DataPackCache>,
        storage: Arc<dyn ObjectStorage>,
        options: PipelineOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.scratch_dir)
            .chain_err(|| format!(
                "failed to create scratch dir {}", options.scratch_dir.display()))?;

        Ok(SubmissionPipeline {
            worker,
            engine,
            meta,
            cache,
            storage,
            options,
        })
    }

    /// Download the submission source into the scratch directory, verifying
    /// its digest when the message carries one.
    fn download_source(&self, ctx: &Context, message: &JudgeMessage)
        -> Result<tempfile::NamedTempFile> {
        let mut stream = self.storage.get_object(
            ctx, &self.options.source_bucket, &message.source_key)?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", message.submission_id))
            .suffix(".src")
            .tempfile_in(&self.options.scratch_dir)
            .chain_err(|| "failed to create source scratch file")?;

        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            ctx.ensure_active().map_err(Error::from)?;
            let read = stream.read(&mut buffer)
                .chain_err(|| format!(
                    "failed to download source {}", message.source_key))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            file.write_all(&buffer[..read])
                .chain_err(|| "failed to write source scratch file")?;
        }
        file.flush().chain_err(|| "failed to flush source scratch file")?;

        if !message.source_hash.is_empty() {
            let digest = hex::encode(hasher.finalize());
            if !digest.eq_ignore_ascii_case(&message.source_hash) {
                return Err(validation_error(format!(
                    "source {} hash mismatch: expected {}, got {}",
                    message.source_key, message.source_hash, digest)));
            }
        }

        Ok(file)
    }
}

impl SubmissionProcessor for SubmissionPipeline {
    fn process(&self, ctx: &Context, message: &JudgeMessage) -> Result<JudgeResult> {
        let ctx = ctx.with_timeout(self.options.submission_timeout);
        log::info!("judging submission {} (problem {}, language {})",
            message.submission_id, message.problem_id, message.language_id);

        let meta = self.meta.get(&ctx, message.problem_id)?;
        let pack = self.cache.get(&ctx, &meta)?;

        let manifest = Manifest::load(pack.path())?;
        let config = ProblemConfig::load(pack.path())?;
        let source = self.download_source(&ctx, message)?;

        let request = JudgeRequest::from_manifest(
            message.submission_id.clone(),
            message.problem_id,
            message.language_id.clone(),
            source.path().to_path_buf(),
            &message.extra_compile_flags,
            &manifest,
            &config,
            pack.path());

        let result = self.worker.execute(&ctx, &request);
        if result.is_err() {
            // Whatever still runs under this submission dies with it.
            if let Err(e) = self.engine.kill_submission(&message.submission_id) {
                log::warn!("failed to kill residual tasks of {}: {}",
                    message.submission_id, e);
            }
        }

        // `source` and `pack` stay alive until here: the worker reads the
        // scratch file and the pinned data pack throughout.
        result
    }
}
