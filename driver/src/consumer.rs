//! This module implements the admission loop: weighted topic polling, the
//! bounded worker pool, and the pool-full requeue with exponential backoff
//! and dead lettering.
//!

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

use judge::{Error, ErrorKind, JudgeResult, Result};
use judge::worker::StatusUpdate;
use sandbox::Context;

use crate::message::JudgeMessage;
use crate::ports::{MessageQueue, QueueMessage};
use crate::status::{JudgeStatusResponse, StatusRepository};
use crate::sync::Semaphore;

/// The per-message pipeline the consumer admits work into.
pub trait SubmissionProcessor: Send + Sync {
    /// Judge one submission to completion.
    fn process(&self, ctx: &Context, message: &JudgeMessage) -> Result<JudgeResult>;
}

/// Options of the admission loop.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Submission topics with their fetch weights.
    pub topics: Vec<(String, u32)>,

    /// Topic pool-full requeues are published to.
    pub retry_topic: String,

    /// Dead letter topic, when configured.
    pub dead_letter: Option<String>,

    /// Maximum number of pool-full requeues before dead lettering.
    pub pool_retry_max: u32,

    /// Base delay of the requeue backoff.
    pub pool_retry_base_delay: Duration,

    /// Cap of the requeue backoff.
    pub pool_retry_max_delay: Duration,

    /// How long one fetch blocks waiting for a message.
    pub fetch_wait: Duration,
}

/// Weighted round-robin over topics with token replenishment.
///
/// Every topic starts a round with as many tokens as its weight; drawing a
/// topic spends one token, and when every token is spent the round restarts.
/// A topic with a non-zero weight is therefore drawn at least once per
/// round and can never starve.
pub struct WeightedTopicCycle {
    topics: Vec<(String, u32)>,
    tokens: Vec<u32>,
    cursor: usize,
}

impl WeightedTopicCycle {
    /// Create a cycle over the given (topic, weight) pairs.
    pub fn new(topics: Vec<(String, u32)>) -> Self {
        let tokens = topics.iter().map(|(_, weight)| *weight).collect();
        WeightedTopicCycle {
            topics,
            tokens,
            cursor: 0,
        }
    }

    /// Draw the next topic to poll. Returns `None` when no topic has a
    /// positive weight.
    pub fn next(&mut self) -> Option<&str> {
        if self.topics.iter().all(|(_, weight)| *weight == 0) {
            return None;
        }

        if self.tokens.iter().all(|tokens| *tokens == 0) {
            for (slot, (_, weight)) in self.tokens.iter_mut().zip(&self.topics) {
                *slot = *weight;
            }
        }

        let count = self.topics.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if self.tokens[index] > 0 {
                self.tokens[index] -= 1;
                self.cursor = (index + 1) % count;
                return Some(&self.topics[index].0);
            }
        }

        // Some weight is positive, so the replenished round above always
        // finds a token.
        unreachable!()
    }
}

/// Backoff before the n-th pool-full requeue: `min(base * 2^n, max)`.
pub fn pool_retry_delay(retries: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let factor = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(factor).min(max.as_millis() as u64);
    Duration::from_millis(delay_ms)
}

/// Sleep that wakes up early when the context is cancelled.
fn sleep_cancellable(ctx: &Context, duration: Duration) {
    const SLICE: Duration = Duration::from_millis(50);

    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline && !ctx.is_cancelled() {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        std::thread::sleep(remaining.min(SLICE));
    }
}

/// The admission loop.
pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    status: Arc<StatusRepository>,
    processor: Arc<dyn SubmissionProcessor>,
    semaphore: Semaphore,
    options: ConsumerOptions,
}

impl Consumer {
    /// Create a consumer admitting at most `pool_size` concurrent judgings.
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        status: Arc<StatusRepository>,
        processor: Arc<dyn SubmissionProcessor>,
        pool_size: usize,
        options: ConsumerOptions) -> Self {
        Consumer {
            queue,
            status,
            processor,
            semaphore: Semaphore::new(pool_size),
            options,
        }
    }

    /// Run the loop until the context is cancelled, then drain the in-flight
    /// judgings.
    pub fn run(&self, ctx: &Context) -> Result<()> {
        let mut cycle = WeightedTopicCycle::new(self.options.topics.clone());
        let mut inflight: Vec<JoinHandle<()>> = Vec::new();

        log::info!("admission loop started over {} topics with pool size {}",
            self.options.topics.len(), self.semaphore.capacity());

        while !ctx.is_cancelled() {
            inflight.retain(|handle| !handle.is_finished());

            let topic = match cycle.next() {
                Some(topic) => topic.to_owned(),
                None => {
                    return Err(judge::validation_error("no topic has a positive weight"));
                }
            };

            let message = match self.queue.fetch(ctx, &topic, self.options.fetch_wait) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    if e.is_cancelled() {
                        break;
                    }
                    log::error!("fetch from {} failed: {}", topic, e);
                    sleep_cancellable(ctx, Duration::from_secs(1));
                    continue;
                }
            };

            if let Some(handle) = self.handle_message(ctx, &topic, message) {
                inflight.push(handle);
            }
        }

        log::info!("admission loop stopping; draining {} in-flight judgings",
            inflight.len());
        for handle in inflight {
            let _ = handle.join();
        }

        Ok(())
    }

    /// Handle one fetched message. Returns the join handle of the judging
    /// thread when the message was admitted.
    fn handle_message(&self, ctx: &Context, topic: &str, message: QueueMessage)
        -> Option<JoinHandle<()>> {
        // Malformed messages are not retryable; acknowledge and drop.
        let judge_message = match JudgeMessage::decode(&message.body) {
            Ok(judge_message) => judge_message,
            Err(e) => {
                log::warn!("dropping malformed message on {}: {}", topic, e);
                if !message.id.is_empty() {
                    let row = JudgeStatusResponse::failed(&message.id, &e);
                    let _ = self.status.save(&Context::background(), &row);
                }
                return None;
            }
        };

        let pending = JudgeStatusResponse::progress(&StatusUpdate {
            submission_id: judge_message.submission_id.clone(),
            status: judge::JudgeStatus::Pending,
            total_tests: 0,
            done_tests: 0,
        });
        if let Err(e) = self.status.save(ctx, &pending) {
            log::warn!("failed to persist pending status for {}: {}",
                judge_message.submission_id, e);
        }

        let permit = match self.semaphore.try_acquire() {
            Some(permit) => permit,
            None => {
                log::info!("worker pool full; requeueing {}", judge_message.submission_id);
                if let Err(e) = self.requeue_for_pool_full(ctx, &message) {
                    // Retries exhausted and no dead letter: hand the message
                    // back to its source topic for broker-level retry.
                    log::error!("requeue of {} failed: {}",
                        judge_message.submission_id, e);
                    let _ = self.queue.publish(&Context::background(), topic, &message);
                }
                return None;
            }
        };

        let running = JudgeStatusResponse::progress(&StatusUpdate {
            submission_id: judge_message.submission_id.clone(),
            status: judge::JudgeStatus::Running,
            total_tests: 0,
            done_tests: 0,
        });
        if let Err(e) = self.status.save(ctx, &running) {
            log::warn!("failed to persist running status for {}: {}",
                judge_message.submission_id, e);
        }

        let queue = self.queue.clone();
        let status = self.status.clone();
        let processor = self.processor.clone();
        let topic = topic.to_owned();
        let ctx = ctx.child();
        Some(std::thread::spawn(move || {
            let _permit = permit;
            let submission_id = judge_message.submission_id.clone();

            match processor.process(&ctx, &judge_message) {
                Ok(result) => {
                    let row = JudgeStatusResponse::finished(&result);
                    if let Err(e) = status.save(&Context::background(), &row) {
                        log::error!("failed to persist result of {}: {}",
                            submission_id, e);
                    }
                },
                Err(e) => {
                    log::error!("judging of {} failed: {}", submission_id, e);
                    let row = JudgeStatusResponse::failed(&submission_id, &e);
                    if let Err(se) = status.save(&Context::background(), &row) {
                        log::error!("failed to persist failure of {}: {}",
                            submission_id, se);
                    }
                    // Infrastructure failures go back to the broker; judging
                    // failures recorded in the status row are acknowledged.
                    if !e.is_non_retryable() && !e.is_cancelled() {
                        if let Err(pe) = queue.publish(
                            &Context::background(), &topic, &message) {
                            log::error!("failed to return {} to {}: {}",
                                submission_id, topic, pe);
                        }
                    }
                }
            }
        }))
    }

    /// Requeue a message the pool could not admit.
    ///
    /// Below the retry budget the message is republished to the retry topic
    /// with an incremented `x-pool-retry` header after an exponential
    /// backoff. At the budget it goes to the dead letter topic, headers
    /// preserved; without one, the error surfaces to the caller.
    pub fn requeue_for_pool_full(&self, ctx: &Context, message: &QueueMessage)
        -> Result<()> {
        let retries = message.pool_retries();

        if retries >= self.options.pool_retry_max {
            return match &self.options.dead_letter {
                Some(dead_letter) => {
                    log::warn!("message {} exhausted {} pool retries; dead lettering",
                        message.id, retries);
                    self.queue.publish(ctx, dead_letter, message)
                },
                None => Err(Error::from(ErrorKind::QueueFull)),
            };
        }

        let delay = pool_retry_delay(
            retries,
            self.options.pool_retry_base_delay,
            self.options.pool_retry_max_delay);
        // Up to 10% jitter keeps workers from thundering back in step.
        let jitter_ms = delay.as_millis() as u64 / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::from_millis(0)
        };
        sleep_cancellable(ctx, delay + jitter);
        ctx.ensure_active().map_err(Error::from)?;

        self.queue.publish(ctx, &self.options.retry_topic, &message.with_incremented_retry())
    }
}
