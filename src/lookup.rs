//! Driver for the external image hash lookup service.
//!
//! The driver owns the service contract: each send gets a deadline, and a
//! saturated service is retried after a jittered delay. The resolver only
//! ever sees one outstanding attempt per reference, however many times the
//! driver re-sends underneath.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::reference::{ContentDigest, ImageRef};

pub use registry::RegistryHashingService;

/// Outcome of a single lookup attempt against the hashing service.
#[derive(Debug, Clone)]
pub enum HashResponse {
    /// The reference resolved to a digest.
    Found(ContentDigest),
    /// The lookup failed; the reason is surfaced to waiters.
    Failed(String),
    /// The service is saturated; the driver retries after a delay.
    Busy,
}

/// External service that maps an image reference to a content digest.
#[async_trait]
pub trait HashingService: Send + Sync {
    async fn request_hash(&self, reference: &ImageRef) -> HashResponse;
}

/// Driver-side completion fed back into the resolver loop.
#[derive(Debug)]
pub(crate) enum LookupOutcome {
    Resolved {
        reference: ImageRef,
        digest: ContentDigest,
    },
    Failed {
        reference: ImageRef,
        reason: String,
    },
    /// A send exceeded its deadline. Carries no reference, so the resolver
    /// cannot attribute it to a single in-flight lookup.
    TimedOut,
}

pub(crate) struct LookupDriver {
    service: Arc<dyn HashingService>,
    backpressure_base: Duration,
    backpressure_jitter: f64,
    request_timeout: Duration,
    outcomes: mpsc::UnboundedSender<LookupOutcome>,
}

impl LookupDriver {
    pub(crate) fn new(
        service: Arc<dyn HashingService>,
        config: &ResolverConfig,
        outcomes: mpsc::UnboundedSender<LookupOutcome>,
    ) -> Self {
        Self {
            service,
            backpressure_base: config.backpressure_base,
            backpressure_jitter: config.backpressure_jitter,
            request_timeout: config.request_timeout,
            outcomes,
        }
    }

    /// Start one lookup. The outcome re-enters the resolver as a message;
    /// nothing is awaited inline.
    pub(crate) fn dispatch(&self, reference: ImageRef) {
        let service = Arc::clone(&self.service);
        let outcomes = self.outcomes.clone();
        let deadline = self.request_timeout;
        let base = self.backpressure_base;
        let jitter = self.backpressure_jitter;
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(deadline, service.request_hash(&reference)).await {
                    Ok(HashResponse::Found(digest)) => {
                        let _ = outcomes.send(LookupOutcome::Resolved { reference, digest });
                        return;
                    }
                    Ok(HashResponse::Failed(reason)) => {
                        let _ = outcomes.send(LookupOutcome::Failed { reference, reason });
                        return;
                    }
                    Ok(HashResponse::Busy) => {
                        let delay = jittered_delay(base, jitter);
                        debug!(
                            reference = %reference,
                            delay_ms = delay.as_millis() as u64,
                            "hashing service saturated, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(_) => {
                        warn!(reference = %reference, "hash lookup exceeded its deadline");
                        let _ = outcomes.send(LookupOutcome::TimedOut);
                        return;
                    }
                }
            }
        });
    }
}

/// Uniform delay in `[base·(1−f), base·(1+f)]`.
fn jittered_delay(base: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return base;
    }
    let base_ms = base.as_millis() as f64;
    let spread = base_ms * factor.min(1.0);
    let low = (base_ms - spread).max(0.0);
    let millis = rand::thread_rng().gen_range(low..=base_ms + spread);
    Duration::from_millis(millis as u64)
}
