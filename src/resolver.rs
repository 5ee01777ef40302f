//! Per-workflow tag resolver.
//!
//! One resolver instance exists per running workflow and guarantees that
//! every lookup of the same image reference within that workflow observes
//! the same content digest, even if the upstream registry republishes the
//! tag mid-run. Call caching depends on this: two jobs naming
//! `ubuntu:18.04` must bind to the same image bytes.
//!
//! The instance is a single task owning a three-state machine
//! (`LoadingCache`, `Running`, `Failed`). It never awaits storage or
//! registry work inline: outbound calls are spawned and their outcomes
//! re-enter the loop as messages, so the state needs no locks. Concurrent
//! requests for one reference coalesce into a single outstanding lookup,
//! and a digest is only revealed to waiters after it has been durably
//! written, so a crash between lookup and write can never leave a
//! requester holding an unpersisted hash.

mod state;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ResolverConfig, StartMode};
use crate::lookup::{HashingService, LookupDriver, LookupOutcome};
use crate::reference::{ContentDigest, ImageRef};
use crate::store::{DigestStore, StoredDigest};

use state::{ResolverState, Waiter};

const CORRUPT_STORE_REASON: &str = "corrupt digest store";
const TIMEOUT_REASON: &str = "hash lookup timed out with lookups still in flight";

/// Successful reply: the reference and the digest it is pinned to for the
/// rest of the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub reference: ImageRef,
    pub digest: ContentDigest,
}

/// Lookup failure, scoped to one reference or to the whole workflow.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// The hashing service rejected this reference. Later requests for the
    /// same reference start over.
    #[error("hash lookup for {reference} failed: {reason}")]
    Lookup { reference: ImageRef, reason: String },
    /// The digest resolved but could not be persisted, so it was never
    /// revealed. Later requests for the same reference start over.
    #[error("failed to persist digest for {reference}: {reason}")]
    Store { reference: ImageRef, reason: String },
    /// The resolver is in its terminal state; every request for this
    /// workflow fails the same way.
    #[error("resolver failed: {0}")]
    Terminal(String),
    /// The resolver task went away before replying.
    #[error("resolver stopped before replying")]
    Stopped,
}

struct LookupRequest {
    reference: ImageRef,
    reply: Waiter,
}

/// Store completion re-entering the loop as a message.
enum StoreEvent {
    CacheLoaded(Vec<StoredDigest>),
    CacheLoadFailed(String),
    PutCommitted {
        reference: ImageRef,
        digest: ContentDigest,
    },
    PutFailed {
        reference: ImageRef,
        reason: String,
    },
}

/// Cheaply cloneable handle held by job-preparation code.
#[derive(Clone)]
pub struct ResolverHandle {
    requests: mpsc::Sender<LookupRequest>,
}

impl ResolverHandle {
    /// Resolve one reference. Every call receives exactly one reply; calls
    /// for a reference that is already in flight share its outcome.
    pub async fn resolve(&self, reference: ImageRef) -> Result<Resolution, ResolveError> {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(LookupRequest { reference, reply })
            .await
            .map_err(|_| ResolveError::Stopped)?;
        outcome.await.unwrap_or(Err(ResolveError::Stopped))
    }
}

/// The per-workflow resolver task.
pub struct TagResolver {
    workflow_id: Uuid,
    state: ResolverState,
    driver: LookupDriver,
    store: Arc<dyn DigestStore>,
    store_events: mpsc::UnboundedSender<StoreEvent>,
}

impl TagResolver {
    /// Spawn a resolver instance for one workflow and return its handle.
    /// The task exits once every handle is dropped and no work is parked.
    pub fn spawn(
        workflow_id: Uuid,
        config: ResolverConfig,
        service: Arc<dyn HashingService>,
        store: Arc<dyn DigestStore>,
    ) -> ResolverHandle {
        let (request_tx, request_rx) = mpsc::channel(64);
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let (lookup_tx, lookup_rx) = mpsc::unbounded_channel();

        let driver = LookupDriver::new(service, &config, lookup_tx);
        let state = match config.start_mode {
            StartMode::Fresh => ResolverState::fresh(),
            StartMode::Restart => {
                spawn_cache_load(workflow_id, Arc::clone(&store), store_tx.clone());
                ResolverState::loading()
            }
        };

        let resolver = TagResolver {
            workflow_id,
            state,
            driver,
            store,
            store_events: store_tx,
        };
        tokio::spawn(resolver.run(request_rx, store_rx, lookup_rx));

        ResolverHandle {
            requests: request_tx,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<LookupRequest>,
        mut store_events: mpsc::UnboundedReceiver<StoreEvent>,
        mut lookup_outcomes: mpsc::UnboundedReceiver<LookupOutcome>,
    ) {
        let mut requests_open = true;
        loop {
            tokio::select! {
                request = requests.recv(), if requests_open => match request {
                    Some(request) => self.handle_request(request),
                    None => requests_open = false,
                },
                Some(event) = store_events.recv() => self.handle_store_event(event),
                Some(outcome) = lookup_outcomes.recv() => self.handle_lookup_outcome(outcome),
                else => break,
            }
            if !requests_open && self.state.is_quiescent() {
                debug!(workflow_id = %self.workflow_id, "resolver quiescent, exiting");
                break;
            }
        }
    }

    fn handle_request(&mut self, LookupRequest { reference, reply }: LookupRequest) {
        match &mut self.state {
            ResolverState::LoadingCache { queued } => {
                debug!(
                    workflow_id = %self.workflow_id,
                    reference = %reference,
                    "queueing request during cache replay"
                );
                queued.entry(reference).or_default().push(reply);
            }
            ResolverState::Running { pending, resolved } => {
                if let Some(digest) = resolved.get(&reference) {
                    let digest = digest.clone();
                    let _ = reply.send(Ok(Resolution { reference, digest }));
                } else if let Some(waiters) = pending.get_mut(&reference) {
                    // One lookup is already outstanding; coalesce.
                    waiters.push(reply);
                } else {
                    pending.insert(reference.clone(), vec![reply]);
                    self.driver.dispatch(reference);
                }
            }
            ResolverState::Failed { reason } => {
                let _ = reply.send(Err(ResolveError::Terminal(reason.clone())));
            }
        }
    }

    fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::CacheLoaded(rows) => self.finish_cache_load(rows),
            StoreEvent::CacheLoadFailed(reason) => {
                if matches!(self.state, ResolverState::LoadingCache { .. }) {
                    warn!(
                        workflow_id = %self.workflow_id,
                        error = %reason,
                        "digest store load failed"
                    );
                    self.fail(reason);
                }
            }
            StoreEvent::PutCommitted { reference, digest } => {
                let ResolverState::Running { pending, resolved } = &mut self.state else {
                    return;
                };
                resolved.insert(reference.clone(), digest.clone());
                let Some(waiters) = pending.remove(&reference) else {
                    debug!(
                        workflow_id = %self.workflow_id,
                        reference = %reference,
                        "digest committed with no waiters"
                    );
                    return;
                };
                debug!(
                    workflow_id = %self.workflow_id,
                    reference = %reference,
                    digest = %digest,
                    waiters = waiters.len(),
                    "digest committed"
                );
                for waiter in waiters {
                    let _ = waiter.send(Ok(Resolution {
                        reference: reference.clone(),
                        digest: digest.clone(),
                    }));
                }
            }
            StoreEvent::PutFailed { reference, reason } => {
                let ResolverState::Running { pending, .. } = &mut self.state else {
                    return;
                };
                warn!(
                    workflow_id = %self.workflow_id,
                    reference = %reference,
                    error = %reason,
                    "digest write failed"
                );
                let Some(waiters) = pending.remove(&reference) else {
                    return;
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(ResolveError::Store {
                        reference: reference.clone(),
                        reason: reason.clone(),
                    }));
                }
            }
        }
    }

    fn handle_lookup_outcome(&mut self, outcome: LookupOutcome) {
        match outcome {
            LookupOutcome::Resolved { reference, digest } => {
                if !matches!(self.state, ResolverState::Running { .. }) {
                    return;
                }
                // Waiters are only replied once the write lands; see the
                // module docs for the durability ordering.
                self.spawn_put(reference, digest);
            }
            LookupOutcome::Failed { reference, reason } => {
                let ResolverState::Running { pending, .. } = &mut self.state else {
                    return;
                };
                let Some(waiters) = pending.remove(&reference) else {
                    return;
                };
                debug!(
                    workflow_id = %self.workflow_id,
                    reference = %reference,
                    error = %reason,
                    "hash lookup failed"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(ResolveError::Lookup {
                        reference: reference.clone(),
                        reason: reason.clone(),
                    }));
                }
            }
            LookupOutcome::TimedOut => {
                if matches!(self.state, ResolverState::Failed { .. }) {
                    return;
                }
                // The timeout carries no reference, so there is no way to
                // tell which in-flight lookup died: the whole instance has
                // to fail.
                error!(
                    workflow_id = %self.workflow_id,
                    "hash lookup deadline elapsed, failing the workflow"
                );
                self.fail(TIMEOUT_REASON.to_owned());
            }
        }
    }

    fn finish_cache_load(&mut self, rows: Vec<StoredDigest>) {
        if !matches!(self.state, ResolverState::LoadingCache { .. }) {
            return;
        }

        // Reparse every row before touching the queue: one bad row means
        // the store cannot be trusted at all.
        let mut resolved = HashMap::with_capacity(rows.len());
        for row in &rows {
            match (
                row.reference.parse::<ImageRef>(),
                row.digest.parse::<ContentDigest>(),
            ) {
                (Ok(reference), Ok(digest)) => {
                    // Later rows win, matching the store's write order.
                    resolved.insert(reference, digest);
                }
                _ => {
                    warn!(
                        workflow_id = %self.workflow_id,
                        reference = %row.reference,
                        digest = %row.digest,
                        "persisted row no longer parses"
                    );
                    self.fail(CORRUPT_STORE_REASON.to_owned());
                    return;
                }
            }
        }

        let ResolverState::LoadingCache { queued } = &mut self.state else {
            return;
        };
        let queued = std::mem::take(queued);
        let mut pending = HashMap::new();
        let mut hits = 0usize;
        for (reference, waiters) in queued {
            match resolved.get(&reference) {
                Some(digest) => {
                    hits += waiters.len();
                    for waiter in waiters {
                        let _ = waiter.send(Ok(Resolution {
                            reference: reference.clone(),
                            digest: digest.clone(),
                        }));
                    }
                }
                None => {
                    pending.insert(reference, waiters);
                }
            }
        }
        for reference in pending.keys() {
            self.driver.dispatch(reference.clone());
        }

        info!(
            workflow_id = %self.workflow_id,
            cached = resolved.len(),
            hits,
            misses = pending.len(),
            "cache replay complete"
        );
        self.state = ResolverState::Running { pending, resolved };
    }

    /// Enter the terminal state, failing every parked waiter.
    fn fail(&mut self, reason: String) {
        let waiters = self.state.drain_waiters();
        if !waiters.is_empty() {
            warn!(
                workflow_id = %self.workflow_id,
                waiters = waiters.len(),
                reason = %reason,
                "failing parked waiters"
            );
        }
        for waiter in waiters {
            let _ = waiter.send(Err(ResolveError::Terminal(reason.clone())));
        }
        self.state = ResolverState::Failed { reason };
    }

    fn spawn_put(&self, reference: ImageRef, digest: ContentDigest) {
        let store = Arc::clone(&self.store);
        let events = self.store_events.clone();
        let workflow_id = self.workflow_id;
        tokio::spawn(async move {
            let event = match store
                .put(workflow_id, &reference.to_string(), &digest.to_string())
                .await
            {
                Ok(()) => StoreEvent::PutCommitted { reference, digest },
                Err(err) => StoreEvent::PutFailed {
                    reference,
                    reason: err.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }
}

fn spawn_cache_load(
    workflow_id: Uuid,
    store: Arc<dyn DigestStore>,
    events: mpsc::UnboundedSender<StoreEvent>,
) {
    tokio::spawn(async move {
        let event = match store.load_all(workflow_id).await {
            Ok(rows) => StoreEvent::CacheLoaded(rows),
            Err(err) => StoreEvent::CacheLoadFailed(err.to_string()),
        };
        let _ = events.send(event);
    });
}
