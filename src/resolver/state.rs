//! Resolver state machine data.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::reference::{ContentDigest, ImageRef};

use super::{Resolution, ResolveError};

/// Reply handle for one requester awaiting one reference.
pub(crate) type Waiter = oneshot::Sender<Result<Resolution, ResolveError>>;

/// The three states of a resolver instance. A reference lives in at most
/// one of `queued`, `pending`, or `resolved` at any instant.
pub(crate) enum ResolverState {
    /// Restart replay in progress: requests queue up, no lookups are
    /// issued until the persisted mappings have been reloaded.
    LoadingCache {
        queued: HashMap<ImageRef, Vec<Waiter>>,
    },
    /// Normal operation. A key in `pending` means exactly one lookup is
    /// outstanding for it; `resolved` entries are never updated or removed.
    Running {
        pending: HashMap<ImageRef, Vec<Waiter>>,
        resolved: HashMap<ImageRef, ContentDigest>,
    },
    /// Terminal: every parked and future request fails with `reason`.
    Failed { reason: String },
}

impl ResolverState {
    pub(crate) fn fresh() -> Self {
        ResolverState::Running {
            pending: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    pub(crate) fn loading() -> Self {
        ResolverState::LoadingCache {
            queued: HashMap::new(),
        }
    }

    /// True when no waiter is parked anywhere, so the instance can exit
    /// once its handles are gone.
    pub(crate) fn is_quiescent(&self) -> bool {
        match self {
            ResolverState::LoadingCache { queued } => queued.is_empty(),
            ResolverState::Running { pending, .. } => pending.is_empty(),
            ResolverState::Failed { .. } => true,
        }
    }

    /// Take every parked waiter, preserving per-reference arrival order.
    pub(crate) fn drain_waiters(&mut self) -> Vec<Waiter> {
        let parked = match self {
            ResolverState::LoadingCache { queued } => queued,
            ResolverState::Running { pending, .. } => pending,
            ResolverState::Failed { .. } => return Vec::new(),
        };
        parked.drain().flat_map(|(_, waiters)| waiters).collect()
    }
}
