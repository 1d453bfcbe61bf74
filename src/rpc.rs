//! # Request Correlation
//!
//! A request is an envelope carrying a fresh nonce; its reply carries the
//! same nonce back. [`PendingRequests`] maps outstanding nonces to the
//! caller waiting on them.
//!
//! ## Exactly-Once Resolution
//!
//! Every path that can finish a request (reply, deadline, cancellation,
//! connection loss, shutdown) first *removes* the entry under the registry
//! lock. Only the remover gets to complete the caller; everyone else sees
//! the entry gone and backs off. A reply that arrives after its request was
//! timed out therefore finds nothing and is dropped.
//!
//! ## Contexts
//!
//! [`RequestContext`] bundles an optional deadline with a cancellation
//! token. The deadline covers the whole request: dialing, handshake, and
//! waiting for the reply.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::NodeError;
use crate::identity::PeerId;
use crate::messages::MessageEnvelope;
use crate::transport::ConnectionId;

/// Default deadline applied when a context carries none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on outstanding requests.
const MAX_PENDING_REQUESTS: usize = 10_000;

#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Apply `timeout` from now if no deadline is set.
    pub fn or_timeout(mut self, timeout: Duration) -> Self {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + timeout);
        }
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` until it completes, the deadline passes, or the context is cancelled.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, NodeError>
    where
        F: Future<Output = Result<T, NodeError>>,
    {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NodeError::RequestCancelled),
            _ = expired => Err(NodeError::RequestTimeout),
            result = fut => result,
        }
    }
}

pub type ReplyReceiver = oneshot::Receiver<Result<MessageEnvelope, NodeError>>;

struct PendingRequest {
    reply: oneshot::Sender<Result<MessageEnvelope, NodeError>>,
    route: ConnectionId,
    recipient: PeerId,
}

/// Outcome of offering a reply envelope to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyMatch {
    Resolved,
    /// No request with that nonce is outstanding (late, duplicate or bogus).
    Unknown,
    /// A request with that nonce exists but was sent to someone else.
    WrongSender,
}

pub struct PendingRequests {
    entries: Mutex<HashMap<u64, PendingRequest>>,
    next_nonce: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            // Random start so nonces are not predictable across restarts.
            next_nonce: AtomicU64::new(OsRng.next_u64()),
        }
    }

    /// Reserve a nonce for a request to `recipient` routed over `route`.
    pub fn register(
        &self,
        route: ConnectionId,
        recipient: PeerId,
    ) -> Result<(u64, ReplyReceiver), NodeError> {
        let mut entries = self.lock();
        if entries.len() >= MAX_PENDING_REQUESTS {
            return Err(NodeError::Config(format!(
                "too many outstanding requests (max {MAX_PENDING_REQUESTS})"
            )));
        }
        let nonce = loop {
            let candidate = self.next_nonce.fetch_add(1, Ordering::Relaxed);
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = oneshot::channel();
        entries.insert(
            nonce,
            PendingRequest {
                reply: tx,
                route,
                recipient,
            },
        );
        Ok((nonce, rx))
    }

    /// Complete the request `reply` answers, if any.
    pub fn resolve(&self, reply: MessageEnvelope) -> ReplyMatch {
        let Some(nonce) = reply.nonce else {
            return ReplyMatch::Unknown;
        };
        let pending = {
            let mut entries = self.lock();
            let sender_matches = match entries.get(&nonce) {
                None => return ReplyMatch::Unknown,
                Some(p) => p.recipient == reply.sender,
            };
            if !sender_matches {
                return ReplyMatch::WrongSender;
            }
            entries.remove(&nonce)
        };
        if let Some(pending) = pending {
            let _ = pending.reply.send(Ok(reply));
        }
        ReplyMatch::Resolved
    }

    /// Withdraw a request. Returns `false` if something else already resolved it.
    pub fn remove(&self, nonce: u64) -> bool {
        self.lock().remove(&nonce).is_some()
    }

    /// Resolve every request routed over `route` with `ConnectionLost`.
    pub fn fail_route(&self, route: ConnectionId) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut entries = self.lock();
            let nonces: Vec<u64> = entries
                .iter()
                .filter(|(_, p)| p.route == route)
                .map(|(n, _)| *n)
                .collect();
            nonces.iter().filter_map(|n| entries.remove(n)).collect()
        };
        let count = failed.len();
        for pending in failed {
            let _ = pending.reply.send(Err(NodeError::ConnectionLost));
        }
        if count > 0 {
            trace!(conn = %route, count, "failed pending requests on closed connection");
        }
        count
    }

    /// Resolve everything with `Shutdown`.
    pub fn fail_all(&self) {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.reply.send(Err(NodeError::Shutdown));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
