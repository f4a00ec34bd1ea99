//! Background cache worker
//!
//! Secret-store calls may shell out and block for a while, so the service
//! never calls [`CredentialCache`] directly. Jobs go through a bounded queue
//! to a single worker task that runs them one at a time on the blocking
//! pool. Running them in order means a clear issued before a store is
//! always applied first.

use super::{CacheError, CacheKey, CachedCredential, CredentialCache};
use crate::auth::CredentialBundle;
use crate::session::SessionEnv;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const QUEUE_DEPTH: usize = 32;

pub type LookupReply = Result<Option<CachedCredential>, CacheError>;

enum CacheJob {
    Lookup {
        session: SessionEnv,
        key: CacheKey,
        reply: oneshot::Sender<LookupReply>,
    },
    Store {
        session: SessionEnv,
        key: CacheKey,
        bundle: CredentialBundle,
        ttl_hours: u32,
    },
    Clear {
        session: SessionEnv,
        key: CacheKey,
    },
    ClearAll {
        session: SessionEnv,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
}

impl CacheJob {
    fn run(self, cache: &CredentialCache) {
        match self {
            CacheJob::Lookup {
                session,
                key,
                reply,
            } => {
                let _ = reply.send(cache.lookup(&session, &key));
            }
            CacheJob::Store {
                session,
                key,
                bundle,
                ttl_hours,
            } => {
                if let Err(e) = cache.store(&session, &key, &bundle, ttl_hours) {
                    warn!("Failed to cache credential for {}: {}", key, e);
                }
            }
            CacheJob::Clear { session, key } => {
                if let Err(e) = cache.clear(&session, &key) {
                    warn!("Failed to clear cached credential for {}: {}", key, e);
                }
            }
            CacheJob::ClearAll { session } => {
                if let Err(e) = cache.clear_all(&session) {
                    warn!("Failed to clear cached credentials: {}", e);
                }
            }
            CacheJob::Flush { done } => {
                let _ = done.send(());
            }
        }
    }
}

/// Sender side of the cache worker
#[derive(Clone)]
pub struct CacheClient {
    jobs: mpsc::Sender<CacheJob>,
}

impl CacheClient {
    /// Start the worker on the current runtime
    pub fn spawn(cache: Arc<CredentialCache>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run(cache, rx));
        Self { jobs: tx }
    }

    /// Queue a lookup. If the queue is full or the worker is gone the
    /// receiver resolves to an error, which callers treat as a miss.
    pub fn lookup(&self, session: SessionEnv, key: CacheKey) -> oneshot::Receiver<LookupReply> {
        let (reply, rx) = oneshot::channel();
        self.submit(CacheJob::Lookup {
            session,
            key,
            reply,
        });
        rx
    }

    pub fn store(&self, session: SessionEnv, key: CacheKey, bundle: CredentialBundle, ttl_hours: u32) {
        self.submit(CacheJob::Store {
            session,
            key,
            bundle,
            ttl_hours,
        });
    }

    pub fn clear(&self, session: SessionEnv, key: CacheKey) {
        self.submit(CacheJob::Clear { session, key });
    }

    pub fn clear_all(&self, session: SessionEnv) {
        self.submit(CacheJob::ClearAll { session });
    }

    /// Resolves once every job queued before it has run
    pub fn flush(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        self.submit(CacheJob::Flush { done });
        rx
    }

    fn submit(&self, job: CacheJob) {
        if let Err(e) = self.jobs.try_send(job) {
            warn!("Credential cache worker unavailable, dropping job: {}", e);
        }
    }
}

async fn run(cache: Arc<CredentialCache>, mut jobs: mpsc::Receiver<CacheJob>) {
    while let Some(job) = jobs.recv().await {
        let cache = cache.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || job.run(&cache)).await {
            warn!("Credential cache job panicked: {}", e);
        }
    }
    debug!("Credential cache worker stopped");
}
