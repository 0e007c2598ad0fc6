//! Fixed-size backend session pool.
//!
//! Capacity is enforced with a semaphore: a session pinned through
//! prepare→commit keeps its permit, so pinned sessions count against the
//! pool exactly like active ones. `acquire` waits up to the configured
//! timeout and then fails with a structured error.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::Backend;
use crate::error::{CoreError, Result};

/// Configuration for a backend session pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent sessions, pinned ones included.
    pub capacity: usize,
    /// Maximum time to wait for a free slot.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: 5,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Shared handle to a bounded set of backend sessions.
pub struct BackendPool<B: Backend> {
    backend: Arc<B>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

impl<B: Backend> Clone for BackendPool<B> {
    fn clone(&self) -> Self {
        BackendPool {
            backend: Arc::clone(&self.backend),
            permits: Arc::clone(&self.permits),
            config: self.config.clone(),
        }
    }
}

impl<B: Backend> BackendPool<B> {
    pub fn new(backend: B, config: PoolConfig) -> Self {
        BackendPool {
            permits: Arc::new(Semaphore::new(config.capacity)),
            backend: Arc::new(backend),
            config,
        }
    }

    /// Acquire a session, waiting up to the configured timeout for a slot.
    pub async fn acquire(&self) -> Result<PooledSession<B>> {
        let wait = Duration::from_millis(self.config.acquire_timeout_ms);
        let permit = tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| CoreError::PoolTimeout(self.config.acquire_timeout_ms))?
            .map_err(|_| CoreError::Backend("session pool closed".to_string()))?;
        let session = self.backend.begin()?;
        Ok(PooledSession {
            session,
            _permit: permit,
        })
    }

    /// Whether the underlying engine answers a liveness probe.
    pub fn health(&self) -> bool {
        self.backend.ping()
    }

    /// Slots currently free (capacity minus active and pinned sessions).
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// A session holding one pool slot; the slot is freed when the session is
/// dropped, whether or not it committed.
pub struct PooledSession<B: Backend> {
    session: B::Session,
    _permit: OwnedSemaphorePermit,
}

impl<B: Backend> std::fmt::Debug for PooledSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").finish_non_exhaustive()
    }
}

impl<B: Backend> Deref for PooledSession<B> {
    type Target = B::Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<B: Backend> DerefMut for PooledSession<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}
