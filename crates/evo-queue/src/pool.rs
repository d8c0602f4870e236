//! Bounded pool of reusable remote sessions.
//!
//! Capacity is enforced with a semaphore; sessions are created lazily by
//! the injected factory, so discarding a broken session never shrinks the
//! pool: the next acquire simply builds a replacement.
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::transport::{SessionFactory, Transport, TransportError};

#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was shut down; treat as a cancellation signal.
    #[error("connection pool is closed")]
    Closed,
    /// A replacement session could not be created. Fatal configuration
    /// problem (e.g. authentication lost).
    #[error("cannot create session: {0}")]
    Factory(String),
}

impl From<TransportError> for PoolError {
    fn from(e: TransportError) -> Self {
        PoolError::Factory(e.to_string())
    }
}

pub struct ConnectionPool {
    factory: Box<dyn SessionFactory>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Transport>>>,
    capacity: usize,
}

impl ConnectionPool {
    pub fn new(capacity: usize, factory: Box<dyn SessionFactory>) -> Arc<Self> {
        Arc::new(ConnectionPool {
            factory,
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions currently available without connecting.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Wait until a slot is free and hand out a session. Blocks the
    /// calling task, never the thread. Fails only after `close()` or when
    /// the factory cannot produce a session.
    pub async fn acquire(self: &Arc<Self>) -> Result<ConnectionHandle, PoolError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let reused = {
            let mut idle = self.idle.lock().map_err(|_| PoolError::Closed)?;
            idle.pop()
        };
        let transport = match reused {
            Some(t) => t,
            None => {
                debug!("connection pool creating a session");
                self.factory.connect().await?
            }
        };
        Ok(ConnectionHandle {
            transport: Some(transport),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Shut the pool down: current waiters and future acquires fail with
    /// `PoolError::Closed`. Checked-out handles stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn restore(&self, transport: Box<dyn Transport>) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(transport);
        }
    }
}

/// Exclusively-owned checked-out session. Dropping the handle returns the
/// session to the pool and wakes exactly one waiter; `discard` drops a
/// broken session instead, freeing the slot without recycling it.
pub struct ConnectionHandle {
    transport: Option<Box<dyn Transport>>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionHandle {
    /// Throw the underlying session away (e.g. after a transport error
    /// that leaves it unusable). The pool's capacity is unaffected: a
    /// replacement is created lazily on a later acquire.
    pub fn discard(mut self) {
        self.transport = None;
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        // Invariant: transport is only None inside discard/drop.
        self.transport.as_deref().expect("connection handle already discarded")
    }
}

impl DerefMut for ConnectionHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transport.as_deref_mut().expect("connection handle already discarded")
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(t) = self.transport.take() {
            self.pool.restore(t);
        }
        // _permit drops here, waking one waiter.
    }
}
