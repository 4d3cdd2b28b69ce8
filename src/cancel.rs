//! Cooperative cancellation for scans and transfers.
//!
//! Every long operation takes a [`CancelToken`]. The [`CancellationRegistry`]
//! lives at the boundary that starts operations: it hands out an
//! [`OperationHandle`] (id + token) and forgets the entry when the handle drops.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{VaultError, VaultResult};

pub type OperationId = Uuid;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Suspension-point check: `Err(Cancelled)` once signaled.
    pub fn check(&self) -> VaultResult<()> {
        if self.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: RwLock<HashMap<OperationId, CancelToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a fresh operation. The entry is removed when the handle drops.
    pub fn begin(self: &Arc<Self>) -> OperationHandle {
        let id = Uuid::new_v4();
        let token = CancelToken::new();
        self.tokens.write().insert(id, token.clone());
        OperationHandle {
            id,
            token,
            registry: Arc::clone(self),
        }
    }

    pub fn cancel(&self, id: &OperationId) -> bool {
        match self.tokens.read().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight operation, returning how many were signaled.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.read();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub fn active(&self) -> usize {
        self.tokens.read().len()
    }

    fn finish(&self, id: &OperationId) {
        self.tokens.write().remove(id);
    }
}

/// One registered operation; dropping it deregisters the token.
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    token: CancelToken,
    registry: Arc<CancellationRegistry>,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        self.registry.finish(&self.id);
    }
}
