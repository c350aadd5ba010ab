//! Environment provisioning and the process-wide handle cache.
//!
//! Each `(backend, key)` pair owns one slot. The first caller for a slot
//! runs the backend's provisioning; concurrent callers await the same
//! in-flight build and later callers get the cached outcome. Failures are
//! cached too, so a broken build is not retried until the process restarts.
//! The map lock is only held to look up a slot, never across a build, so
//! different keys provision in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::BackendKind;
use crate::error::Result;
use crate::key::EnvironmentKey;

/// A ready execution target.
///
/// Never mutated after creation; the cache hands out clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    kind: BackendKind,
    key: EnvironmentKey,
    remote_id: String,
    reused: bool,
}

impl EnvironmentHandle {
    /// Creates a handle for an environment that was just built (`reused = false`)
    /// or found already present (`reused = true`).
    pub fn new(kind: BackendKind, key: EnvironmentKey, remote_id: impl Into<String>, reused: bool) -> Self {
        Self {
            kind,
            key,
            remote_id: remote_id.into(),
            reused,
        }
    }

    /// Backend variant.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Environment key.
    pub fn key(&self) -> &EnvironmentKey {
        &self.key
    }

    /// Backend-specific identifier: template or snapshot id, or the local program path.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Whether this handle refers to an environment that was not built by this request.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    fn as_reused(&self) -> Self {
        Self {
            reused: true,
            ..self.clone()
        }
    }
}

type Slot = Arc<OnceCell<Result<EnvironmentHandle>>>;

/// Process-wide cache of provisioned environments.
#[derive(Debug, Default)]
pub struct ProvisioningCache {
    slots: Mutex<HashMap<(BackendKind, EnvironmentKey), Slot>>,
}

impl ProvisioningCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every binding in this process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ProvisioningCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    fn slot(&self, kind: BackendKind, key: &EnvironmentKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry((kind, key.clone())).or_default())
    }

    /// Provisions `key` on `backend` at most once per process.
    ///
    /// The caller that triggers provisioning receives the backend's handle
    /// as-is. Every other caller receives a clone marked as reused, or the
    /// same error.
    pub async fn provision(&self, backend: &dyn Backend, key: &EnvironmentKey) -> Result<EnvironmentHandle> {
        let kind = backend.kind();
        let slot = self.slot(kind, key);

        let mut provisioned_here = false;
        let outcome = slot
            .get_or_init(|| {
                provisioned_here = true;
                info!("Provisioning {} environment '{}'", kind, key);
                backend.provision(key)
            })
            .await;

        if provisioned_here {
            return outcome.clone();
        }

        debug!("Using cached {} environment '{}'", kind, key);
        match outcome {
            Ok(handle) => Ok(handle.as_reused()),
            Err(e) => Err(e.clone()),
        }
    }

    /// Returns the cached handle for a key without provisioning.
    pub fn get(&self, kind: BackendKind, key: &EnvironmentKey) -> Option<EnvironmentHandle> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&(kind, key.clone()))
            .and_then(|slot| slot.get())
            .and_then(|outcome| outcome.as_ref().ok())
            .map(EnvironmentHandle::as_reused)
    }
}
