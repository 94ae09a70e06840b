//! Registry of packages available for streaming.
//!
//! A package must be registered with its manifest before any read or
//! prefetch can touch it. The registry tracks each package's manifest and
//! its verification state; residency questions are answered by the chunk
//! store, which is the single authority on which bytes are on disk.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::ChunkStore;
use crate::manifest::{PakId, PakManifest};
use crate::range::ChunkRange;

// ============================================================================
// Errors
// ============================================================================

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A different manifest is already registered under this name.
    #[error("Package already registered: {pak}")]
    AlreadyRegistered { pak: PakId },

    /// The package is not registered.
    #[error("Package not registered: {pak}")]
    NotRegistered { pak: PakId },
}

// ============================================================================
// Integrity state
// ============================================================================

/// Verification state of a registered package.
///
/// The whole package body is hashed lazily, once it first becomes fully
/// resident. A mismatch invalidates the cached bytes and allows exactly one
/// refetch; a second mismatch is terminal until the package is re-registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityState {
    /// Never verified (or residency changed since the last verification).
    Unverified,

    /// First verification failed; the refetched body gets one more check.
    Retrying,

    /// The body hashed to the manifest digest.
    Verified,

    /// Verification failed twice; reads fail until re-registration.
    Failed,
}

impl std::fmt::Display for IntegrityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unverified => write!(f, "unverified"),
            Self::Retrying => write!(f, "retrying"),
            Self::Verified => write!(f, "verified"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug)]
struct PakState {
    manifest: PakManifest,
    integrity: IntegrityState,
}

// ============================================================================
// Registry
// ============================================================================

/// Tracks registered packages and their verification state.
#[derive(Debug)]
pub struct PakRegistry {
    paks: DashMap<PakId, PakState>,
    store: Arc<ChunkStore>,
}

impl PakRegistry {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self {
            paks: DashMap::new(),
            store,
        }
    }

    /// Register a package for streaming.
    ///
    /// If the cache already holds the whole body and it previously verified
    /// against this manifest's digest, the package starts out
    /// [`IntegrityState::Verified`] and will not be re-hashed.
    ///
    /// Registering the same manifest twice is a no-op; registering a
    /// different manifest under an existing name is an error.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] if the name is taken by a
    /// manifest with a different digest.
    pub fn register(&self, manifest: PakManifest) -> Result<(), RegistryError> {
        if let Some(existing) = self.paks.get(&manifest.name) {
            if existing.manifest.digest == manifest.digest {
                debug!(pak = %manifest.name, "Package already registered with same digest");
                return Ok(());
            }
            return Err(RegistryError::AlreadyRegistered {
                pak: manifest.name.clone(),
            });
        }

        let verified_in_cache = self
            .store
            .verified_digest(&manifest.name)
            .is_some_and(|digest| digest == manifest.digest)
            && self
                .store
                .is_fully_resident(&manifest.name, manifest.total_length);

        let integrity = if verified_in_cache {
            IntegrityState::Verified
        } else {
            IntegrityState::Unverified
        };

        info!(
            pak = %manifest.name,
            total_length = manifest.total_length,
            assets = manifest.assets.len(),
            integrity = %integrity,
            "Registered package"
        );
        self.paks.insert(
            manifest.name.clone(),
            PakState {
                manifest,
                integrity,
            },
        );
        Ok(())
    }

    /// Remove a package from the registry.
    ///
    /// Queue draining, waiter failure, and cache invalidation are driven by
    /// the fetch daemon; this only forgets the manifest.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotRegistered`] if the name is unknown.
    pub fn unregister(&self, pak: &PakId) -> Result<PakManifest, RegistryError> {
        match self.paks.remove(pak) {
            Some((_, state)) => {
                info!(pak = %pak, "Unregistered package");
                Ok(state.manifest)
            }
            None => Err(RegistryError::NotRegistered { pak: pak.clone() }),
        }
    }

    pub fn is_registered(&self, pak: &PakId) -> bool {
        self.paks.contains_key(pak)
    }

    /// Manifest for a registered package.
    pub fn manifest(&self, pak: &PakId) -> Option<PakManifest> {
        self.paks.get(pak).map(|state| state.manifest.clone())
    }

    /// Names of all registered packages, sorted.
    pub fn registered(&self) -> Vec<PakId> {
        let mut names: Vec<PakId> = self.paks.iter().map(|item| item.key().clone()).collect();
        names.sort();
        names
    }

    // ========================================================================
    // Integrity transitions
    // ========================================================================

    /// Current verification state.
    pub fn integrity(&self, pak: &PakId) -> Option<IntegrityState> {
        self.paks.get(pak).map(|state| state.integrity)
    }

    /// Record a successful verification.
    pub fn mark_verified(&self, pak: &PakId) {
        if let Some(mut state) = self.paks.get_mut(pak) {
            state.integrity = IntegrityState::Verified;
        }
    }

    /// Record a failed verification and advance the state machine.
    ///
    /// The first failure moves to [`IntegrityState::Retrying`]; a failure
    /// while retrying is terminal. Returns the new state.
    pub fn record_verification_failure(&self, pak: &PakId) -> Option<IntegrityState> {
        let mut state = self.paks.get_mut(pak)?;
        state.integrity = match state.integrity {
            IntegrityState::Retrying | IntegrityState::Failed => IntegrityState::Failed,
            IntegrityState::Unverified | IntegrityState::Verified => IntegrityState::Retrying,
        };
        Some(state.integrity)
    }

    /// Drop back to unverified (residency changed, e.g. after eviction).
    pub fn clear_verified(&self, pak: &PakId) {
        if let Some(mut state) = self.paks.get_mut(pak) {
            if state.integrity == IntegrityState::Verified {
                state.integrity = IntegrityState::Unverified;
            }
        }
    }

    // ========================================================================
    // Residency queries (delegated to the store)
    // ========================================================================

    /// Resident spans for a registered package.
    pub fn residency(&self, pak: &PakId) -> Option<Vec<ChunkRange>> {
        self.paks.get(pak)?;
        Some(self.store.residency(pak))
    }

    /// Whether the whole body of a registered package is resident.
    pub fn is_fully_resident(&self, pak: &PakId) -> Option<bool> {
        let total = self.paks.get(pak)?.manifest.total_length;
        Some(self.store.is_fully_resident(pak, total))
    }

    /// Resident and total byte counts for progress reporting.
    pub fn progress(&self, pak: &PakId) -> Option<(u64, u64)> {
        let total = self.paks.get(pak)?.manifest.total_length;
        let resident = self.store.residency_set(pak).resident_bytes();
        Some((resident, total))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::hex_sha256;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn manifest(name: &str, body: &[u8]) -> PakManifest {
        PakManifest {
            name: PakId::new(name).unwrap(),
            total_length: body.len() as u64,
            digest: hex_sha256(body),
            assets: Vec::new(),
        }
    }

    async fn store(temp: &TempDir) -> Arc<ChunkStore> {
        Arc::new(ChunkStore::open(temp.path(), 10_000).await.unwrap())
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let temp = TempDir::new().unwrap();
        let registry = PakRegistry::new(store(&temp).await);
        let m = manifest("alpha", b"0123456789");

        registry.register(m.clone()).unwrap();
        assert!(registry.is_registered(&m.name));
        assert_eq!(registry.integrity(&m.name), Some(IntegrityState::Unverified));
        assert_eq!(registry.manifest(&m.name).unwrap().digest, m.digest);

        let returned = registry.unregister(&m.name).unwrap();
        assert_eq!(returned.digest, m.digest);
        assert!(!registry.is_registered(&m.name));
        assert!(registry.integrity(&m.name).is_none());
    }

    #[tokio::test]
    async fn test_register_same_digest_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let registry = PakRegistry::new(store(&temp).await);
        let m = manifest("alpha", b"0123456789");

        registry.register(m.clone()).unwrap();
        registry.register(m.clone()).unwrap();
        assert_eq!(registry.registered(), vec![m.name]);
    }

    #[tokio::test]
    async fn test_register_conflicting_digest_fails() {
        let temp = TempDir::new().unwrap();
        let registry = PakRegistry::new(store(&temp).await);

        registry.register(manifest("alpha", b"version one")).unwrap();
        let err = registry
            .register(manifest("alpha", b"version two"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_unregister_unknown_fails() {
        let temp = TempDir::new().unwrap();
        let registry = PakRegistry::new(store(&temp).await);
        let err = registry.unregister(&PakId::new("ghost").unwrap()).unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_register_honours_cached_verification() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let body = b"full package body".to_vec();
        let m = manifest("warm", &body);

        store
            .put(&m.name, ChunkRange::new(0, body.len() as u64), Bytes::from(body))
            .await
            .unwrap();
        store.mark_verified(&m.name, m.digest.clone());

        let registry = PakRegistry::new(store);
        registry.register(m.clone()).unwrap();
        assert_eq!(registry.integrity(&m.name), Some(IntegrityState::Verified));
    }

    #[tokio::test]
    async fn test_register_ignores_verification_for_other_digest() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let body = b"full package body".to_vec();
        let m = manifest("warm", &body);

        store
            .put(&m.name, ChunkRange::new(0, body.len() as u64), Bytes::from(body))
            .await
            .unwrap();
        // Verified against some other content.
        store.mark_verified(&m.name, hex_sha256(b"different content"));

        let registry = PakRegistry::new(store);
        registry.register(m.clone()).unwrap();
        assert_eq!(registry.integrity(&m.name), Some(IntegrityState::Unverified));
    }

    #[tokio::test]
    async fn test_register_ignores_verification_when_not_fully_resident() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let body = b"full package body".to_vec();
        let m = manifest("warm", &body);

        // Only a prefix is resident.
        store
            .put(&m.name, ChunkRange::new(0, 4), Bytes::from(body[..4].to_vec()))
            .await
            .unwrap();
        store.mark_verified(&m.name, m.digest.clone());

        let registry = PakRegistry::new(store);
        registry.register(m.clone()).unwrap();
        assert_eq!(registry.integrity(&m.name), Some(IntegrityState::Unverified));
    }

    #[tokio::test]
    async fn test_verification_failure_state_machine() {
        let temp = TempDir::new().unwrap();
        let registry = PakRegistry::new(store(&temp).await);
        let m = manifest("flaky", b"body");
        registry.register(m.clone()).unwrap();

        assert_eq!(
            registry.record_verification_failure(&m.name),
            Some(IntegrityState::Retrying)
        );
        assert_eq!(
            registry.record_verification_failure(&m.name),
            Some(IntegrityState::Failed)
        );
        // Terminal: further failures stay failed.
        assert_eq!(
            registry.record_verification_failure(&m.name),
            Some(IntegrityState::Failed)
        );

        // Re-registration resets the state machine.
        registry.unregister(&m.name).unwrap();
        registry.register(m.clone()).unwrap();
        assert_eq!(registry.integrity(&m.name), Some(IntegrityState::Unverified));
    }

    #[tokio::test]
    async fn test_residency_and_progress() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let m = manifest("tracked", &vec![0u8; 1000]);

        let registry = PakRegistry::new(Arc::clone(&store));
        registry.register(m.clone()).unwrap();

        assert_eq!(registry.progress(&m.name), Some((0, 1000)));
        assert_eq!(registry.is_fully_resident(&m.name), Some(false));

        store
            .put(&m.name, ChunkRange::new(0, 400), Bytes::from(vec![1u8; 400]))
            .await
            .unwrap();
        assert_eq!(registry.progress(&m.name), Some((400, 1000)));
        assert_eq!(registry.residency(&m.name), Some(vec![ChunkRange::new(0, 400)]));

        store
            .put(&m.name, ChunkRange::new(400, 1000), Bytes::from(vec![2u8; 600]))
            .await
            .unwrap();
        assert_eq!(registry.is_fully_resident(&m.name), Some(true));

        assert!(registry.progress(&PakId::new("ghost").unwrap()).is_none());
    }
}
