/// Engine binary registry
///
/// Holds the engine payload for each instruction-set variant. Every slot is
/// write-once: the first payload stored for a variant wins and later writes
/// are ignored. Controllers read a snapshot at every Init.

use crate::protocol::EngineAssets;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Instruction-set variant of the engine binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetVariant {
    Baseline,
    Simd,
}

impl AssetVariant {
    /// Variant the current CPU can run best
    pub fn preferred() -> Self {
        if simd_supported() {
            AssetVariant::Simd
        } else {
            AssetVariant::Baseline
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn simd_supported() -> bool {
    std::is_x86_feature_detected!("sse4.1")
}

#[cfg(target_arch = "aarch64")]
fn simd_supported() -> bool {
    true
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn simd_supported() -> bool {
    false
}

/// Write-once payload slots keyed by `AssetVariant`
#[derive(Debug, Default)]
pub struct AssetRegistry {
    baseline: OnceLock<Arc<[u8]>>,
    simd: OnceLock<Arc<[u8]>>,
}

static GLOBAL: OnceLock<Arc<AssetRegistry>> = OnceLock::new();

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry shared by controllers that are not given one
    pub fn global() -> Arc<AssetRegistry> {
        GLOBAL.get_or_init(|| Arc::new(AssetRegistry::new())).clone()
    }

    fn slot(&self, variant: AssetVariant) -> &OnceLock<Arc<[u8]>> {
        match variant {
            AssetVariant::Baseline => &self.baseline,
            AssetVariant::Simd => &self.simd,
        }
    }

    /// Store a payload; returns false if the slot was already set
    pub fn set(&self, variant: AssetVariant, payload: impl Into<Arc<[u8]>>) -> bool {
        let stored = self.slot(variant).set(payload.into()).is_ok();
        if stored {
            debug!("Registered {:?} engine payload", variant);
        } else {
            warn!("{:?} engine payload already registered, ignoring new value", variant);
        }
        stored
    }

    pub fn get(&self, variant: AssetVariant) -> Option<Arc<[u8]>> {
        self.slot(variant).get().cloned()
    }

    pub fn is_set(&self, variant: AssetVariant) -> bool {
        self.slot(variant).get().is_some()
    }

    /// Both payloads as sent with an Init command
    pub fn snapshot(&self) -> EngineAssets {
        EngineAssets {
            baseline: self.get(AssetVariant::Baseline),
            simd: self.get(AssetVariant::Simd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_writer_wins() {
        let registry = AssetRegistry::new();

        assert!(registry.set(AssetVariant::Baseline, vec![1u8, 2, 3]));
        assert!(!registry.set(AssetVariant::Baseline, vec![9u8]));

        assert_eq!(registry.get(AssetVariant::Baseline).unwrap().as_ref(), &[1, 2, 3]);
        assert!(!registry.is_set(AssetVariant::Simd));
    }

    #[test]
    fn test_snapshot() {
        let registry = AssetRegistry::new();
        registry.set(AssetVariant::Simd, vec![7u8]);

        let assets = registry.snapshot();
        assert!(assets.baseline.is_none());
        assert_eq!(assets.simd.unwrap().as_ref(), &[7]);
    }

    #[test]
    fn test_concurrent_writers_store_one_value() {
        let registry = Arc::new(AssetRegistry::new());

        let handles: Vec<_> = (0u8..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || registry.set(AssetVariant::Baseline, vec![i]))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|stored| *stored)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.get(AssetVariant::Baseline).unwrap().len(), 1);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&AssetRegistry::global(), &AssetRegistry::global()));
    }
}
