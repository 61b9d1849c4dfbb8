//! Content-addressed shape cache
//!
//! Shapes are memoized by the [`HashKey`] of their expanded operator tree, so
//! an operator is rebuilt only when something in its dependency tree changed.
//! Entries never expire on their own; use [`CacheConfig::max_entries`] or
//! [`ShapeCache::clear`] to bound memory.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::document::{DocumentSnapshot, OperatorArgs, OperatorKind};
use crate::expand::{ExpandError, Expander};
use crate::hash::HashKey;

/// Cache errors
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Expansion failed: {0}")]
    Expand(#[from] ExpandError),

    #[error("Failed to hash operator tree: {0}")]
    Hash(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Builds the geometry of one operator
///
/// Returning `None` declines the build (for example on malformed
/// parameters); declined builds are not cached.
pub trait ShapeBuilder<S> {
    fn build(&self, kind: &OperatorKind, args: &OperatorArgs, doc: &DocumentSnapshot)
    -> Option<S>;
}

impl<S, F> ShapeBuilder<S> for F
where
    F: Fn(&OperatorArgs, &DocumentSnapshot) -> Option<S>,
{
    fn build(
        &self,
        _kind: &OperatorKind,
        args: &OperatorArgs,
        doc: &DocumentSnapshot,
    ) -> Option<S> {
        self(args, doc)
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Builds that produced a shape
    pub builds: u64,
    /// Builds that returned no shape
    pub declined: u64,
    pub evictions: u64,
}

struct CacheInner<S> {
    entries: HashMap<HashKey, S>,
    /// Insertion order, oldest first
    order: VecDeque<HashKey>,
    stats: CacheStats,
}

impl<S> Default for CacheInner<S> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }
}

impl<S> CacheInner<S> {
    fn evict_to(&mut self, max: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        self.stats.evictions += evicted as u64;
        evicted
    }
}

/// Memoizes built shapes by the content hash of their operator tree
///
/// All map access goes through one mutex. The lock is released while a
/// builder runs, so builders may call back into the cache; two callers
/// missing on the same key at once may both build, and the later insert
/// wins.
pub struct ShapeCache<S> {
    inner: Mutex<CacheInner<S>>,
    config: CacheConfig,
}

impl<S: Clone> Default for ShapeCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> ShapeCache<S> {
    /// Create an unbounded cache
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with the given configuration
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            config,
        }
    }

    /// The active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Compute the key an operator would be cached under
    pub fn key_for(
        &self,
        kind: &OperatorKind,
        args: &OperatorArgs,
        doc: &DocumentSnapshot,
    ) -> CacheResult<HashKey> {
        let tree = Expander::new(doc, self.config.missing_reference).expand(kind, args)?;
        HashKey::of(&tree).map_err(|e| CacheError::Hash(e.to_string()))
    }

    /// Return the cached shape for an operator, building it on a miss
    ///
    /// `Ok(None)` means the builder declined; nothing is stored and the next
    /// call retries the builder.
    pub fn get_or_build<B>(
        &self,
        kind: &OperatorKind,
        args: &OperatorArgs,
        doc: &DocumentSnapshot,
        builder: &B,
    ) -> CacheResult<Option<S>>
    where
        B: ShapeBuilder<S> + ?Sized,
    {
        let key = self.key_for(kind, args, doc)?;

        {
            let mut inner = self.inner.lock();
            if let Some(shape) = inner.entries.get(&key).cloned() {
                inner.stats.hits += 1;
                tracing::debug!("Shape cache hit for {} ({})", kind, key);
                return Ok(Some(shape));
            }
            inner.stats.misses += 1;
        }

        tracing::debug!("Shape cache miss for {} ({}), building", kind, key);
        let Some(shape) = builder.build(kind, args, doc) else {
            self.inner.lock().stats.declined += 1;
            tracing::warn!("Builder for {} produced no shape", kind);
            return Ok(None);
        };

        let mut inner = self.inner.lock();
        inner.stats.builds += 1;
        if inner.entries.insert(key, shape.clone()).is_none() {
            inner.order.push_back(key);
        }
        if let Some(max) = self.config.max_entries {
            inner.evict_to(max);
        }

        Ok(Some(shape))
    }

    /// Build a named document object through the cache
    pub fn get_or_build_object<B>(
        &self,
        name: &str,
        doc: &DocumentSnapshot,
        builder: &B,
    ) -> CacheResult<Option<S>>
    where
        B: ShapeBuilder<S> + ?Sized,
    {
        match doc.get(name) {
            Some(object) => self.get_or_build(&object.kind, &object.parameters, doc, builder),
            None => Ok(None),
        }
    }

    /// Look up a cached shape by key
    pub fn get(&self, key: &HashKey) -> Option<S> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Check if a key is cached
    pub fn contains(&self, key: &HashKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Number of cached shapes
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached shape
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Evict oldest entries until at most `max` remain, returning the count
    pub fn evict_to(&self, max: usize) -> usize {
        self.inner.lock().evict_to(max)
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentObject, ParamValue, args};
    use crate::expand::MissingReferencePolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scenario(tool_width: f64) -> DocumentSnapshot {
        [
            DocumentObject::new(
                "Box1",
                OperatorKind::Box,
                args([("Length", 10.0), ("Width", 10.0), ("Height", 10.0)]),
            ),
            DocumentObject::new(
                "Box2",
                OperatorKind::Box,
                args([("Length", 5.0), ("Width", tool_width), ("Height", 5.0)]),
            ),
            DocumentObject::new(
                "Cut1",
                OperatorKind::Cut,
                args([("Base", "Box1"), ("Tool", "Box2")]),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_second_call_does_not_rebuild() {
        let cache = ShapeCache::<String>::new();
        let doc = scenario(5.0);
        let calls = AtomicUsize::new(0);
        let cut_builder = |_: &OperatorArgs, _: &DocumentSnapshot| {
            calls.fetch_add(1, Ordering::SeqCst);
            Some("cut-solid".to_string())
        };
        let params = args([("Base", "Box1"), ("Tool", "Box2")]);

        let first = cache
            .get_or_build(&OperatorKind::Cut, &params, &doc, &cut_builder)
            .unwrap();
        let second = cache
            .get_or_build(&OperatorKind::Cut, &params, &doc, &cut_builder)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                builds: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_changed_dependency_rebuilds_with_new_key() {
        let cache = ShapeCache::<u32>::new();
        let calls = AtomicUsize::new(0);
        let cut_builder = |_: &OperatorArgs, _: &DocumentSnapshot| {
            Some(calls.fetch_add(1, Ordering::SeqCst) as u32)
        };
        let params = args([("Base", "Box1"), ("Tool", "Box2")]);

        let before = scenario(5.0);
        cache
            .get_or_build(&OperatorKind::Cut, &params, &before, &cut_builder)
            .unwrap();
        cache
            .get_or_build(&OperatorKind::Cut, &params, &before, &cut_builder)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let after = scenario(6.0);
        let rebuilt = cache
            .get_or_build(&OperatorKind::Cut, &params, &after, &cut_builder)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rebuilt, Some(1));
        assert_ne!(
            cache.key_for(&OperatorKind::Cut, &params, &before).unwrap(),
            cache.key_for(&OperatorKind::Cut, &params, &after).unwrap()
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_declined_build_is_retried() {
        let cache = ShapeCache::<u32>::new();
        let doc = scenario(5.0);
        let calls = AtomicUsize::new(0);
        let flaky = |_: &OperatorArgs, _: &DocumentSnapshot| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            (n > 0).then_some(7)
        };
        let params = args([("Radius", 1.0)]);

        assert_eq!(
            cache
                .get_or_build(&OperatorKind::Sphere, &params, &doc, &flaky)
                .unwrap(),
            None
        );
        assert!(cache.is_empty());
        assert_eq!(
            cache
                .get_or_build(&OperatorKind::Sphere, &params, &doc, &flaky)
                .unwrap(),
            Some(7)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().declined, 1);
    }

    #[test]
    fn test_fail_fast_surfaces_missing_reference() {
        let cache = ShapeCache::<u32>::with_config(CacheConfig {
            missing_reference: MissingReferencePolicy::FailFast,
            ..Default::default()
        });
        let doc = scenario(5.0);
        let params = args([("Base", "Box1"), ("Tool", "Nope")]);
        let never = |_: &OperatorArgs, _: &DocumentSnapshot| -> Option<u32> {
            panic!("builder must not run")
        };
        let err = cache
            .get_or_build(&OperatorKind::Cut, &params, &doc, &never)
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Expand(ExpandError::MissingReference { .. })
        ));
    }

    #[test]
    fn test_nan_and_null_do_not_share_a_slot() {
        let cache = ShapeCache::<u32>::new();
        let doc = DocumentSnapshot::new();
        let null = args([("Radius", ParamValue::Null)]);
        let nan = args([("Radius", f64::NAN)]);

        let sphere = |_: &OperatorArgs, _: &DocumentSnapshot| Some(1u32);

        let built = cache
            .get_or_build(&OperatorKind::Sphere, &null, &doc, &sphere)
            .unwrap();
        assert_eq!(built, Some(1));

        let never = |_: &OperatorArgs, _: &DocumentSnapshot| -> Option<u32> {
            panic!("builder must not run")
        };
        let err = cache
            .get_or_build(&OperatorKind::Sphere, &nan, &doc, &never)
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Expand(ExpandError::NonFiniteNumber(_))
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bounded_cache_evicts_oldest() {
        let cache = ShapeCache::<f64>::with_config(CacheConfig {
            max_entries: Some(2),
            ..Default::default()
        });
        let doc = DocumentSnapshot::new();
        let radius = |args: &OperatorArgs, _: &DocumentSnapshot| args["Radius"].as_f64();

        for r in [1.0, 2.0, 3.0] {
            cache
                .get_or_build(&OperatorKind::Sphere, &args([("Radius", r)]), &doc, &radius)
                .unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        let first = cache
            .key_for(&OperatorKind::Sphere, &args([("Radius", 1.0)]), &doc)
            .unwrap();
        let last = cache
            .key_for(&OperatorKind::Sphere, &args([("Radius", 3.0)]), &doc)
            .unwrap();
        assert!(!cache.contains(&first));
        assert_eq!(cache.get(&last), Some(3.0));
    }

    #[test]
    fn test_clear_and_manual_eviction() {
        let cache = ShapeCache::<f64>::new();
        let doc = DocumentSnapshot::new();
        let radius = |args: &OperatorArgs, _: &DocumentSnapshot| args["Radius"].as_f64();
        for r in [1.0, 2.0, 3.0, 4.0] {
            cache
                .get_or_build(&OperatorKind::Sphere, &args([("Radius", r)]), &doc, &radius)
                .unwrap();
        }
        assert_eq!(cache.evict_to(1), 3);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_builder_may_recurse_into_cache() {
        struct Recursive<'c> {
            cache: &'c ShapeCache<String>,
        }

        impl ShapeBuilder<String> for Recursive<'_> {
            fn build(
                &self,
                kind: &OperatorKind,
                args: &OperatorArgs,
                doc: &DocumentSnapshot,
            ) -> Option<String> {
                match kind {
                    OperatorKind::Cut => {
                        let base = args["Base"].as_str()?;
                        let tool = args["Tool"].as_str()?;
                        let base = self.cache.get_or_build_object(base, doc, self).ok()??;
                        let tool = self.cache.get_or_build_object(tool, doc, self).ok()??;
                        Some(format!("({} - {})", base, tool))
                    }
                    _ => Some(format!("box{}", args["Width"].as_f64()?)),
                }
            }
        }

        let cache = ShapeCache::new();
        let doc = scenario(5.0);
        let builder = Recursive { cache: &cache };
        let shape = cache.get_or_build_object("Cut1", &doc, &builder).unwrap();
        assert_eq!(shape.as_deref(), Some("(box10 - box5)"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_concurrent_builds_keep_map_consistent() {
        let cache = ShapeCache::<u64>::new();
        let doc = scenario(5.0);
        let params = args([("Base", "Box1"), ("Tool", "Box2")]);
        let builder = |_: &OperatorArgs, _: &DocumentSnapshot| Some(42u64);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let shape = cache
                            .get_or_build(&OperatorKind::Cut, &params, &doc, &builder)
                            .unwrap();
                        assert_eq!(shape, Some(42));
                    }
                });
            }
        });

        assert_eq!(cache.len(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 400);
        assert!(stats.builds >= 1);
    }
}
