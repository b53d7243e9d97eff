// ============================================================================
// spark-reactive - Resource Cache
// Keyed, ref-counted resources with TTL, tags and LRU eviction
// ============================================================================
//
// Every entry owns a detached Scope that its resource lives in, so the fetch
// outlives whichever caller created it. Callers hold references through their
// own scope: the first acquisition from a scope registers one release hook on
// it, and disposing that scope drops all of its references at once.
//
// Entry lifetime:
// - ref_count 0 and not persisted: removed at once
// - persisted: survives scope teardown, evictable by LRU once unreferenced
// - TTL expiry is checked lazily on access, never by a timer
//
// Holders remember the generation of the entry they acquired, so releasing a
// reference to an entry that was since evicted and recreated is a no-op.
//
// Nothing that can run user code (resource construction, disposal, refresh)
// happens while the cache is borrowed.
// ============================================================================

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use crate::core::constants::DEFAULT_CACHE_MAX_ENTRIES;
use crate::core::error::ReactiveError;
use crate::core::types::NodeId;
use crate::primitives::abort::AbortSignal;
use crate::primitives::scope::{get_current_scope, with_scope, Scope};
use crate::query::key::QueryKey;
use crate::reactivity::scheduling::{now, spawn_local};
use crate::resource::resource::{create_resource, AnyResource, Resource, ResourceOptions};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Global cache limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Soft cap; only unreferenced entries are ever evicted to honor it
    pub max_entries: usize,
    /// TTL for entries created without one
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            default_ttl: None,
        }
    }
}

/// Replace the cache configuration for this thread.
pub fn configure_resource_cache(config: CacheConfig) {
    let victims = with_cache(|cache| {
        cache.config = config;
        cache.evict_lru(None)
    });
    dispose_all(victims);
}

pub fn resource_cache_config() -> CacheConfig {
    with_cache(|cache| cache.config)
}

/// Per-call cache options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Keep the entry after its last holder is gone
    pub persist: bool,
}

impl CacheOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }
}

// =============================================================================
// ENTRIES
// =============================================================================

pub(crate) struct CacheEntry {
    resource: Rc<dyn AnyResource>,
    scope: Scope,
    created_at: Duration,
    /// Base of the TTL check; reset on revalidation
    stored_at: Duration,
    last_used: Duration,
    ttl: Option<Duration>,
    tags: BTreeSet<String>,
    stale: bool,
    ref_count: usize,
    persist: bool,
    generation: u64,
}

impl CacheEntry {
    fn is_expired(&self, at: Duration) -> bool {
        self.ttl
            .is_some_and(|ttl| at.saturating_sub(self.stored_at) >= ttl)
    }
}

/// Snapshot of one entry, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub ref_count: usize,
    pub stale: bool,
    pub persist: bool,
    pub tags: Vec<String>,
    pub age: Duration,
    pub ttl: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct ResourceCache {
    entries: HashMap<QueryKey, CacheEntry>,
    tag_index: HashMap<String, HashSet<QueryKey>>,
    /// Scope -> keys it holds, with the generation it acquired
    holders: HashMap<NodeId, HashMap<QueryKey, u64>>,
    config: CacheConfig,
    next_generation: u64,
    warned_unscoped: bool,
}

impl ResourceCache {
    fn insert(&mut self, key: QueryKey, mut entry: CacheEntry) {
        self.next_generation += 1;
        entry.generation = self.next_generation;
        for tag in &entry.tags {
            self.tag_index.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &QueryKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn add_tags(&mut self, key: &QueryKey, tags: &[String]) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        for tag in tags {
            if entry.tags.insert(tag.clone()) {
                self.tag_index.entry(tag.clone()).or_default().insert(key.clone());
            }
        }
    }

    /// Record that `scope` holds `key`. Returns true when this is the first
    /// key the scope holds, meaning a release hook must be registered.
    fn acquire(&mut self, scope: NodeId, key: &QueryKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let first = !self.holders.contains_key(&scope);
        let held = self.holders.entry(scope).or_default();
        if held.get(key) != Some(&entry.generation) {
            held.insert(key.clone(), entry.generation);
            entry.ref_count += 1;
        }
        first
    }

    /// Drop every reference `scope` holds. Returns the entries to dispose.
    fn release(&mut self, scope: NodeId) -> Vec<CacheEntry> {
        let Some(held) = self.holders.remove(&scope) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for (key, generation) in held {
            let orphaned = match self.entries.get_mut(&key) {
                Some(entry) if entry.generation == generation => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    entry.ref_count == 0 && !entry.persist
                }
                _ => false,
            };
            if orphaned {
                tracing::debug!(key = %key, "last holder released cache entry");
                removed.extend(self.remove(&key));
            }
        }
        removed
    }

    /// Evict least recently used unreferenced entries until the cap holds.
    fn evict_lru(&mut self, keep: Option<&QueryKey>) -> Vec<CacheEntry> {
        let max = self.config.max_entries;
        if self.entries.len() <= max {
            return Vec::new();
        }

        let mut candidates: Vec<(Duration, QueryKey)> = self
            .entries
            .iter()
            .filter(|(key, entry)| entry.ref_count == 0 && Some(*key) != keep)
            .map(|(key, entry)| (entry.last_used, key.clone()))
            .collect();
        candidates.sort();

        let mut evicted = Vec::new();
        for (_, key) in candidates {
            if self.entries.len() <= max {
                break;
            }
            tracing::debug!(key = %key, "evicting least recently used cache entry");
            evicted.extend(self.remove(&key));
        }

        if self.entries.len() > max {
            tracing::warn!(
                entries = self.entries.len(),
                max_entries = max,
                "resource cache over capacity; every remaining entry is referenced"
            );
        }
        evicted
    }
}

thread_local! {
    static CACHE: RefCell<ResourceCache> = RefCell::new(ResourceCache::default());
}

fn with_cache<R>(f: impl FnOnce(&mut ResourceCache) -> R) -> R {
    CACHE.with(|cache| f(&mut cache.borrow_mut()))
}

fn dispose_all(entries: Vec<CacheEntry>) {
    for entry in entries {
        entry.scope.dispose();
    }
}

fn release_scope(scope: NodeId) {
    let removed = CACHE.try_with(|cache| cache.borrow_mut().release(scope));
    if let Ok(removed) = removed {
        dispose_all(removed);
    }
}

/// Register `owner`'s reference to `key`, hooking its disposal on first use.
fn hold(owner: &Scope, key: &QueryKey) {
    let id = owner.id();
    if with_cache(|cache| cache.acquire(id, key)) {
        owner.on_cleanup(move || release_scope(id));
    }
}

fn revalidate_in_background(key: QueryKey, resource: Rc<dyn AnyResource>, generation: u64) {
    let handle = resource.revalidate();
    spawn_local(async move {
        handle.await;
        let _ = CACHE.try_with(|cache| {
            if let Some(entry) = cache.borrow_mut().entries.get_mut(&key) {
                if entry.generation == generation {
                    entry.stale = false;
                }
            }
        });
    });
}

// =============================================================================
// PUBLIC API
// =============================================================================

enum Lookup<T> {
    Hit {
        resource: Resource<T>,
        revalidate: Option<(Rc<dyn AnyResource>, u64)>,
    },
    Miss {
        expired: Option<CacheEntry>,
    },
}

/// Get or create the resource cached under `key`.
///
/// The calling scope becomes a holder of the entry. Without a current scope
/// and without `persist`, nothing is cached: a plain resource is returned and
/// a warning is logged once per thread.
///
/// An expired entry is recreated when nobody holds it. A held expired entry
/// is marked stale and revalidated in the background while still being
/// served.
///
/// Fails with `KeyTypeMismatch` when `key` already maps to a resource of
/// another value type.
pub fn cached_resource<T, F, Fut>(
    key: &QueryKey,
    fetcher: F,
    cache_options: CacheOptions,
    options: ResourceOptions<T>,
) -> Result<Resource<T>, ReactiveError>
where
    T: Clone + 'static,
    F: Fn(AbortSignal) -> Fut + 'static,
    Fut: Future<Output = Result<T, ReactiveError>> + 'static,
{
    let owner = get_current_scope().filter(|scope| !scope.is_disposed());

    if owner.is_none() && !cache_options.persist {
        let first = with_cache(|cache| !std::mem::replace(&mut cache.warned_unscoped, true));
        if first {
            tracing::warn!(
                key = %key,
                "cached resource requested outside any scope without persist; caching skipped"
            );
        }
        return Ok(create_resource(fetcher, options));
    }

    let at = now();
    let lookup = with_cache(|cache| -> Result<Lookup<T>, ReactiveError> {
        let Some(entry) = cache.entries.get_mut(key) else {
            return Ok(Lookup::Miss { expired: None });
        };

        if entry.resource.is_disposed() {
            tracing::debug!(key = %key, "disposed cache entry recreated");
            return Ok(Lookup::Miss {
                expired: cache.remove(key),
            });
        }

        let bound = entry.resource.as_any().downcast_ref::<Resource<T>>().cloned();
        let Some(resource) = bound else {
            let bound = entry.resource.value_type();
            tracing::debug!(key = %key, bound, "cache key type mismatch");
            return Err(ReactiveError::KeyTypeMismatch {
                key: key.to_string(),
            });
        };

        let expired = entry.is_expired(at);
        if expired && entry.ref_count == 0 {
            tracing::debug!(key = %key, "expired unreferenced cache entry recreated");
            return Ok(Lookup::Miss {
                expired: cache.remove(key),
            });
        }

        let mut revalidate = None;
        if expired {
            tracing::debug!(key = %key, "expired cache entry revalidating in place");
            entry.stale = true;
            entry.stored_at = at;
            revalidate = Some((entry.resource.clone(), entry.generation));
        }

        entry.last_used = at;
        entry.persist |= cache_options.persist;
        if let Some(ttl) = cache_options.ttl {
            entry.ttl = Some(ttl);
        }
        cache.add_tags(key, &cache_options.tags);
        tracing::trace!(key = %key, "cache hit");
        Ok(Lookup::Hit { resource, revalidate })
    })?;

    let resource = match lookup {
        Lookup::Hit { resource, revalidate } => {
            if let Some((erased, generation)) = revalidate {
                revalidate_in_background(key.clone(), erased, generation);
            }
            resource
        }
        Lookup::Miss { expired } => {
            if let Some(old) = expired {
                old.scope.dispose();
            }

            tracing::trace!(key = %key, "cache miss");
            let scope = Scope::detached();
            let resource = with_scope(&scope, || create_resource(fetcher, options));
            let default_ttl = resource_cache_config().default_ttl;
            let entry = CacheEntry {
                resource: Rc::new(resource.clone()),
                scope,
                created_at: at,
                stored_at: at,
                last_used: at,
                ttl: cache_options.ttl.or(default_ttl),
                tags: cache_options.tags.iter().cloned().collect(),
                stale: false,
                ref_count: 0,
                persist: cache_options.persist,
                generation: 0,
            };

            let replaced = with_cache(|cache| {
                let replaced = cache.remove(key);
                cache.insert(key.clone(), entry);
                replaced
            });
            if let Some(replaced) = replaced {
                replaced.scope.dispose();
            }
            resource
        }
    };

    if let Some(owner) = &owner {
        hold(owner, key);
    }

    let victims = with_cache(|cache| cache.evict_lru(Some(key)));
    dispose_all(victims);

    Ok(resource)
}

/// Mark the entry stale and refetch it in the background. Returns how many
/// entries were invalidated (0 or 1).
pub fn invalidate_key(key: &QueryKey) -> usize {
    invalidate_keys(std::iter::once(key.clone()))
}

/// Invalidate every entry tagged with `tag`.
pub fn invalidate_tag(tag: &str) -> usize {
    invalidate_tags(&[tag])
}

/// Invalidate every entry carrying any of `tags`. Each entry is refetched
/// once even if it carries several of them.
pub fn invalidate_tags<S: AsRef<str>>(tags: &[S]) -> usize {
    let keys: BTreeSet<QueryKey> = with_cache(|cache| {
        tags.iter()
            .filter_map(|tag| cache.tag_index.get(tag.as_ref()))
            .flatten()
            .cloned()
            .collect()
    });
    invalidate_keys(keys)
}

fn invalidate_keys(keys: impl IntoIterator<Item = QueryKey>) -> usize {
    let targets: Vec<(QueryKey, Rc<dyn AnyResource>, u64)> = with_cache(|cache| {
        keys.into_iter()
            .filter_map(|key| {
                let entry = cache.entries.get_mut(&key)?;
                entry.stale = true;
                Some((key, entry.resource.clone(), entry.generation))
            })
            .collect()
    });

    let count = targets.len();
    for (key, resource, generation) in targets {
        tracing::debug!(key = %key, "cache entry invalidated");
        revalidate_in_background(key, resource, generation);
    }
    count
}

/// Remove an entry now, whoever holds it. Its resource is disposed.
pub fn evict(key: &QueryKey) -> bool {
    let removed = with_cache(|cache| cache.remove(key));
    let found = removed.is_some();
    dispose_all(removed.into_iter().collect());
    found
}

/// Remove every entry.
pub fn clear() {
    let removed: Vec<CacheEntry> = with_cache(|cache| {
        cache.tag_index.clear();
        cache.holders.clear();
        cache.entries.drain().map(|(_, entry)| entry).collect()
    });
    tracing::debug!(entries = removed.len(), "resource cache cleared");
    dispose_all(removed);
}

/// Number of live entries.
pub fn len() -> usize {
    with_cache(|cache| cache.entries.len())
}

pub fn is_empty() -> bool {
    len() == 0
}

pub fn contains(key: &QueryKey) -> bool {
    with_cache(|cache| cache.entries.contains_key(key))
}

pub fn entry_info(key: &QueryKey) -> Option<CacheEntryInfo> {
    let at = now();
    with_cache(|cache| {
        cache.entries.get(key).map(|entry| CacheEntryInfo {
            ref_count: entry.ref_count,
            stale: entry.stale,
            persist: entry.persist,
            tags: entry.tags.iter().cloned().collect(),
            age: at.saturating_sub(entry.created_at),
            ttl: entry.ttl,
        })
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::scope::create_scope;
    use crate::reactivity::scheduling::{advance_time, run_until_idle, use_manual_clock};
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::future::Ready;
    use std::io;
    use std::sync::{Arc, Mutex};

    type Fetch = Ready<Result<u32, ReactiveError>>;

    fn counting(calls: &Rc<Cell<u32>>) -> impl Fn(AbortSignal) -> Fetch + 'static {
        let calls = calls.clone();
        move |_abort| {
            calls.set(calls.get() + 1);
            std::future::ready(Ok(calls.get()))
        }
    }

    fn key(name: &str) -> QueryKey {
        QueryKey::encode(&name).unwrap()
    }

    fn cached(name: &str, calls: &Rc<Cell<u32>>, options: CacheOptions) -> Resource<u32> {
        cached_resource(&key(name), counting(calls), options, ResourceOptions::default()).unwrap()
    }

    fn cached_in(scope: &Scope, name: &str, calls: &Rc<Cell<u32>>) -> Resource<u32> {
        with_scope(scope, || cached(name, calls, CacheOptions::default()))
    }

    /// Log sink shared with a `tracing-subscriber` fmt layer.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(mut sink) = self.0.lock() {
                sink.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn same_key_in_two_scopes_shares_one_resource() {
        let calls = Rc::new(Cell::new(0));
        let (a, b) = (create_scope(), create_scope());

        let ra = cached_in(&a, "user", &calls);
        let rb = cached_in(&b, "user", &calls);
        run_until_idle();

        assert!(ra.ptr_eq(&rb));
        assert_eq!(calls.get(), 1);
        assert_eq!(entry_info(&key("user")).map(|i| i.ref_count), Some(2));

        a.dispose();
        assert_eq!(entry_info(&key("user")).map(|i| i.ref_count), Some(1));
        assert!(!rb.is_disposed());

        b.dispose();
        assert!(!contains(&key("user")));
        assert!(rb.is_disposed());
    }

    #[test]
    fn one_scope_counts_once() {
        let calls = Rc::new(Cell::new(0));
        let scope = create_scope();
        for _ in 0..3 {
            cached_in(&scope, "k", &calls);
        }
        assert_eq!(entry_info(&key("k")).map(|i| i.ref_count), Some(1));
        scope.dispose();
        assert!(is_empty());
    }

    #[test]
    fn unscoped_call_is_not_cached() {
        let calls = Rc::new(Cell::new(0));
        let first = cached("loose", &calls, CacheOptions::default());
        let second = cached("loose", &calls, CacheOptions::default());
        run_until_idle();

        assert!(!first.ptr_eq(&second));
        assert_eq!(calls.get(), 2);
        assert_eq!(len(), 0);
    }

    #[test]
    fn unscoped_warning_is_logged_once() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let calls = Rc::new(Cell::new(0));
        tracing::subscriber::with_default(subscriber, || {
            for name in ["a", "b", "a"] {
                cached(name, &calls, CacheOptions::default());
            }
        });

        assert_eq!(calls.get(), 3);
        assert_eq!(captured.text().matches("caching skipped").count(), 1);
    }

    #[test]
    fn persisted_entry_outlives_its_scope() {
        let calls = Rc::new(Cell::new(0));
        let scope = create_scope();
        let options = CacheOptions::default().persist();
        let first = with_scope(&scope, || cached("settings", &calls, options.clone()));
        scope.dispose();

        assert!(contains(&key("settings")));
        let again = cached("settings", &calls, options);
        assert!(first.ptr_eq(&again));

        assert!(evict(&key("settings")));
        assert!(first.is_disposed());
    }

    #[test]
    fn disposed_entry_is_recreated() {
        let calls = Rc::new(Cell::new(0));
        let (a, b) = (create_scope(), create_scope());

        let first = cached_in(&a, "profile", &calls);
        run_until_idle();
        first.dispose();

        let second = cached_in(&b, "profile", &calls);
        run_until_idle();

        assert!(!first.ptr_eq(&second));
        assert!(!second.is_disposed());
        assert_eq!(calls.get(), 2);
        assert_eq!(second.data(), Some(2));
        assert_eq!(entry_info(&key("profile")).map(|i| i.ref_count), Some(1));

        // The stale hold from `a` no longer counts
        a.dispose();
        assert!(contains(&key("profile")));
        b.dispose();
        assert!(!contains(&key("profile")));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let scope = create_scope();
        with_scope(&scope, || {
            let fetch = |_abort: AbortSignal| async { Ok::<_, ReactiveError>(1u32) };
            let options = ResourceOptions::default();
            cached_resource(&key("dual"), fetch, CacheOptions::default(), options).unwrap();
            let err = cached_resource(
                &key("dual"),
                |_abort| async { Ok(String::from("x")) },
                CacheOptions::default(),
                ResourceOptions::default(),
            )
            .unwrap_err();
            assert_eq!(
                err,
                ReactiveError::KeyTypeMismatch {
                    key: key("dual").to_string()
                }
            );
        });
        scope.dispose();
    }

    #[test]
    fn expired_unreferenced_entry_is_recreated() {
        use_manual_clock();
        let calls = Rc::new(Cell::new(0));
        let options = CacheOptions::default().ttl(Duration::from_millis(100)).persist();

        let first = cached("ttl", &calls, options.clone());
        run_until_idle();
        advance_time(Duration::from_millis(150));

        let second = cached("ttl", &calls, options);
        run_until_idle();

        assert!(!first.ptr_eq(&second));
        assert!(first.is_disposed());
        assert_eq!(calls.get(), 2);
        assert_eq!(second.data(), Some(2));
    }

    #[test]
    fn expired_referenced_entry_revalidates_in_place() {
        use_manual_clock();
        let calls = Rc::new(Cell::new(0));
        let options = CacheOptions::default().ttl(Duration::from_millis(100));
        let (a, b) = (create_scope(), create_scope());

        let first = with_scope(&a, || cached("swr", &calls, options.clone()));
        run_until_idle();
        assert_eq!(first.data(), Some(1));
        advance_time(Duration::from_millis(150));

        let second = with_scope(&b, || cached("swr", &calls, options));
        assert!(first.ptr_eq(&second));
        assert_eq!(entry_info(&key("swr")).map(|i| i.stale), Some(true));
        assert!(!second.loading(), "revalidation runs in the background");

        run_until_idle();
        assert_eq!(calls.get(), 2);
        assert_eq!(second.data(), Some(2));
        assert_eq!(entry_info(&key("swr")).map(|i| i.stale), Some(false));

        a.dispose();
        b.dispose();
    }

    #[test]
    fn tags_invalidate_matching_entries() {
        let calls = Rc::new(Cell::new(0));
        let scope = create_scope();
        with_scope(&scope, || {
            cached("a", &calls, CacheOptions::default().tag("todos"));
            cached("b", &calls, CacheOptions::default().tag("todos").tag("user"));
            cached("c", &calls, CacheOptions::default().tag("user"));
        });
        run_until_idle();
        assert_eq!(calls.get(), 3);

        assert_eq!(invalidate_tag("todos"), 2);
        run_until_idle();
        assert_eq!(calls.get(), 5);

        assert_eq!(invalidate_tags(&["todos", "user"]), 3);
        run_until_idle();
        assert_eq!(calls.get(), 8);

        assert_eq!(invalidate_key(&key("missing")), 0);
        assert_eq!(
            entry_info(&key("b")).map(|i| i.tags),
            Some(vec![String::from("todos"), String::from("user")])
        );
        scope.dispose();
    }

    #[test]
    fn lru_evicts_only_unreferenced_entries() {
        use_manual_clock();
        configure_resource_cache(CacheConfig {
            max_entries: 2,
            default_ttl: None,
        });
        let calls = Rc::new(Cell::new(0));
        let persisted = CacheOptions::default().persist();

        cached("old", &calls, persisted.clone());
        advance_time(Duration::from_millis(10));
        cached("newer", &calls, persisted);
        advance_time(Duration::from_millis(10));

        let scope = create_scope();
        cached_in(&scope, "held", &calls);

        assert_eq!(len(), 2);
        assert!(!contains(&key("old")));
        assert!(contains(&key("newer")));
        assert!(contains(&key("held")));

        scope.dispose();
        clear();
        assert!(is_empty());
    }
}
