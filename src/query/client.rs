// ============================================================================
// spark-reactive - Query Client
// Reactive keys on top of the resource cache
// ============================================================================
//
// A Query wraps a key function and a fetcher. The key function is evaluated
// inside a Computed; when the encoded key changes, the formula swaps in the
// cache entry for the new key (acquired through a fresh child scope of the
// query's owner) and only then releases the previous one. A driving effect
// reads that Computed so a key change takes effect even when nobody reads
// `data()`.
//
// With `stale_time`, the driver arms a timer after every successful fetch.
// The timer re-checks the current key before revalidating, so a timer armed
// under an old key never refreshes the new one.
// ============================================================================

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;

use crate::core::error::ReactiveError;
use crate::primitives::abort::AbortSignal;
use crate::primitives::computed::{computed, Computed};
use crate::primitives::effect::{effect_with_cleanup, CleanupFn, Effect};
use crate::primitives::scope::{get_current_scope, with_scope, Scope};
use crate::query::cache::{self, cached_resource, CacheOptions};
use crate::query::key::QueryKey;
use crate::query::mutation::{Mutation, MutationOptions};
use crate::reactivity::batching::untrack;
use crate::reactivity::scheduling::{clear_timeout, set_timeout};
use crate::resource::resource::{RefreshHandle, RefreshOptions, Resource, ResourceOptions};

// =============================================================================
// OPTIONS
// =============================================================================

/// Options for [`QueryClient::query`].
pub struct QueryOptions<T> {
    /// Cache TTL of the entries this query creates
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Revalidate in the background this long after each success
    pub stale_time: Option<Duration>,
    pub resource: ResourceOptions<T>,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            ttl: None,
            tags: Vec::new(),
            stale_time: None,
            resource: ResourceOptions::default(),
        }
    }
}

impl<T> QueryOptions<T> {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn initial(mut self, value: T) -> Self {
        self.resource.initial = Some(value);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T) + 'static) -> Self {
        self.resource = self.resource.on_success(callback);
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&ReactiveError) + 'static) -> Self {
        self.resource = self.resource.on_error(callback);
        self
    }
}

/// Defaults applied to every query of a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryDefaults {
    pub ttl: Option<Duration>,
    pub stale_time: Option<Duration>,
}

// =============================================================================
// QUERY<T>
// =============================================================================

type Current<T> = Result<(QueryKey, Resource<T>), ReactiveError>;

/// The cache entry a query currently serves.
struct Slot<T> {
    key: QueryKey,
    resource: Resource<T>,
    /// Holder scope of the entry; None when nothing holds it
    scope: Option<Scope>,
    /// Not in the cache: the query owns the resource
    uncached: bool,
}

impl<T: Clone + 'static> Slot<T> {
    fn release(self) {
        if let Some(scope) = self.scope {
            scope.dispose();
        }
        if self.uncached {
            self.resource.dispose();
        }
    }
}

struct QueryState<T> {
    current: Computed<Current<T>>,
    slot: Rc<RefCell<Option<Slot<T>>>>,
    driver: Effect,
}

/// A cached resource selected by a reactive key. Cloning yields another
/// handle to the same query.
pub struct Query<T> {
    state: Rc<QueryState<T>>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Query<T> {
    /// Latest data of the current key (tracked)
    pub fn data(&self) -> Option<T> {
        self.state.current.get().ok().and_then(|(_, resource)| resource.data())
    }

    pub fn loading(&self) -> bool {
        self.state
            .current
            .get()
            .is_ok_and(|(_, resource)| resource.loading())
    }

    pub fn fetching(&self) -> bool {
        self.state
            .current
            .get()
            .is_ok_and(|(_, resource)| resource.fetching())
    }

    /// Fetch error, or the error of encoding the current key
    pub fn error(&self) -> Option<ReactiveError> {
        match self.state.current.get() {
            Ok((_, resource)) => resource.error(),
            Err(err) => Some(err),
        }
    }

    /// Refresh the current key's resource.
    pub fn refresh(&self) -> RefreshHandle {
        match self.state.current.peek() {
            Ok((_, resource)) => resource.refresh(),
            Err(_) => RefreshHandle::ready(),
        }
    }

    pub fn refresh_with(&self, options: RefreshOptions) -> RefreshHandle {
        match self.state.current.peek() {
            Ok((_, resource)) => resource.refresh_with(options),
            Err(_) => RefreshHandle::ready(),
        }
    }

    /// Encoded current key (tracked)
    pub fn key(&self) -> Result<QueryKey, ReactiveError> {
        self.state.current.get().map(|(key, _)| key)
    }

    /// Resource of the current key (tracked)
    pub fn resource(&self) -> Option<Resource<T>> {
        self.state.current.get().ok().map(|(_, resource)| resource)
    }

    /// Stop the driver and release the current entry.
    pub fn dispose(&self) {
        self.state.driver.dispose();
        let slot = self.state.slot.borrow_mut().take();
        if let Some(slot) = slot {
            slot.release();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.driver.is_disposed()
    }
}

impl<T: std::fmt::Debug + Clone + 'static> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.state.slot.borrow();
        f.debug_struct("Query")
            .field("key", &slot.as_ref().map(|s| s.key.as_str().to_owned()))
            .field("resource", &slot.as_ref().map(|s| &s.resource))
            .finish()
    }
}

fn create_query<K, T, KF, F, Fut>(
    key_fn: KF,
    fetcher: F,
    cache_options: CacheOptions,
    stale_time: Option<Duration>,
    resource_options: ResourceOptions<T>,
) -> Query<T>
where
    K: Serialize + Clone + 'static,
    T: Clone + 'static,
    KF: Fn() -> K + 'static,
    F: Fn(K, AbortSignal) -> Fut + 'static,
    Fut: Future<Output = Result<T, ReactiveError>> + 'static,
{
    let owner = get_current_scope();
    let fetcher = Rc::new(fetcher);
    let slot: Rc<RefCell<Option<Slot<T>>>> = Rc::default();

    let formula_slot = slot.clone();
    let current = computed(move || -> Current<T> {
        let raw = key_fn();
        let key = QueryKey::encode(&raw)?;

        untrack(|| {
            if let Some(existing) = formula_slot.borrow().as_ref() {
                if existing.key == key {
                    return Ok((key.clone(), existing.resource.clone()));
                }
            }

            tracing::debug!(key = %key, "query key changed");
            let holder = owner
                .as_ref()
                .filter(|owner| !owner.is_disposed())
                .map(Scope::child_of);

            let fetcher = fetcher.clone();
            let build = || {
                cached_resource(
                    &key,
                    move |abort| fetcher(raw.clone(), abort),
                    cache_options.clone(),
                    resource_options.clone(),
                )
            };
            let resource = match &holder {
                Some(scope) => with_scope(scope, build),
                None => build(),
            };
            let resource = match resource {
                Ok(resource) => resource,
                Err(err) => {
                    if let Some(scope) = holder {
                        scope.dispose();
                    }
                    return Err(err);
                }
            };

            let uncached = holder.is_none() && !cache_options.persist;
            let previous = formula_slot.borrow_mut().replace(Slot {
                key: key.clone(),
                resource: resource.clone(),
                scope: holder,
                uncached,
            });
            if let Some(previous) = previous {
                previous.release();
            }
            Ok((key, resource))
        })
    });

    let driver_current = current.clone();
    let driver = effect_with_cleanup(move || {
        let (key, resource) = driver_current.get().ok()?;
        let stale_time = stale_time?;
        if resource.fetching() || resource.error().is_some() {
            return None;
        }

        let guard = driver_current.clone();
        let timer = set_timeout(stale_time, move || {
            let still_current = guard.peek().is_ok_and(|(current, _)| current == key);
            if still_current {
                tracing::debug!(key = %key, "stale time elapsed; revalidating");
                let _ = resource.refresh_with(RefreshOptions::background());
            }
        });
        Some(Box::new(move || clear_timeout(timer)) as CleanupFn)
    });

    Query {
        state: Rc::new(QueryState {
            current,
            slot,
            driver,
        }),
    }
}

// =============================================================================
// QUERY CLIENT
// =============================================================================

/// Entry point of the query layer: key encoding, queries, mutations and
/// cache invalidation.
///
/// # Example
///
/// ```
/// use spark_reactive::{create_scope, run_until_idle, signal, with_scope};
/// use spark_reactive::query::{create_query_client, QueryOptions};
///
/// let client = create_query_client();
/// let user_id = signal(1u32);
/// let scope = create_scope();
///
/// let user = with_scope(&scope, || {
///     let user_id = user_id.clone();
///     client.query(
///         move || ("user", user_id.get()),
///         |(_, id), _abort| async move {
///             Ok::<_, spark_reactive::ReactiveError>(format!("user-{id}"))
///         },
///         QueryOptions::default(),
///     )
/// });
/// run_until_idle();
/// assert_eq!(user.data().as_deref(), Some("user-1"));
///
/// user_id.set(2);
/// run_until_idle();
/// assert_eq!(user.data().as_deref(), Some("user-2"));
/// scope.dispose();
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryClient {
    defaults: QueryDefaults,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: QueryDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> QueryDefaults {
        self.defaults
    }

    /// Encode a key the way queries do.
    pub fn key<K: Serialize + ?Sized>(&self, key: &K) -> Result<QueryKey, ReactiveError> {
        QueryKey::encode(key)
    }

    /// A query whose cache entries are held by the current scope.
    pub fn query<K, T, KF, F, Fut>(
        &self,
        key: KF,
        fetcher: F,
        options: QueryOptions<T>,
    ) -> Query<T>
    where
        K: Serialize + Clone + 'static,
        T: Clone + 'static,
        KF: Fn() -> K + 'static,
        F: Fn(K, AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<T, ReactiveError>> + 'static,
    {
        self.build(key, fetcher, options, false)
    }

    /// A query whose cache entries persist after every holder is gone.
    pub fn query_global<K, T, KF, F, Fut>(
        &self,
        key: KF,
        fetcher: F,
        options: QueryOptions<T>,
    ) -> Query<T>
    where
        K: Serialize + Clone + 'static,
        T: Clone + 'static,
        KF: Fn() -> K + 'static,
        F: Fn(K, AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<T, ReactiveError>> + 'static,
    {
        self.build(key, fetcher, options, true)
    }

    fn build<K, T, KF, F, Fut>(
        &self,
        key: KF,
        fetcher: F,
        options: QueryOptions<T>,
        persist: bool,
    ) -> Query<T>
    where
        K: Serialize + Clone + 'static,
        T: Clone + 'static,
        KF: Fn() -> K + 'static,
        F: Fn(K, AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<T, ReactiveError>> + 'static,
    {
        let cache_options = CacheOptions {
            ttl: options.ttl.or(self.defaults.ttl),
            tags: options.tags,
            persist,
        };
        let stale_time = options.stale_time.or(self.defaults.stale_time);
        create_query(key, fetcher, cache_options, stale_time, options.resource)
    }

    /// Create a mutation.
    pub fn mutation<I, T, C, F, Fut>(
        &self,
        func: F,
        options: MutationOptions<I, T, C>,
    ) -> Mutation<I, T, C>
    where
        I: Clone + 'static,
        T: Clone + 'static,
        C: 'static,
        F: Fn(I, AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<T, ReactiveError>> + 'static,
    {
        Mutation::new(func, options)
    }

    pub fn invalidate_key<K: Serialize + ?Sized>(&self, key: &K) -> Result<usize, ReactiveError> {
        Ok(cache::invalidate_key(&QueryKey::encode(key)?))
    }

    pub fn invalidate_tag(&self, tag: &str) -> usize {
        cache::invalidate_tag(tag)
    }

    pub fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        cache::invalidate_tags(tags)
    }

    /// Drop the entry for `key`, whoever holds it.
    pub fn evict_key<K: Serialize + ?Sized>(&self, key: &K) -> Result<bool, ReactiveError> {
        Ok(cache::evict(&QueryKey::encode(key)?))
    }

    pub fn clear(&self) {
        cache::clear();
    }
}

/// Create a query client with default settings.
pub fn create_query_client() -> QueryClient {
    QueryClient::new()
}

// =============================================================================
// TESTS
// =============================================================================
