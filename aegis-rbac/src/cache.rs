//! Hook into the external authorization decision cache.
//!
//! The persistence core does not cache decisions itself, but every
//! successful mutation must flush whatever cache the API layer keeps.
//! The host registers an invalidator at startup; until then invalidation
//! is a no-op.

use std::sync::RwLock;

type Invalidator = Box<dyn Fn() + Send + Sync>;

static INVALIDATOR: RwLock<Option<Invalidator>> = RwLock::new(None);

/// Registers the callback invoked after every successful mutation.
/// Replaces any previously registered callback.
pub fn set_resource_cache_invalidator<F>(f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    *INVALIDATOR.write().expect("cache invalidator lock poisoned") = Some(Box::new(f));
}

/// Removes the registered callback.
pub fn clear_resource_cache_invalidator() {
    *INVALIDATOR.write().expect("cache invalidator lock poisoned") = None;
}

/// Invalidates the external decision cache, if a hook is registered.
pub(crate) fn invalidate_resource_cache() {
    if let Some(f) = INVALIDATOR.read().expect("cache invalidator lock poisoned").as_ref() {
        f();
    }
}
