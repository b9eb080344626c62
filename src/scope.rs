//! Hierarchical scopes
//!
//! A scope tree is owned top-down: each node owns its children, and a child
//! keeps only a weak link to its parent, used for the lookup search and
//! never for lifetime. [`Scope`] is the cheap, cloneable handle callers use.
//!
//! A subscope whose handles are all dropped, and which has no live
//! descendants, is detached from its parent and freed without running
//! disposers. Use [`Scope::dispose`] for an orderly teardown.

use crate::context::ConstructionContext;
use crate::factory::{ErasedInstance, FactoryFilter};
use crate::provider::{Binding, DEFAULT_CLASSIFIER, Injectable};
use crate::registry::FactoryRegistry;
use crate::resolver::Accessor;
use crate::storage::{CacheEntry, NodeCache, Resolved};
use crate::{DiError, Result};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

#[cfg(feature = "logging")]
use tracing::debug;

/// Unique scope identifier.
///
/// Each scope gets a unique ID for tracking and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Generate a new unique scope ID.
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// One level of the tree
pub(crate) struct ScopeNode {
    id: ScopeId,
    depth: u32,
    parent: Weak<ScopeNode>,
    children: Mutex<Vec<Arc<ScopeNode>>>,
    cache: NodeCache,
    registry: Arc<FactoryRegistry>,
    disposed: AtomicBool,
    /// Live `Scope` handles pointing at this node
    handles: AtomicUsize,
}

impl ScopeNode {
    fn new(
        depth: u32,
        parent: Weak<ScopeNode>,
        registry: Arc<FactoryRegistry>,
        capacity: usize,
    ) -> Self {
        Self {
            id: ScopeId::new(),
            depth,
            parent,
            children: Mutex::new(Vec::new()),
            cache: NodeCache::with_capacity(capacity),
            registry,
            disposed: AtomicBool::new(false),
            handles: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    #[inline]
    pub fn registry(&self) -> &FactoryRegistry {
        &self.registry
    }

    #[inline]
    pub fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DiError::ScopeDisposed {
                scope: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// Parent node, `None` for the root
    fn parent_node(&self) -> Result<Option<Arc<ScopeNode>>> {
        if self.depth == 0 {
            return Ok(None);
        }
        self.parent.upgrade().map(Some).ok_or(DiError::ParentDropped)
    }

    fn children(&self) -> MutexGuard<'_, Vec<Arc<ScopeNode>>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Search this node, then each ancestor. The first hit wins.
    pub fn lookup(&self, binding: &Binding) -> Result<Option<Resolved>> {
        if let Some(hit) = self.cache.get(binding) {
            return Ok(Some(hit));
        }

        let mut current = self.parent_node()?;
        while let Some(node) = current {
            if let Some(hit) = node.cache.get(binding) {
                return Ok(Some(hit));
            }
            current = node.parent_node()?;
        }

        Ok(None)
    }

    /// Detach this node, then each ancestor, while it has no handles and no
    /// children left.
    ///
    /// Takes the parent's lock before the child's.
    fn release_if_unused(self: &Arc<Self>) {
        let mut node = Arc::clone(self);
        loop {
            if node.disposed.load(Ordering::Acquire) {
                return;
            }
            let Some(parent) = node.parent.upgrade() else {
                return;
            };

            {
                let mut siblings = parent.children();
                if node.handles.load(Ordering::Acquire) != 0 || !node.children().is_empty() {
                    return;
                }
                siblings.retain(|c| !Arc::ptr_eq(c, &node));
            }

            #[cfg(feature = "logging")]
            debug!(
                target: "scope_injector",
                scope = %node.id,
                depth = node.depth,
                instances = node.cache.len(),
                "Releasing unreferenced subscope"
            );

            if parent.handles.load(Ordering::Acquire) != 0 {
                return;
            }
            node = parent;
        }
    }

    /// This node or the ancestor at `depth`
    pub fn ancestor_at(self: &Arc<Self>, depth: u32) -> Result<Arc<ScopeNode>> {
        let mut node = Arc::clone(self);
        while node.depth > depth {
            node = node.parent_node()?.ok_or(DiError::ParentDropped)?;
        }
        Ok(node)
    }
}

/// Handle to a node of the scope tree.
///
/// # Examples
///
/// ```rust
/// use scope_injector::{FactoryDescriptor, FactoryRegistry, Scope};
///
/// struct AppConfig { name: String }
/// struct RequestId(u64);
/// struct Handler { app: String, request: u64 }
///
/// let mut builder = FactoryRegistry::builder();
/// builder
///     .register(FactoryDescriptor::topmost(|scope| {
///         let app = scope.get::<AppConfig>()?;
///         let request = scope.get::<RequestId>()?;
///         Ok(Handler { app: app.name.clone(), request: request.0 })
///     }))
///     .unwrap();
///
/// let root = Scope::root(builder.build());
/// root.bind(AppConfig { name: "shop".into() });
///
/// let request = root.create_subscope();
/// request.bind(RequestId(7));
///
/// let handler = request.get::<Handler>().unwrap();
/// assert_eq!((handler.app.as_str(), handler.request), ("shop", 7));
///
/// // The handler needed a request-level dependency, so it lives in the request scope
/// assert!(request.cached_locally::<Handler>("").is_some());
/// assert!(root.get::<Handler>().is_err());
/// ```
pub struct Scope {
    node: Arc<ScopeNode>,
}

impl Scope {
    /// Create the root of a new scope tree.
    #[inline]
    pub fn root(registry: impl Into<Arc<FactoryRegistry>>) -> Self {
        Self::root_with_capacity(registry, 0)
    }

    /// Create a root whose cache is pre-sized for `capacity` instances.
    pub fn root_with_capacity(registry: impl Into<Arc<FactoryRegistry>>, capacity: usize) -> Self {
        let registry = registry.into();
        let node = ScopeNode::new(0, Weak::new(), registry, capacity);

        #[cfg(feature = "logging")]
        debug!(
            target: "scope_injector",
            scope = %node.id,
            depth = 0,
            descriptors = node.registry.len(),
            "Creating root scope"
        );

        Self::from_node(Arc::new(node))
    }

    /// Every handle is made here, keeping the handle count exact
    #[inline]
    pub(crate) fn from_node(node: Arc<ScopeNode>) -> Self {
        node.handles.fetch_add(1, Ordering::Relaxed);
        Self { node }
    }

    /// Create a child scope, owned by this one.
    ///
    /// # Panics
    ///
    /// Panics if this scope has been disposed.
    pub fn create_subscope(&self) -> Scope {
        self.check_not_disposed();

        let child = Arc::new(ScopeNode::new(
            self.node.depth + 1,
            Arc::downgrade(&self.node),
            Arc::clone(&self.node.registry),
            0,
        ));

        #[cfg(feature = "logging")]
        debug!(
            target: "scope_injector",
            scope = %child.id,
            parent = %self.node.id,
            depth = child.depth,
            parent_instances = self.node.cache.len(),
            "Creating subscope"
        );

        self.node.children().push(Arc::clone(&child));
        Self::from_node(child)
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Place an externally supplied instance directly in this scope.
    ///
    /// Bypasses the registry and any scoping policy, and overwrites an
    /// existing entry. If the replaced entry was constructed from a
    /// descriptor with a disposer, that disposer runs now. Seeded instances
    /// have no disposer.
    ///
    /// # Panics
    ///
    /// Panics if this scope has been disposed.
    #[inline]
    pub fn bind<T: Injectable>(&self, instance: T) -> &Self {
        self.bind_arc(DEFAULT_CLASSIFIER, Arc::new(instance))
    }

    /// [`bind`](Self::bind) under a classifier.
    #[inline]
    pub fn bind_classified<T: Injectable>(&self, classifier: &str, instance: T) -> &Self {
        self.bind_arc(classifier, Arc::new(instance))
    }

    /// [`bind`](Self::bind) an instance that is already shared.
    pub fn bind_arc<T: Injectable>(&self, classifier: &str, instance: Arc<T>) -> &Self {
        self.check_not_disposed();

        #[cfg(feature = "logging")]
        debug!(
            target: "scope_injector",
            service = std::any::type_name::<T>(),
            classifier = classifier,
            scope = %self.node.id,
            depth = self.node.depth,
            "Binding instance into scope"
        );

        let replaced = self.node.cache.insert(
            Binding::of::<T>(classifier),
            instance as ErasedInstance,
            self.node.depth,
            None,
        );
        if let Some(CacheEntry {
            instance,
            disposer: Some(disposer),
            ..
        }) = replaced
        {
            disposer(instance.as_ref());
        }
        self
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve `T` under `classifier`.
    ///
    /// Fails with [`DiError::NotFound`] when neither a cached entry on the
    /// scope chain nor a registry descriptor provides it.
    #[inline]
    pub fn get_single<T: Injectable>(&self, classifier: &str) -> Result<Arc<T>> {
        self.with_accessor(|a| a.get_single::<T>(classifier))
    }

    /// Resolve `T` under the default classifier.
    #[inline]
    pub fn get<T: Injectable>(&self) -> Result<Arc<T>> {
        self.get_single::<T>(DEFAULT_CLASSIFIER)
    }

    /// Resolve `T`, only considering descriptors that pass `filter`.
    #[inline]
    pub fn get_single_filtered<T: Injectable>(
        &self,
        classifier: &str,
        filter: &FactoryFilter,
    ) -> Result<Arc<T>> {
        self.with_accessor(|a| a.get_single_filtered::<T>(classifier, filter))
    }

    /// Resolve `T`, returning `None` when nothing provides it.
    #[inline]
    pub fn get_optional<T: Injectable>(&self, classifier: &str) -> Result<Option<Arc<T>>> {
        self.with_accessor(|a| a.get_optional::<T>(classifier))
    }

    /// All registered `T` in registration order.
    #[inline]
    pub fn get_many<T: Injectable>(&self) -> Result<Vec<Arc<T>>> {
        self.with_accessor(|a| a.get_many::<T>())
    }

    /// All registered `T` under `classifier`.
    #[inline]
    pub fn get_many_classified<T: Injectable>(&self, classifier: &str) -> Result<Vec<Arc<T>>> {
        self.with_accessor(|a| a.get_many_classified::<T>(classifier))
    }

    /// All registered `T` passing `filter`.
    #[inline]
    pub fn get_many_filtered<T: Injectable>(
        &self,
        classifier: Option<&str>,
        filter: &FactoryFilter,
    ) -> Result<Vec<Arc<T>>> {
        self.with_accessor(|a| a.get_many_filtered::<T>(classifier, filter))
    }

    /// Whether the lookup search would find a cached `T` without constructing.
    pub fn is_cached<T: Injectable>(&self, classifier: &str) -> bool {
        matches!(self.node.lookup(&Binding::of::<T>(classifier)), Ok(Some(_)))
    }

    /// The `T` cached in this very scope, ignoring ancestors and the registry.
    pub fn cached_locally<T: Injectable>(&self, classifier: &str) -> Option<Arc<T>> {
        self.node
            .cache
            .get(&Binding::of::<T>(classifier))
            .and_then(|hit| hit.instance.downcast::<T>().ok())
    }

    /// Run `f` with an accessor for a fresh top-level resolution
    fn with_accessor<R>(&self, f: impl FnOnce(&Accessor<'_>) -> R) -> R {
        let context = RefCell::new(ConstructionContext::new());
        f(&Accessor::new(&self.node, &context))
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    #[inline]
    pub fn id(&self) -> ScopeId {
        self.node.id
    }

    /// Get the scope depth (0 = root).
    #[inline]
    pub fn depth(&self) -> u32 {
        self.node.depth
    }

    /// Handle to the parent scope, if this is not the root and it is still alive
    pub fn parent(&self) -> Option<Scope> {
        self.node.parent.upgrade().map(Self::from_node)
    }

    /// Number of attached child scopes.
    ///
    /// A child stays attached until it is disposed, or until its handles
    /// and those of all its descendants are dropped.
    pub fn child_count(&self) -> usize {
        self.node.children().len()
    }

    /// Number of instances cached in this scope (not including ancestors).
    #[inline]
    pub fn len(&self) -> usize {
        self.node.cache.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node.cache.is_empty()
    }

    #[inline]
    pub fn registry(&self) -> &FactoryRegistry {
        &self.node.registry
    }

    /// Whether both handles point at the same scope
    #[inline]
    pub fn same_scope(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    // =========================================================================
    // Lifecycle Methods
    // =========================================================================

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.node.disposed.load(Ordering::Acquire)
    }

    /// Tear down this scope and everything below it.
    ///
    /// Children are disposed first, newest first. Then this scope's cached
    /// instances are dropped newest first, running each descriptor's
    /// disposer. Finally the scope detaches from its parent. Calling it again
    /// does nothing.
    pub fn dispose(&self) {
        if self.node.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let children = std::mem::take(&mut *self.node.children());
        for child in children.into_iter().rev() {
            Self::from_node(child).dispose();
        }

        let entries = self.node.cache.drain_newest_first();

        #[cfg(feature = "logging")]
        debug!(
            target: "scope_injector",
            scope = %self.node.id,
            depth = self.node.depth,
            instances = entries.len(),
            "Disposing scope"
        );

        for (_binding, entry) in entries {
            if let Some(disposer) = &entry.disposer {
                disposer(entry.instance.as_ref());
            }
        }

        if let Some(parent) = self.node.parent.upgrade() {
            parent.children().retain(|c| !Arc::ptr_eq(c, &self.node));
        }
    }

    /// Panic if disposed (internal helper).
    #[inline]
    fn check_not_disposed(&self) {
        if self.is_disposed() {
            panic!("Cannot modify scope: {} has been disposed", self.node.id);
        }
    }
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Self::from_node(Arc::clone(&self.node))
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.node.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.node.release_if_unused();
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.node.id)
            .field("depth", &self.node.depth)
            .field("instances", &self.node.cache.len())
            .field("children", &self.child_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FactoryDescriptor;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct GlobalService;

    #[derive(Debug)]
    struct RequestService {
        id: String,
    }

    fn empty_root() -> Scope {
        Scope::root(FactoryRegistry::empty())
    }

    #[test]
    fn test_subscope_depth() {
        let root = empty_root();
        let child = root.create_subscope();
        let grandchild = child.create_subscope();

        assert_eq!(root.depth(), 0);
        assert_eq!(child.depth(), 1);
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(root.child_count(), 1);
        assert!(grandchild.parent().unwrap().same_scope(&child));
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_bound_instances_visible_downward_only() {
        let root = empty_root();
        root.bind(GlobalService);

        let scoped = root.create_subscope();
        scoped.bind(RequestService { id: "req-1".into() });

        assert!(scoped.get::<GlobalService>().is_ok());
        assert_eq!(scoped.get::<RequestService>().unwrap().id, "req-1");
        assert!(root.get::<RequestService>().unwrap_err().is_not_found());
    }

    #[test]
    fn test_siblings_do_not_share() {
        let root = empty_root();
        let left = root.create_subscope();
        let right = root.create_subscope();

        left.bind(RequestService { id: "left".into() });
        assert!(right.get_optional::<RequestService>("").unwrap().is_none());
    }

    #[test]
    fn test_bind_overwrites_and_classifies() {
        let root = empty_root();
        root.bind(RequestService { id: "first".into() })
            .bind(RequestService { id: "second".into() })
            .bind_classified("admin", RequestService { id: "admin".into() });

        assert_eq!(root.get::<RequestService>().unwrap().id, "second");
        assert_eq!(root.get_single::<RequestService>("admin").unwrap().id, "admin");
        assert_eq!(root.len(), 2);
    }

    #[test]
    fn test_nearest_entry_wins() {
        let root = empty_root();
        root.bind(RequestService { id: "root".into() });
        let child = root.create_subscope();
        child.bind(RequestService { id: "child".into() });
        let grandchild = child.create_subscope();

        assert_eq!(grandchild.get::<RequestService>().unwrap().id, "child");
        assert_eq!(root.get::<RequestService>().unwrap().id, "root");
    }

    #[test]
    fn test_cached_locally_ignores_ancestors() {
        let root = empty_root();
        root.bind(GlobalService);
        let child = root.create_subscope();

        assert!(child.is_cached::<GlobalService>(""));
        assert!(child.cached_locally::<GlobalService>("").is_none());
        assert!(root.cached_locally::<GlobalService>("").is_some());
    }

    #[test]
    fn test_dispose_runs_disposers_children_first() {
        static LOG: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

        let mut builder = FactoryRegistry::builder();
        builder
            .register(
                FactoryDescriptor::direct(|scope| {
                    Ok(RequestService {
                        id: format!("depth-{}", scope.depth()),
                    })
                })
                .with_disposer(|s: &RequestService| LOG.lock().unwrap().push(s.id.clone())),
            )
            .unwrap();

        let root = Scope::root(builder.build());
        let child = root.create_subscope();
        let grandchild = child.create_subscope();

        root.get::<RequestService>().unwrap();
        child.get::<RequestService>().unwrap();
        grandchild.get::<RequestService>().unwrap();
        // seeds are not disposed
        child.bind(GlobalService);

        child.dispose();

        assert_eq!(*LOG.lock().unwrap(), ["depth-2", "depth-1"]);
        assert!(child.is_disposed());
        assert!(grandchild.is_disposed());
        assert!(!root.is_disposed());
        assert_eq!(root.child_count(), 0);
        assert!(root.get::<RequestService>().is_ok());

        let err = child.get::<RequestService>().unwrap_err();
        assert!(matches!(err, DiError::ScopeDisposed { .. }));

        // idempotent
        child.dispose();
        assert_eq!(LOG.lock().unwrap().len(), 2);
    }

    #[test]
    #[should_panic(expected = "has been disposed")]
    fn test_bind_after_dispose() {
        let root = empty_root();
        let child = root.create_subscope();
        child.dispose();
        child.bind(GlobalService);
    }

    #[test]
    fn test_dropped_parent_reported() {
        let child = {
            let root = empty_root();
            root.create_subscope()
        };

        let err = child.get::<GlobalService>().unwrap_err();
        assert_eq!(err, DiError::ParentDropped);
    }

    #[test]
    fn test_bind_over_constructed_runs_its_disposer() {
        static DISPOSED: AtomicUsize = AtomicUsize::new(0);

        let mut builder = FactoryRegistry::builder();
        builder
            .register(
                FactoryDescriptor::direct(|_| Ok(RequestService { id: "built".into() }))
                    .with_disposer(|_: &RequestService| {
                        DISPOSED.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        let root = Scope::root(builder.build());
        let child = root.create_subscope();
        assert_eq!(child.get::<RequestService>().unwrap().id, "built");

        child.bind(RequestService { id: "seeded".into() });
        assert_eq!(DISPOSED.load(Ordering::SeqCst), 1);
        assert_eq!(child.get::<RequestService>().unwrap().id, "seeded");

        // the seeded replacement has no disposer, the built one ran only once
        child.dispose();
        assert_eq!(DISPOSED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_subscopes_released() {
        static LIVE: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;

        impl Drop for Tracked {
            fn drop(&mut self) {
                LIVE.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let mut builder = FactoryRegistry::builder();
        builder
            .register(FactoryDescriptor::direct(|_| {
                LIVE.fetch_add(1, Ordering::SeqCst);
                Ok(Tracked)
            }))
            .unwrap();
        let root = Scope::root(builder.build());

        for _ in 0..1000 {
            let request = root.create_subscope();
            request.get::<Tracked>().unwrap();
            request.bind(GlobalService);
        }

        assert_eq!(root.child_count(), 0);
        assert_eq!(LIVE.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscope_kept_while_handle_or_descendant_held() {
        let root = empty_root();

        let child = root.create_subscope();
        let copy = child.clone();
        drop(child);
        assert_eq!(root.child_count(), 1);
        drop(copy);
        assert_eq!(root.child_count(), 0);

        let leaf = {
            let middle = root.create_subscope();
            middle.bind(GlobalService);
            middle.create_subscope()
        };
        assert_eq!(root.child_count(), 1);
        assert!(leaf.get::<GlobalService>().is_ok());

        let middle = leaf.parent().unwrap();
        assert_eq!(middle.child_count(), 1);
        drop(middle);
        assert_eq!(root.child_count(), 1);

        // the leaf was the last thing holding the middle scope
        drop(leaf);
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn test_scope_ids_unique() {
        let s1 = ScopeId::new();
        let s2 = ScopeId::new();
        let s3 = ScopeId::new();

        assert_ne!(s1.id(), s2.id());
        assert_ne!(s2.id(), s3.id());
        assert!(format!("{}", s1).starts_with("scope-"));
    }
}
