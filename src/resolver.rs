//! The resolution engine
//!
//! Every request runs the same procedure:
//!
//! 1. Search the requesting scope and its ancestors for a cached entry.
//!    The first hit wins.
//! 2. On a miss, take the descriptor from the registry and run its
//!    constructor with an [`Accessor`] bound to the requesting scope.
//!    Nested requests made by the constructor report the depth their own
//!    result is cached at.
//! 3. Pick the cache depth from the scoping policy:
//!    - `Unscoped`: nowhere.
//!    - `Direct`: the requesting scope.
//!    - `Topmost`: the deepest depth any consumed dependency required,
//!      or the root if none did.
//! 4. Store the instance at the ancestor with that depth and report the
//!    depth to the enclosing construction.
//!
//! Cached constructions are single-flight per (scope, binding): concurrent
//! callers block on one gate and share its outcome. A wait that would loop
//! back to the waiting thread through other threads' gates fails as a cycle
//! instead of blocking.

use crate::context::ConstructionContext;
use crate::factory::{ErasedInstance, FactoryDescriptor, FactoryFilter};
use crate::provider::{Binding, DEFAULT_CLASSIFIER, Injectable, Scoping};
use crate::scope::{Scope, ScopeNode};
use crate::storage::Resolved;
use crate::waits::Waiting;
use crate::{DiError, Result};
use std::any::TypeId;
use std::cell::RefCell;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Capability handed to constructors.
///
/// Resolves dependencies from the scope the outer request was made on,
/// sharing that request's cycle guard and depth tracking.
///
/// # Examples
///
/// ```rust
/// use scope_injector::{FactoryDescriptor, FactoryRegistry, Scope};
///
/// struct Database { url: String }
/// struct Repository { url: String }
///
/// let mut builder = FactoryRegistry::builder();
/// builder
///     .register(FactoryDescriptor::topmost(|scope| {
///         let db = scope.get::<Database>()?;
///         Ok(Repository { url: db.url.clone() })
///     }))
///     .unwrap();
///
/// let root = Scope::root(builder.build());
/// root.bind(Database { url: "postgres://localhost".into() });
///
/// assert_eq!(root.get::<Repository>().unwrap().url, "postgres://localhost");
/// ```
pub struct Accessor<'a> {
    node: &'a Arc<ScopeNode>,
    context: &'a RefCell<ConstructionContext>,
}

impl<'a> Accessor<'a> {
    #[inline]
    pub(crate) fn new(node: &'a Arc<ScopeNode>, context: &'a RefCell<ConstructionContext>) -> Self {
        Self { node, context }
    }

    /// Resolve `T` under `classifier`, failing if nothing provides it.
    pub fn get_single<T: Injectable>(&self, classifier: &str) -> Result<Arc<T>> {
        self.get_single_with(classifier, None)
    }

    /// Resolve `T` under the default classifier.
    #[inline]
    pub fn get<T: Injectable>(&self) -> Result<Arc<T>> {
        self.get_single::<T>(DEFAULT_CLASSIFIER)
    }

    /// Like [`get_single`](Self::get_single), restricted to descriptors passing `filter`.
    pub fn get_single_filtered<T: Injectable>(
        &self,
        classifier: &str,
        filter: &FactoryFilter,
    ) -> Result<Arc<T>> {
        self.get_single_with(classifier, Some(filter))
    }

    /// Resolve `T` under `classifier`, or `None` if nothing provides it.
    ///
    /// Only the absence of the requested binding itself is recovered;
    /// failures while constructing it still propagate.
    pub fn get_optional<T: Injectable>(&self, classifier: &str) -> Result<Option<Arc<T>>> {
        let binding = Binding::of::<T>(classifier);
        resolve_binding(self.node, &binding, None, self.context)?
            .map(|r| downcast::<T>(r.instance))
            .transpose()
    }

    /// Every registered `T`, across all classifiers, in registration order.
    #[inline]
    pub fn get_many<T: Injectable>(&self) -> Result<Vec<Arc<T>>> {
        self.get_many_with(None, None)
    }

    /// Every registered `T` under `classifier`.
    #[inline]
    pub fn get_many_classified<T: Injectable>(&self, classifier: &str) -> Result<Vec<Arc<T>>> {
        self.get_many_with(Some(classifier), None)
    }

    /// Every registered `T` passing `filter`, optionally narrowed to one classifier.
    #[inline]
    pub fn get_many_filtered<T: Injectable>(
        &self,
        classifier: Option<&str>,
        filter: &FactoryFilter,
    ) -> Result<Vec<Arc<T>>> {
        self.get_many_with(classifier, Some(filter))
    }

    /// Handle to the scope this accessor resolves from
    #[inline]
    pub fn scope(&self) -> Scope {
        Scope::from_node(Arc::clone(self.node))
    }

    /// Depth of the scope this accessor resolves from
    #[inline]
    pub fn depth(&self) -> u32 {
        self.node.depth()
    }

    fn get_single_with<T: Injectable>(
        &self,
        classifier: &str,
        filter: Option<&FactoryFilter>,
    ) -> Result<Arc<T>> {
        let binding = Binding::of::<T>(classifier);
        match resolve_binding(self.node, &binding, filter, self.context)? {
            Some(resolved) => downcast::<T>(resolved.instance),
            None => {
                #[cfg(feature = "logging")]
                debug!(
                    target: "scope_injector",
                    service = binding.type_name(),
                    classifier = classifier,
                    depth = self.node.depth(),
                    "No binding found in scope chain or registry"
                );
                Err(DiError::not_found::<T>(classifier))
            }
        }
    }

    fn get_many_with<T: Injectable>(
        &self,
        classifier: Option<&str>,
        filter: Option<&FactoryFilter>,
    ) -> Result<Vec<Arc<T>>> {
        self.node.ensure_active()?;
        let descriptors =
            self.node
                .registry()
                .resolve_many(TypeId::of::<T>(), classifier, filter);

        descriptors
            .into_iter()
            .map(|descriptor| {
                resolve_descriptor(self.node, descriptor, self.context)
                    .and_then(|r| downcast::<T>(r.instance))
            })
            .collect()
    }
}

impl std::fmt::Debug for Accessor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accessor")
            .field("scope", &self.node.id())
            .field("depth", &self.node.depth())
            .field("nesting", &self.context.borrow().nesting())
            .finish()
    }
}

#[inline]
fn downcast<T: Injectable>(instance: ErasedInstance) -> Result<Arc<T>> {
    instance.downcast::<T>().map_err(|_| {
        DiError::Internal(format!(
            "cached instance is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Lookup search, then construction. `Ok(None)` means no descriptor exists
/// for `binding` itself.
fn resolve_binding(
    node: &Arc<ScopeNode>,
    binding: &Binding,
    filter: Option<&FactoryFilter>,
    context: &RefCell<ConstructionContext>,
) -> Result<Option<Resolved>> {
    node.ensure_active()?;

    if let Some(hit) = lookup_observed(node, binding, context)? {
        return Ok(Some(hit));
    }

    match node.registry().resolve_single_filtered(binding, filter) {
        Ok(descriptor) => construct_observed(node, descriptor, context).map(Some),
        Err(_) => Ok(None),
    }
}

/// Resolution when the descriptor is already known (multi-binding path)
fn resolve_descriptor(
    node: &Arc<ScopeNode>,
    descriptor: &FactoryDescriptor,
    context: &RefCell<ConstructionContext>,
) -> Result<Resolved> {
    if let Some(hit) = lookup_observed(node, descriptor.binding(), context)? {
        return Ok(hit);
    }
    construct_observed(node, descriptor, context)
}

fn lookup_observed(
    node: &Arc<ScopeNode>,
    binding: &Binding,
    context: &RefCell<ConstructionContext>,
) -> Result<Option<Resolved>> {
    let hit = node.lookup(binding)?;

    if let Some(resolved) = &hit {
        #[cfg(feature = "logging")]
        trace!(
            target: "scope_injector",
            service = binding.type_name(),
            classifier = binding.classifier(),
            depth = node.depth(),
            cache_depth = ?resolved.depth,
            "Instance resolved from scope cache"
        );

        context.borrow_mut().observe(resolved.depth);
    }

    Ok(hit)
}

fn construct_observed(
    node: &Arc<ScopeNode>,
    descriptor: &FactoryDescriptor,
    context: &RefCell<ConstructionContext>,
) -> Result<Resolved> {
    let resolved = construct(node, descriptor, context)?;
    context.borrow_mut().observe(resolved.depth);
    Ok(resolved)
}

fn construct(
    node: &Arc<ScopeNode>,
    descriptor: &FactoryDescriptor,
    context: &RefCell<ConstructionContext>,
) -> Result<Resolved> {
    let binding = descriptor.binding();

    if descriptor.scoping() == Scoping::Unscoped {
        let (instance, deepest) = instantiate(node, descriptor, context)?;

        #[cfg(feature = "logging")]
        trace!(
            target: "scope_injector",
            service = binding.type_name(),
            classifier = binding.classifier(),
            depth = node.depth(),
            "Created unscoped instance"
        );

        // Depths the constructor consumed still bind whoever consumes this instance.
        context.borrow_mut().observe(deepest);
        return Ok(Resolved {
            instance,
            depth: None,
        });
    }

    // Check before touching the gate: re-entering our own gate would block forever.
    context.borrow_mut().check_not_in_progress(binding)?;

    let gate = node.cache().gate(binding);
    let waiting = Waiting::start(&gate, binding)
        .map_err(|hops| context.borrow_mut().cross_thread_cycle(binding, &hops))?;

    let mut leader = false;
    let outcome = gate
        .get_or_init(|| {
            leader = true;
            let _leading = waiting.lead();
            construct_cached(node, descriptor, context)
        })
        .clone();
    drop(waiting);

    if leader {
        node.cache().release_gate(binding, &gate);
    } else if let Err(err @ DiError::CircularDependency { .. }) = &outcome {
        #[cfg(feature = "logging")]
        debug!(
            target: "scope_injector",
            service = binding.type_name(),
            classifier = binding.classifier(),
            depth = node.depth(),
            "Construction waited on failed with a cycle"
        );
        context.borrow_mut().poison(err.clone());
    }

    outcome
}

/// Body of a gated construction. Runs on exactly one thread per gate.
fn construct_cached(
    node: &Arc<ScopeNode>,
    descriptor: &FactoryDescriptor,
    context: &RefCell<ConstructionContext>,
) -> Result<Resolved> {
    let binding = descriptor.binding();

    // Another gate may have finished between our lookup and taking this one.
    if let Some(hit) = node.lookup(binding)? {
        return Ok(hit);
    }

    let (instance, deepest) = instantiate(node, descriptor, context)?;

    let cache_depth = match descriptor.scoping() {
        Scoping::Direct => node.depth(),
        _ => deepest.unwrap_or(0).min(node.depth()),
    };

    let owner = node.ancestor_at(cache_depth)?;
    let (stored, inserted) = owner.cache().insert_if_absent(
        binding.clone(),
        instance,
        cache_depth,
        descriptor.disposer(),
    );

    #[cfg(feature = "logging")]
    debug!(
        target: "scope_injector",
        service = binding.type_name(),
        classifier = binding.classifier(),
        scoping = descriptor.scoping().as_str(),
        depth = node.depth(),
        cache_depth = cache_depth,
        scope = %owner.id(),
        inserted = inserted,
        "Cached constructed instance"
    );
    #[cfg(not(feature = "logging"))]
    let _ = inserted;

    Ok(Resolved {
        instance: stored,
        depth: Some(cache_depth),
    })
}

/// Run the constructor inside a fresh frame.
///
/// Returns the instance and the deepest cache depth its dependencies used.
fn instantiate(
    node: &Arc<ScopeNode>,
    descriptor: &FactoryDescriptor,
    context: &RefCell<ConstructionContext>,
) -> Result<(ErasedInstance, Option<u32>)> {
    context.borrow_mut().enter(descriptor.binding())?;

    let result = descriptor.construct(&Accessor::new(node, context));

    let mut ctx = context.borrow_mut();
    let deepest = ctx.exit();
    if let Some(err) = ctx.poisoned() {
        return Err(err);
    }

    result.map(|instance| (instance, deepest))
}
