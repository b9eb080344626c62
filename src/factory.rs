//! Factory descriptors: how a binding is constructed and cached
//!
//! A descriptor pairs a [`Binding`] with a [`Scoping`] policy and a
//! type-erased constructor. The constructor receives an [`Accessor`] bound
//! to whichever scope the resolution happens on, so it can pull its own
//! dependencies through the same resolution procedure.

use crate::provider::{Binding, DEFAULT_CLASSIFIER, Injectable, Scoping};
use crate::resolver::Accessor;
use crate::Result;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Type-erased instance as stored in scope caches
pub(crate) type ErasedInstance = Arc<dyn Any + Send + Sync>;

/// Type-erased constructor
type ConstructorFn = Arc<dyn Fn(&Accessor<'_>) -> Result<ErasedInstance> + Send + Sync>;

/// Type-erased disposal callback
pub(crate) type DisposerFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// Describes how to build one binding.
///
/// # Examples
///
/// ```rust
/// use scope_injector::{FactoryDescriptor, Scoping};
///
/// struct Config { debug: bool }
/// struct Logger { debug: bool }
///
/// let config = FactoryDescriptor::new(Scoping::Topmost, |_| Ok(Config { debug: true }));
/// let logger = FactoryDescriptor::direct(|scope| {
///     let config = scope.get::<Config>()?;
///     Ok(Logger { debug: config.debug })
/// })
/// .classifier("console");
///
/// assert_eq!(logger.binding().classifier(), "console");
/// assert_eq!(config.scoping(), Scoping::Topmost);
/// ```
#[derive(Clone)]
pub struct FactoryDescriptor {
    binding: Binding,
    scoping: Scoping,
    constructor: ConstructorFn,
    disposer: Option<DisposerFn>,
}

impl FactoryDescriptor {
    /// Create a descriptor for `T` under the default classifier
    pub fn new<T: Injectable, F>(scoping: Scoping, constructor: F) -> Self
    where
        F: Fn(&Accessor<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            binding: Binding::of::<T>(DEFAULT_CLASSIFIER),
            scoping,
            constructor: Arc::new(move |accessor| {
                constructor(accessor).map(|instance| Arc::new(instance) as ErasedInstance)
            }),
            disposer: None,
        }
    }

    /// Shorthand for [`Scoping::Unscoped`]
    #[inline]
    pub fn unscoped<T: Injectable, F>(constructor: F) -> Self
    where
        F: Fn(&Accessor<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::new(Scoping::Unscoped, constructor)
    }

    /// Shorthand for [`Scoping::Direct`]
    #[inline]
    pub fn direct<T: Injectable, F>(constructor: F) -> Self
    where
        F: Fn(&Accessor<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::new(Scoping::Direct, constructor)
    }

    /// Shorthand for [`Scoping::Topmost`]
    #[inline]
    pub fn topmost<T: Injectable, F>(constructor: F) -> Self
    where
        F: Fn(&Accessor<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::new(Scoping::Topmost, constructor)
    }

    /// Qualify the binding with a classifier
    pub fn classifier(mut self, classifier: &str) -> Self {
        self.binding = self.binding.with_classifier(classifier);
        self
    }

    /// Attach a callback run when a cached instance is disposed with its scope.
    ///
    /// `T` must be the descriptor's own type; a callback for any other type never fires.
    pub fn with_disposer<T: Injectable, D>(mut self, disposer: D) -> Self
    where
        D: Fn(&T) + Send + Sync + 'static,
    {
        debug_assert_eq!(
            TypeId::of::<T>(),
            self.binding.type_id(),
            "disposer type does not match descriptor type"
        );
        self.disposer = Some(Arc::new(move |instance| {
            if let Some(typed) = instance.downcast_ref::<T>() {
                disposer(typed);
            }
        }));
        self
    }

    #[inline]
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    #[inline]
    pub fn scoping(&self) -> Scoping {
        self.scoping
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.binding.type_id()
    }

    #[inline]
    pub fn classifier_str(&self) -> &str {
        self.binding.classifier()
    }

    /// Whether a disposal callback is attached
    #[inline]
    pub fn has_disposer(&self) -> bool {
        self.disposer.is_some()
    }

    /// Run the constructor
    #[inline]
    pub(crate) fn construct(&self, accessor: &Accessor<'_>) -> Result<ErasedInstance> {
        (self.constructor)(accessor)
    }

    #[inline]
    pub(crate) fn disposer(&self) -> Option<DisposerFn> {
        self.disposer.clone()
    }
}

impl fmt::Debug for FactoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryDescriptor")
            .field("binding", &self.binding)
            .field("scoping", &self.scoping)
            .field("has_disposer", &self.disposer.is_some())
            .finish()
    }
}

/// Predicate narrowing which descriptors a lookup may use.
///
/// # Examples
///
/// ```rust
/// use scope_injector::{FactoryFilter, Scoping};
///
/// let cached_only = FactoryFilter::new(|d| d.scoping() != Scoping::Unscoped);
/// # let _ = cached_only;
/// ```
#[derive(Clone)]
pub struct FactoryFilter(Arc<dyn Fn(&FactoryDescriptor) -> bool + Send + Sync>);

impl FactoryFilter {
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(&FactoryDescriptor) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Filter accepting only the given scoping policy
    pub fn scoping(scoping: Scoping) -> Self {
        Self::new(move |d| d.scoping() == scoping)
    }

    #[inline]
    pub fn accepts(&self, descriptor: &FactoryDescriptor) -> bool {
        (self.0)(descriptor)
    }
}

impl fmt::Debug for FactoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FactoryFilter(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Connection {
        id: u32,
    }

    #[test]
    fn test_descriptor_binding() {
        let descriptor = FactoryDescriptor::direct(|_| Ok(Connection { id: 1 })).classifier("primary");

        assert_eq!(descriptor.scoping(), Scoping::Direct);
        assert_eq!(descriptor.type_id(), TypeId::of::<Connection>());
        assert_eq!(descriptor.classifier_str(), "primary");
        assert!(!descriptor.has_disposer());
    }

    #[test]
    fn test_disposer_receives_typed_instance() {
        static CLOSED: AtomicU32 = AtomicU32::new(0);

        let descriptor = FactoryDescriptor::topmost(|_| Ok(Connection { id: 7 }))
            .with_disposer(|c: &Connection| {
                CLOSED.store(c.id, Ordering::SeqCst);
            });

        let instance: ErasedInstance = Arc::new(Connection { id: 7 });
        let dispose = descriptor.disposer().unwrap();
        dispose(instance.as_ref());

        assert_eq!(CLOSED.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_filter_by_scoping() {
        let direct = FactoryDescriptor::direct(|_| Ok(Connection { id: 1 }));
        let unscoped = FactoryDescriptor::unscoped(|_| Ok(Connection { id: 2 }));
        let filter = FactoryFilter::scoping(Scoping::Direct);

        assert!(filter.accepts(&direct));
        assert!(!filter.accepts(&unscoped));
    }
}
