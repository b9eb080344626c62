//! Immutable registry of factory descriptors
//!
//! A [`RegistryBuilder`] collects descriptors from any number of
//! independently assembled sets, rejecting duplicate bindings as it goes.
//! [`RegistryBuilder::build`] freezes the result into a [`FactoryRegistry`]
//! that scopes consult on every cache miss.

use crate::factory::{FactoryDescriptor, FactoryFilter};
use crate::provider::Binding;
use crate::{DiError, Result};
use ahash::RandomState;
use std::any::TypeId;
use std::collections::HashMap;

#[cfg(feature = "logging")]
use tracing::debug;

/// A set of descriptors that registers itself into a builder.
///
/// # Examples
///
/// ```rust
/// use scope_injector::{FactoryDescriptor, FactoryModule, RegistryBuilder, Result};
///
/// struct Database;
/// struct Cache;
///
/// struct DataModule;
///
/// impl FactoryModule for DataModule {
///     fn register(builder: &mut RegistryBuilder) -> Result<()> {
///         builder
///             .register(FactoryDescriptor::topmost(|_| Ok(Database)))?
///             .register(FactoryDescriptor::topmost(|_| Ok(Cache)))?;
///         Ok(())
///     }
/// }
///
/// let mut builder = RegistryBuilder::new();
/// builder.install::<DataModule>().unwrap();
/// assert_eq!(builder.build().len(), 2);
/// ```
pub trait FactoryModule {
    /// Register all descriptors of this module.
    fn register(builder: &mut RegistryBuilder) -> Result<()>;
}

/// Descriptors in registration order plus lookup indexes into them
#[derive(Default)]
struct Index {
    descriptors: Vec<FactoryDescriptor>,
    by_binding: HashMap<Binding, usize, RandomState>,
    by_type: HashMap<TypeId, Vec<usize>, RandomState>,
}

impl Index {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            descriptors: Vec::with_capacity(capacity),
            by_binding: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
            by_type: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
        }
    }

    fn push(&mut self, descriptor: FactoryDescriptor) -> Result<()> {
        let binding = descriptor.binding().clone();
        if self.by_binding.contains_key(&binding) {
            return Err(DiError::already_registered(&binding));
        }

        let slot = self.descriptors.len();
        self.by_type.entry(binding.type_id()).or_default().push(slot);
        self.by_binding.insert(binding, slot);
        self.descriptors.push(descriptor);
        Ok(())
    }
}

/// Collects descriptors before any scope exists.
#[derive(Default)]
pub struct RegistryBuilder {
    index: Index,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate for roughly `capacity` descriptors
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: Index::with_capacity(capacity),
        }
    }

    /// Add a descriptor.
    ///
    /// Fails with [`DiError::AlreadyRegistered`] if the same (type, classifier)
    /// is already present.
    pub fn register(&mut self, descriptor: FactoryDescriptor) -> Result<&mut Self> {
        #[cfg(feature = "logging")]
        debug!(
            target: "scope_injector",
            service = descriptor.binding().type_name(),
            classifier = descriptor.classifier_str(),
            scoping = descriptor.scoping().as_str(),
            "Registering factory descriptor"
        );

        self.index.push(descriptor)?;
        Ok(self)
    }

    /// Fold another builder's descriptors in, keeping their order.
    pub fn merge(&mut self, other: RegistryBuilder) -> Result<&mut Self> {
        for descriptor in other.index.descriptors {
            self.register(descriptor)?;
        }
        Ok(self)
    }

    /// Let a module register its descriptors.
    pub fn install<M: FactoryModule>(&mut self) -> Result<&mut Self> {
        M::register(self)?;
        Ok(self)
    }

    /// Number of descriptors collected so far
    pub fn len(&self) -> usize {
        self.index.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.descriptors.is_empty()
    }

    /// Freeze into an immutable registry
    pub fn build(self) -> FactoryRegistry {
        #[cfg(feature = "logging")]
        debug!(
            target: "scope_injector",
            descriptors = self.index.descriptors.len(),
            types = self.index.by_type.len(),
            "Factory registry built"
        );

        FactoryRegistry { index: self.index }
    }
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("descriptors", &self.len())
            .finish()
    }
}

/// Immutable lookup table from [`Binding`] to [`FactoryDescriptor`].
pub struct FactoryRegistry {
    index: Index,
}

impl FactoryRegistry {
    /// Start assembling a registry
    #[inline]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// A registry with no descriptors; only bound seed instances resolve.
    pub fn empty() -> Self {
        RegistryBuilder::new().build()
    }

    /// Descriptor for exactly this binding
    #[inline]
    pub fn resolve_single(&self, binding: &Binding) -> Result<&FactoryDescriptor> {
        self.resolve_single_filtered(binding, None)
    }

    /// Descriptor for this binding, if it also passes `filter`
    pub fn resolve_single_filtered(
        &self,
        binding: &Binding,
        filter: Option<&FactoryFilter>,
    ) -> Result<&FactoryDescriptor> {
        self.index
            .by_binding
            .get(binding)
            .map(|&slot| &self.index.descriptors[slot])
            .filter(|descriptor| filter.is_none_or(|f| f.accepts(descriptor)))
            .ok_or_else(|| DiError::binding_not_found(binding))
    }

    /// All descriptors of a type in registration order.
    ///
    /// `classifier` of `None` matches every classifier. Never fails; no match
    /// yields an empty list.
    pub fn resolve_many(
        &self,
        type_id: TypeId,
        classifier: Option<&str>,
        filter: Option<&FactoryFilter>,
    ) -> Vec<&FactoryDescriptor> {
        let Some(slots) = self.index.by_type.get(&type_id) else {
            return Vec::new();
        };

        slots
            .iter()
            .map(|&slot| &self.index.descriptors[slot])
            .filter(|d| classifier.is_none_or(|c| d.classifier_str() == c))
            .filter(|d| filter.is_none_or(|f| f.accepts(d)))
            .collect()
    }

    #[inline]
    pub fn contains(&self, binding: &Binding) -> bool {
        self.index.by_binding.contains_key(binding)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.descriptors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.descriptors.is_empty()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("descriptors", &self.len())
            .field("types", &self.index.by_type.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Scoping;

    #[allow(dead_code)]
    struct MenuItem(&'static str);
    struct Page;

    fn menu(classifier: &'static str, scoping: Scoping) -> FactoryDescriptor {
        FactoryDescriptor::new(scoping, move |_| Ok(MenuItem(classifier))).classifier(classifier)
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(menu("one", Scoping::Direct)).unwrap();

        let err = builder.register(menu("one", Scoping::Topmost)).unwrap_err();
        assert!(matches!(err, DiError::AlreadyRegistered { ref classifier, .. } if classifier == "one"));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_merge_conflict() {
        let mut first = RegistryBuilder::new();
        first.register(menu("one", Scoping::Direct)).unwrap();

        let mut second = RegistryBuilder::new();
        second.register(menu("two", Scoping::Direct)).unwrap();
        second.register(menu("one", Scoping::Direct)).unwrap();

        assert!(first.merge(second).is_err());
    }

    #[test]
    fn test_resolve_single() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(menu("one", Scoping::Unscoped))
            .unwrap()
            .register(FactoryDescriptor::topmost(|_| Ok(Page)))
            .unwrap();
        let registry = builder.build();

        let found = registry.resolve_single(&Binding::of::<MenuItem>("one")).unwrap();
        assert_eq!(found.scoping(), Scoping::Unscoped);
        assert!(registry.resolve_single(&Binding::default_of::<Page>()).is_ok());

        let missing = registry.resolve_single(&Binding::of::<MenuItem>("nine")).unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_resolve_many_keeps_registration_order() {
        let mut builder = RegistryBuilder::new();
        for (name, scoping) in [
            ("b", Scoping::Direct),
            ("a", Scoping::Unscoped),
            ("c", Scoping::Topmost),
        ] {
            builder.register(menu(name, scoping)).unwrap();
        }
        builder.register(FactoryDescriptor::topmost(|_| Ok(Page))).unwrap();
        let registry = builder.build();

        let all: Vec<_> = registry
            .resolve_many(TypeId::of::<MenuItem>(), None, None)
            .iter()
            .map(|d| d.classifier_str().to_owned())
            .collect();
        assert_eq!(all, ["b", "a", "c"]);

        let only_a = registry.resolve_many(TypeId::of::<MenuItem>(), Some("a"), None);
        assert_eq!(only_a.len(), 1);

        let cached = FactoryFilter::new(|d| d.scoping() != Scoping::Unscoped);
        let filtered = registry.resolve_many(TypeId::of::<MenuItem>(), None, Some(&cached));
        assert_eq!(filtered.len(), 2);

        assert!(registry.resolve_many(TypeId::of::<u8>(), None, None).is_empty());
    }

    #[test]
    fn test_filtered_single_treated_as_missing() {
        let mut builder = RegistryBuilder::new();
        builder.register(menu("one", Scoping::Unscoped)).unwrap();
        let registry = builder.build();

        let direct_only = FactoryFilter::scoping(Scoping::Direct);
        let result = registry.resolve_single_filtered(&Binding::of::<MenuItem>("one"), Some(&direct_only));
        assert!(result.unwrap_err().is_not_found());
    }
}
