//! Provider traits and binding identity
//!
//! These types define what can be injected, how a binding is identified,
//! and where its instances may be cached.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Classifier used when a binding is not qualified.
pub const DEFAULT_CLASSIFIER: &str = "";

/// Marker trait for types that can be injected from a scope.
///
/// This is automatically implemented for all types that are `Send + Sync + 'static`.
/// You never need to implement this manually.
pub trait Injectable: Send + Sync + 'static {}

// Blanket implementation - everything that's Send + Sync + 'static is Injectable
impl<T: Send + Sync + 'static> Injectable for T {}

/// Where constructed instances of a binding are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scoping {
    /// Never cached - every request constructs a fresh instance
    Unscoped,

    /// Cached in the scope that requested it
    Direct,

    /// Cached in the shallowest scope that can still see every dependency
    /// the constructor consumed
    #[default]
    Topmost,
}

impl Scoping {
    /// Short lowercase name, used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Scoping::Unscoped => "unscoped",
            Scoping::Direct => "direct",
            Scoping::Topmost => "topmost",
        }
    }
}

impl fmt::Display for Scoping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a binding: a type plus a classifier string.
///
/// Equality and hashing consider only the `TypeId` and the classifier;
/// the type name is carried along for diagnostics.
#[derive(Clone)]
pub struct Binding {
    type_id: TypeId,
    type_name: &'static str,
    classifier: Arc<str>,
}

impl Binding {
    /// Binding for `T` under `classifier`
    #[inline]
    pub fn of<T: Injectable>(classifier: &str) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            classifier: Arc::from(classifier),
        }
    }

    /// Binding for `T` under the default classifier
    #[inline]
    pub fn default_of<T: Injectable>() -> Self {
        Self::of::<T>(DEFAULT_CLASSIFIER)
    }

    /// Same type, different classifier
    #[inline]
    pub(crate) fn with_classifier(self, classifier: &str) -> Self {
        Self {
            classifier: Arc::from(classifier),
            ..self
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[inline]
    pub fn classifier(&self) -> &str {
        &self.classifier
    }
}

impl PartialEq for Binding {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.classifier == other.classifier
    }
}

impl Eq for Binding {}

impl Hash for Binding {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.classifier.hash(state);
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.classifier.is_empty() {
            f.write_str(self.type_name)
        } else {
            write!(f, "{}@{}", self.type_name, self.classifier)
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("type_name", &self.type_name)
            .field("classifier", &&*self.classifier)
            .finish()
    }
}
