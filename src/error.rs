//! Error types for scoped resolution

use crate::provider::Binding;
use thiserror::Error;

/// Errors that can occur while building a registry or resolving from a scope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiError {
    /// No cached instance and no descriptor for the requested binding
    #[error("No binding found for {type_name} (classifier: {classifier:?})")]
    NotFound {
        type_name: &'static str,
        classifier: String,
    },

    /// A binding re-entered its own in-progress construction
    #[error("Circular dependency detected: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    /// Constructor reported a failure of its own
    #[error("Failed to create {type_name}: {reason}")]
    CreationFailed {
        type_name: &'static str,
        reason: String,
    },

    /// Duplicate (type, classifier) registration while assembling a registry
    #[error("Binding already registered: {type_name} (classifier: {classifier:?})")]
    AlreadyRegistered {
        type_name: &'static str,
        classifier: String,
    },

    /// The scope was disposed and can no longer resolve
    #[error("Scope {scope} has been disposed")]
    ScopeDisposed { scope: String },

    /// An ancestor scope was dropped while a descendant was still in use
    #[error("Parent scope has been dropped")]
    ParentDropped,

    /// Internal error
    #[error("Internal DI error: {0}")]
    Internal(String),
}

impl DiError {
    /// Create a NotFound error for a type and classifier
    #[inline]
    pub fn not_found<T: 'static>(classifier: &str) -> Self {
        Self::NotFound {
            type_name: std::any::type_name::<T>(),
            classifier: classifier.to_owned(),
        }
    }

    /// Create a CreationFailed error
    #[inline]
    pub fn creation_failed<T: 'static>(reason: impl Into<String>) -> Self {
        Self::CreationFailed {
            type_name: std::any::type_name::<T>(),
            reason: reason.into(),
        }
    }

    /// NotFound for a binding known only at runtime
    #[inline]
    pub fn binding_not_found(binding: &Binding) -> Self {
        Self::NotFound {
            type_name: binding.type_name(),
            classifier: binding.classifier().to_owned(),
        }
    }

    /// Create an AlreadyRegistered error for a duplicate binding
    #[inline]
    pub fn already_registered(binding: &Binding) -> Self {
        Self::AlreadyRegistered {
            type_name: binding.type_name(),
            classifier: binding.classifier().to_owned(),
        }
    }

    /// Whether this is a missing-binding failure
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is a cycle failure
    #[inline]
    pub fn is_circular(&self) -> bool {
        matches!(self, Self::CircularDependency { .. })
    }
}

/// Result type alias for DI operations
pub type Result<T> = std::result::Result<T, DiError>;
