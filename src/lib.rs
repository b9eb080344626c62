//! # Scope Injector - Depth-Aware Scoped Dependency Injection for Rust
//!
//! A dependency injection runtime built around a tree of nested scopes.
//! An immutable registry says *what* to construct; the scope tree decides
//! *where* each constructed instance is cached so that it stays visible from
//! exactly the scopes entitled to see it.
//!
//! ## Features
//!
//! - 🌳 **Scope tree** - Parent scopes own their children; lookups walk upward
//! - 🎯 **Three scoping policies** - `Unscoped`, `Direct`, `Topmost`
//! - 📐 **Depth tracking** - `Topmost` instances are cached at the shallowest
//!   scope that can still reach every dependency they consumed
//! - 🔁 **Cycle detection** - A cyclic chain fails as a whole and caches nothing
//! - 🧵 **Single-flight** - Concurrent misses on one scope construct once
//! - 🧹 **Disposal** - Scopes tear down their cached instances in reverse order
//! - 📊 **Observable** - Optional tracing integration with JSON or pretty output
//!
//! ## Quick Start
//!
//! ```rust
//! use scope_injector::{FactoryDescriptor, FactoryRegistry, Scope};
//!
//! struct Database { url: String }
//! struct UserService { db: std::sync::Arc<Database> }
//!
//! let mut builder = FactoryRegistry::builder();
//! builder
//!     .register(FactoryDescriptor::topmost(|scope| {
//!         Ok(UserService { db: scope.get::<Database>()? })
//!     }))
//!     .unwrap();
//!
//! let root = Scope::root(builder.build());
//! root.bind(Database { url: "postgres://localhost".into() });
//!
//! let users = root.get::<UserService>().unwrap();
//! assert_eq!(users.db.url, "postgres://localhost");
//! ```
//!
//! ## Scoping Policies
//!
//! ```rust
//! use scope_injector::{FactoryDescriptor, FactoryRegistry, Scope};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! static COUNTER: AtomicU64 = AtomicU64::new(0);
//!
//! struct RequestId(u64);
//! struct Session { user: String }
//! struct Greeter { user: String }
//!
//! let mut builder = FactoryRegistry::builder();
//! builder
//!     // Unscoped - new instance every time
//!     .register(FactoryDescriptor::unscoped(|_| {
//!         Ok(RequestId(COUNTER.fetch_add(1, Ordering::SeqCst)))
//!     }))
//!     .unwrap()
//!     // Topmost - cached as high up as its dependencies allow
//!     .register(FactoryDescriptor::topmost(|scope| {
//!         Ok(Greeter { user: scope.get::<Session>()?.user.clone() })
//!     }))
//!     .unwrap();
//!
//! let root = Scope::root(builder.build());
//! let session = root.create_subscope();
//! session.bind(Session { user: "ada".into() });
//! let request = session.create_subscope();
//!
//! assert_ne!(request.get::<RequestId>().unwrap().0, request.get::<RequestId>().unwrap().0);
//!
//! // Needs Session, so it is cached in the session scope, not the request scope
//! let greeter = request.get::<Greeter>().unwrap();
//! assert!(Arc::ptr_eq(&greeter, &session.cached_locally::<Greeter>("").unwrap()));
//! ```

mod context;
mod error;
mod factory;
#[cfg(feature = "logging")]
pub mod logging;
mod provider;
mod registry;
mod resolver;
mod scope;
mod storage;
mod waits;

pub use error::*;
pub use factory::{FactoryDescriptor, FactoryFilter};
pub use provider::*;
pub use registry::*;
pub use resolver::Accessor;
pub use scope::{Scope, ScopeId};

// Re-export tracing macros for convenience when logging feature is enabled
#[cfg(feature = "logging")]
pub use tracing::{debug, error, info, trace, warn};

// Re-export for convenience
pub use std::sync::Arc;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Accessor, Binding, DiError, FactoryDescriptor, FactoryFilter, FactoryModule,
        FactoryRegistry, Injectable, RegistryBuilder, Result, Scope, Scoping,
    };
    pub use std::sync::Arc;
}
