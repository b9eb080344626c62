#![no_main]

//! Fuzz target for scope tree operations
//!
//! Builds random trees, seeds random scopes and resolves a fixed dependency
//! graph from random positions, checking after every step that cached
//! instances sit at the depth their dependencies allow.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use scope_injector::{FactoryDescriptor, FactoryRegistry, Scope};
use std::sync::Arc;

/// Seeded only through `bind`
#[derive(Debug, Arbitrary)]
struct Tenant {
    id: u8,
}

/// Topmost, needs Tenant
struct TenantCache {
    tenant: Arc<Tenant>,
}

/// Unscoped, needs TenantCache
struct Lookup {
    cache: Arc<TenantCache>,
}

/// Topmost, needs Lookup through the unscoped hop
struct Report {
    lookup: Arc<Lookup>,
}

/// Direct, no dependencies
struct Local;

#[derive(Debug, Arbitrary)]
enum ScopeOp {
    CreateSubscope { parent: u8 },
    BindTenant { scope: u8, tenant: Tenant },
    GetReport { scope: u8 },
    GetLookup { scope: u8 },
    GetLocal { scope: u8 },
    GetOptionalTenant { scope: u8 },
    Dispose { scope: u8 },
}

fn registry() -> FactoryRegistry {
    let mut builder = FactoryRegistry::builder();
    builder
        .register(FactoryDescriptor::topmost(|s| {
            Ok(TenantCache {
                tenant: s.get::<Tenant>()?,
            })
        }))
        .unwrap()
        .register(FactoryDescriptor::unscoped(|s| {
            Ok(Lookup {
                cache: s.get::<TenantCache>()?,
            })
        }))
        .unwrap()
        .register(FactoryDescriptor::topmost(|s| {
            Ok(Report {
                lookup: s.get::<Lookup>()?,
            })
        }))
        .unwrap()
        .register(FactoryDescriptor::direct(|_| Ok(Local)))
        .unwrap();
    builder.build()
}

/// Depth of the nearest scope on the chain matching `found`
fn holder_of(scope: &Scope, found: impl Fn(&Scope) -> bool) -> Option<u32> {
    let mut current = Some(scope.clone());
    while let Some(s) = current {
        if found(&s) {
            return Some(s.depth());
        }
        current = s.parent();
    }
    None
}

/// Depth of the nearest scope on the chain holding a `T`
fn holder_depth<T: Send + Sync + 'static>(scope: &Scope) -> Option<u32> {
    holder_of(scope, |s| s.cached_locally::<T>("").is_some())
}

fn pick(scopes: &[Scope], index: u8) -> &Scope {
    &scopes[index as usize % scopes.len()]
}

fuzz_target!(|ops: Vec<ScopeOp>| {
    let root = Scope::root(registry());
    let mut scopes = vec![root.clone()];

    for op in ops.into_iter().take(100) { // Limit operations to prevent OOM
        match op {
            ScopeOp::CreateSubscope { parent } => {
                let parent = pick(&scopes, parent);
                if scopes.len() < 32 && !parent.is_disposed() {
                    let child = parent.create_subscope();
                    assert_eq!(child.depth(), parent.depth() + 1);
                    scopes.push(child);
                }
            }
            ScopeOp::BindTenant { scope, tenant } => {
                let scope = pick(&scopes, scope);
                if !scope.is_disposed() {
                    scope.bind(tenant);
                }
            }
            ScopeOp::GetReport { scope } => {
                let scope = pick(&scopes, scope);
                if let Ok(report) = scope.get::<Report>() {
                    let report_at = holder_of(scope, |s| {
                        s.cached_locally::<Report>("").is_some_and(|r| Arc::ptr_eq(&r, &report))
                    });
                    let cache_at = holder_of(scope, |s| {
                        s.cached_locally::<TenantCache>("")
                            .is_some_and(|c| Arc::ptr_eq(&c, &report.lookup.cache))
                    });

                    // never cached above what it consumed
                    assert!(report_at.is_some() && cache_at.is_some());
                    assert!(report_at >= cache_at);

                    let again = scope.get::<Report>().unwrap();
                    assert!(Arc::ptr_eq(&report, &again));
                    let _ = report.lookup.cache.tenant.id;
                } else {
                    assert!(
                        scope.is_disposed()
                            || (holder_depth::<Tenant>(scope).is_none()
                                && holder_depth::<TenantCache>(scope).is_none())
                    );
                }
            }
            ScopeOp::GetLookup { scope } => {
                let scope = pick(&scopes, scope);
                if let (Ok(a), Ok(b)) = (scope.get::<Lookup>(), scope.get::<Lookup>()) {
                    assert!(!Arc::ptr_eq(&a, &b));
                    assert!(Arc::ptr_eq(&a.cache, &b.cache));
                }
            }
            ScopeOp::GetLocal { scope } => {
                let scope = pick(&scopes, scope);
                if scope.get::<Local>().is_ok() {
                    assert!(holder_depth::<Local>(scope).is_some());
                }
            }
            ScopeOp::GetOptionalTenant { scope } => {
                let scope = pick(&scopes, scope);
                match scope.get_optional::<Tenant>("") {
                    Ok(found) => assert_eq!(found.is_some(), holder_depth::<Tenant>(scope).is_some()),
                    Err(_) => assert!(scope.is_disposed()),
                }
            }
            ScopeOp::Dispose { scope } => {
                let scope = pick(&scopes, scope);
                if !scope.same_scope(&root) {
                    scope.dispose();
                    assert!(scope.is_disposed());
                    assert!(scope.is_empty());
                    assert!(scope.get::<Local>().is_err());
                }
            }
        }
    }
});
