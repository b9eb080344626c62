//! Walk through a request lifecycle with logging enabled
//!
//! Run with JSON logging (production):
//! ```bash
//! cargo run --example logging --features logging-json
//! ```
//!
//! Run with pretty logging (development):
//! ```bash
//! cargo run --example logging --features logging-pretty
//! ```

use scope_injector::{
    DiError, FactoryDescriptor, FactoryModule, FactoryRegistry, RegistryBuilder, Result, Scope,
};
use std::sync::Arc;

#[allow(dead_code)]
struct Config {
    database_url: String,
}

#[allow(dead_code)]
struct Database {
    url: String,
}

#[allow(dead_code)]
struct Session {
    user: String,
}

#[allow(dead_code)]
struct RequestId(u64);

#[allow(dead_code)]
struct UserService {
    db: Arc<Database>,
    session: Arc<Session>,
}

struct AppModule;

impl FactoryModule for AppModule {
    fn register(builder: &mut RegistryBuilder) -> Result<()> {
        builder
            // Only needs Config from the root, so it lands in the root
            .register(FactoryDescriptor::topmost(|scope| {
                let config = scope.get::<Config>()?;
                Ok(Database {
                    url: config.database_url.clone(),
                })
            }))?
            // Needs the Session bound in the session scope
            .register(
                FactoryDescriptor::topmost(|scope| {
                    Ok(UserService {
                        db: scope.get::<Database>()?,
                        session: scope.get::<Session>()?,
                    })
                })
                .with_disposer(|service: &UserService| {
                    println!("  [App] Closing user service for {}", service.session.user);
                }),
            )?
            .register(FactoryDescriptor::unscoped(|scope| {
                Ok(RequestId(u64::from(scope.depth()) * 1000))
            }))?;
        Ok(())
    }
}

fn main() -> std::result::Result<(), DiError> {
    #[cfg(feature = "logging")]
    scope_injector::logging::init();

    println!("=== Scope Injector Logging Demo ===\n");

    let mut builder = FactoryRegistry::builder();
    builder.install::<AppModule>()?;

    // Logs: "Creating root scope"
    let root = Scope::root(builder.build());
    root.bind(Config {
        database_url: "postgres://localhost/app".into(),
    });

    // Logs: "Creating subscope"
    let session = root.create_subscope();
    session.bind(Session { user: "ada".into() });
    let request = session.create_subscope();

    // Logs: "Cached constructed instance" twice, Database at depth 0,
    // UserService at depth 1
    let users = request.get::<UserService>()?;
    println!("  [App] UserService for {} built", users.session.user);

    // Logs: "Instance resolved from scope cache"
    let _again = request.get::<UserService>()?;

    // Logs: "Created unscoped instance"
    let id = request.get::<RequestId>()?;
    println!("  [App] Request id {}", id.0);

    // Nothing provides a String, so the optional lookup comes back empty
    let missing = request.get_optional::<String>("")?;
    assert!(missing.is_none());

    // Logs: "No binding found in scope chain or registry"
    // Root cannot see the session, so UserService is out of reach there
    let err = root.get::<UserService>().err();
    println!("  [App] From root: {}", err.map(|e| e.to_string()).unwrap_or_default());

    // Logs: "Disposing scope", runs the UserService disposer
    session.dispose();
    assert!(request.is_disposed());

    println!("\n=== Demo Complete ===");
    println!("Tip: Use --features logging-json for production (JSON output)");
    println!("     Use --features logging-pretty for development (colorful output)");
    Ok(())
}
