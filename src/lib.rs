//! `quel` — database server front-end core.
//!
//! The per-connection binary protocol engine and database-view registry of
//! a schema-full database server: framed messages in, compiled query units
//! out to a backend SQL pool, with session state (transactions,
//! savepoints, aliases, config, globals) tracked per connection and a
//! shared, schema-version-keyed compiled-query cache per database.
//!
//! # Examples
//!
//! Serving connections over TCP:
//!
//! ```no_run
//! use std::sync::Arc;
//! use quel::{AuthConfig, Listener, PoolSet, Registry, ServerEnv};
//!
//! # async fn app<MyCompiler, MyBackend>(compiler: MyCompiler, backend_config: <MyBackend as quel::Backend>::Config)
//! # -> quel::Result<()>
//! # where
//! #     MyCompiler: quel::Compiler + Send + Sync + 'static,
//! #     MyBackend: quel::Backend + Send + Sync,
//! #     <MyBackend as quel::Backend>::Config: Send + Sync,
//! # {
//! let registry = Registry::new();
//! registry.ensure("main");
//!
//! let env = Arc::new(ServerEnv {
//!     registry,
//!     compiler,
//!     pools: PoolSet::<MyBackend>::new(backend_config, 8, |base, _db| base.clone()),
//!     auth: AuthConfig::trust_all(),
//!     suggested_pool_concurrency: 8,
//! });
//!
//! let listener = Listener::bind_tcp("127.0.0.1:5656").await?;
//! quel::serve(listener, env).await
//! # }
//! ```

pub mod common;
mod net;

// Protocol
pub mod buffer;
pub mod protocol;

// Component
pub mod cache;
pub mod caps;
pub mod compiler;
pub mod unit;

// State
pub mod registry;
pub mod view;

// Operation
pub mod backend;
pub mod engine;
pub mod execute;
pub mod http;

mod error;

#[doc(inline)]
pub use backend::{Backend, Pool, PoolSet};
#[doc(inline)]
pub use caps::Capability;
#[doc(inline)]
pub use compiler::{CompileRequest, Compiler, Fingerprint};
#[doc(inline)]
pub use engine::{AuthConfig, AuthMethod, CancelFlag, Engine, ServerEnv, serve};
#[doc(inline)]
pub use error::{BackendError, Error, ErrorKind, Result};
pub use net::{Listener, Socket, Transport};
#[doc(inline)]
pub use protocol::{ProtocolVersion, TypeId};
#[doc(inline)]
pub use registry::{Database, Registry};
#[doc(inline)]
pub use unit::{QueryUnit, QueryUnitGroup};
#[doc(inline)]
pub use view::{ConnectionView, SideEffects};
