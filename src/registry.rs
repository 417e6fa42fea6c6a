//! Process-wide database catalog.
//!
//! The registry owns every [`Database`]; connection views hold `Arc`
//! handles into it and never own catalog state themselves. All schema
//! publication goes through the owning database's write lock so a `dbver`
//! bump, the compiled-cache invalidation and the backend-id merge are one
//! atomic step from any reader's point of view.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::{
    Result,
    cache::DEFAULT_STATEMENT_CACHE_SIZE,
    common::verbose,
    compiler::{CompileRequest, Compiler, Fingerprint},
    error::Error,
    protocol::{ProtocolVersion, TypeId},
    unit::{ConfigOp, QueryUnitGroup},
    view::ConnectionView,
};

/// Name of the namespace every database starts with.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Opaque schema blob handle. Compared by content identity via the
/// accompanying `dbver`, never inspected here.
pub type SchemaHandle = Arc<Bytes>;

/// Databases refused to ordinary client connections.
const SYSTEM_DATABASES: [&str; 1] = ["__template__"];

pub struct Registry {
    databases: RwLock<HashMap<String, Arc<Database>>>,
    system_config: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            databases: RwLock::new(HashMap::new()),
            system_config: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn is_system_database(name: &str) -> bool {
        SYSTEM_DATABASES.contains(&name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    /// Look up a database, creating it on first reference.
    pub fn ensure(&self, name: &str) -> Arc<Database> {
        if let Some(db) = self.get(name) {
            return db;
        }
        let mut databases = self.databases.write();
        databases
            .entry(name.to_string())
            .or_insert_with(|| Database::new(name))
            .clone()
    }

    pub fn drop_database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.write().remove(name)
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    pub fn apply_system_config(&self, ops: &[ConfigOp]) {
        let mut config = self.system_config.write();
        for op in ops {
            match &op.value {
                Some(value) => {
                    config.insert(op.name.clone(), value.clone());
                }
                None => {
                    config.remove(&op.name);
                }
            }
        }
    }

    pub fn system_config(&self) -> BTreeMap<String, serde_json::Value> {
        self.system_config.read().clone()
    }

    /// Create a session view over `db`. The view must be released with
    /// [`close_view`][Registry::close_view] on connection teardown.
    pub fn new_view(
        &self,
        db: &Arc<Database>,
        query_cache_enabled: bool,
        protocol_version: ProtocolVersion,
    ) -> ConnectionView {
        db.views.fetch_add(1, Ordering::SeqCst);
        ConnectionView::new(
            db.clone(),
            query_cache_enabled,
            protocol_version,
            DEFAULT_STATEMENT_CACHE_SIZE,
        )
    }

    pub fn close_view(&self, view: &ConnectionView) {
        view.database().views.fetch_sub(1, Ordering::SeqCst);
    }
}

struct NamespaceState {
    user_schema: SchemaHandle,
    reflection_cache: HashMap<String, Vec<String>>,
    backend_ids: HashMap<String, TypeId>,
    extensions: HashSet<String>,
    compiled: HashMap<Fingerprint, Arc<QueryUnitGroup>>,
}

impl NamespaceState {
    fn new() -> NamespaceState {
        NamespaceState {
            user_schema: Arc::new(Bytes::new()),
            reflection_cache: HashMap::new(),
            backend_ids: HashMap::new(),
            extensions: HashSet::new(),
            compiled: HashMap::new(),
        }
    }
}

struct DatabaseState {
    global_schema: SchemaHandle,
    config: BTreeMap<String, serde_json::Value>,
    namespaces: HashMap<String, NamespaceState>,
}

/// One named database: namespaces, schema version counter and the shared
/// compiled-query cache.
pub struct Database {
    name: String,
    dbver: AtomicU64,
    state: RwLock<DatabaseState>,
    // serializes schema introspection (single writer)
    introspection: tokio::sync::Mutex<()>,
    compiling: Mutex<HashSet<(String, Fingerprint)>>,
    compile_done: Notify,
    views: AtomicUsize,
}

impl Database {
    fn new(name: &str) -> Arc<Database> {
        let mut namespaces = HashMap::new();
        namespaces.insert(DEFAULT_NAMESPACE.to_string(), NamespaceState::new());
        Arc::new(Database {
            name: name.to_string(),
            dbver: AtomicU64::new(1),
            state: RwLock::new(DatabaseState {
                global_schema: Arc::new(Bytes::new()),
                config: BTreeMap::new(),
                namespaces,
            }),
            introspection: tokio::sync::Mutex::new(()),
            compiling: Mutex::new(HashSet::new()),
            compile_done: Notify::new(),
            views: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Monotonic schema version; bumped with every user-schema mutation.
    pub fn dbver(&self) -> u64 {
        self.dbver.load(Ordering::SeqCst)
    }

    pub fn view_count(&self) -> usize {
        self.views.load(Ordering::SeqCst)
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state.read().namespaces.contains_key(namespace)
    }

    pub fn create_namespace(&self, namespace: &str) {
        self.state
            .write()
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(NamespaceState::new);
    }

    pub fn drop_namespace(&self, namespace: &str) {
        self.state.write().namespaces.remove(namespace);
    }

    pub fn user_schema(&self, namespace: &str) -> Option<SchemaHandle> {
        self.state
            .read()
            .namespaces
            .get(namespace)
            .map(|ns| ns.user_schema.clone())
    }

    pub fn global_schema(&self) -> SchemaHandle {
        self.state.read().global_schema.clone()
    }

    pub fn backend_type_id(&self, namespace: &str, name: &str) -> Option<TypeId> {
        self.state
            .read()
            .namespaces
            .get(namespace)?
            .backend_ids
            .get(name)
            .copied()
    }

    pub fn config(&self) -> BTreeMap<String, serde_json::Value> {
        self.state.read().config.clone()
    }

    pub fn apply_config(&self, ops: &[ConfigOp]) {
        let mut state = self.state.write();
        for op in ops {
            match &op.value {
                Some(value) => {
                    state.config.insert(op.name.clone(), value.clone());
                }
                None => {
                    state.config.remove(&op.name);
                }
            }
        }
    }

    pub fn update_reflection_cache(
        &self,
        namespace: &str,
        cache: HashMap<String, Vec<String>>,
    ) {
        if let Some(ns) = self.state.write().namespaces.get_mut(namespace) {
            ns.reflection_cache = cache;
        }
    }

    pub fn reflection_cache(&self, namespace: &str) -> HashMap<String, Vec<String>> {
        self.state
            .read()
            .namespaces
            .get(namespace)
            .map(|ns| ns.reflection_cache.clone())
            .unwrap_or_default()
    }

    pub fn add_extension(&self, namespace: &str, extension: &str) {
        if let Some(ns) = self.state.write().namespaces.get_mut(namespace) {
            ns.extensions.insert(extension.to_string());
        }
    }

    pub fn has_extension(&self, namespace: &str, extension: &str) -> bool {
        self.state
            .read()
            .namespaces
            .get(namespace)
            .is_some_and(|ns| ns.extensions.contains(extension))
    }

    /// Install a committed schema mutation: new user schema, fresh backend
    /// type ids, a bumped `dbver` and an emptied compiled cache, all under
    /// one write lock.
    pub fn publish_schema(
        &self,
        namespace: &str,
        user_schema: Option<SchemaHandle>,
        new_types: &HashMap<String, TypeId>,
    ) {
        let mut state = self.state.write();
        let Some(ns) = state.namespaces.get_mut(namespace) else {
            return;
        };
        if let Some(schema) = user_schema {
            ns.user_schema = schema;
        }
        ns.backend_ids.extend(
            new_types.iter().map(|(name, id)| (name.clone(), *id)),
        );
        ns.compiled.clear();
        self.dbver.fetch_add(1, Ordering::SeqCst);
        verbose!(db = %self.name, namespace, "schema published");
    }

    pub fn publish_global_schema(&self, global_schema: SchemaHandle) {
        let mut state = self.state.write();
        state.global_schema = global_schema;
        self.dbver.fetch_add(1, Ordering::SeqCst);
    }

    pub fn lookup_compiled(
        &self,
        namespace: &str,
        key: &Fingerprint,
    ) -> Option<Arc<QueryUnitGroup>> {
        self.state
            .read()
            .namespaces
            .get(namespace)?
            .compiled
            .get(key)
            .cloned()
    }

    pub fn cache_compiled(
        &self,
        namespace: &str,
        key: Fingerprint,
        group: Arc<QueryUnitGroup>,
    ) {
        if let Some(ns) = self.state.write().namespaces.get_mut(namespace) {
            ns.compiled.insert(key, group);
        }
    }

    pub fn compiled_count(&self, namespace: &str) -> usize {
        self.state
            .read()
            .namespaces
            .get(namespace)
            .map(|ns| ns.compiled.len())
            .unwrap_or(0)
    }

    /// Serialize schema introspection: at most one task at a time.
    pub async fn introspection_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.introspection.lock().await
    }

    /// Compile through the shared cache with single-flight semantics: for
    /// any `(namespace, fingerprint)` at most one compilation is
    /// outstanding; concurrent requesters wait and re-check the cache.
    pub async fn compile_cached<C: Compiler>(
        &self,
        req: &CompileRequest,
        compiler: &C,
    ) -> Result<Arc<QueryUnitGroup>> {
        let key = (req.namespace.clone(), req.fingerprint());
        loop {
            if let Some(hit) = self.lookup_compiled(&req.namespace, &key.1) {
                verbose!(db = %self.name, "compiled cache hit");
                return Ok(hit);
            }

            if self.compiling.lock().insert(key.clone()) {
                let ticket = CompileTicket { db: self, key: &key };
                let group = compiler.compile(req).await.map(Arc::new);
                drop(ticket);
                let group = group?;
                if group.is_empty() {
                    return Err(Error::internal("compiler returned an empty unit group"));
                }
                if group.cacheable {
                    self.cache_compiled(&req.namespace, key.1, group.clone());
                }
                return Ok(group);
            }

            // another task holds the flight; register for its completion
            // before re-checking so the wakeup cannot be missed
            let mut notified = pin!(self.compile_done.notified());
            notified.as_mut().enable();
            if !self.compiling.lock().contains(&key) {
                continue;
            }
            notified.await;
        }
    }
}

struct CompileTicket<'a> {
    db: &'a Database,
    key: &'a (String, Fingerprint),
}

impl Drop for CompileTicket<'_> {
    fn drop(&mut self) {
        self.db.compiling.lock().remove(self.key);
        self.db.compile_done.notify_waiters();
    }
}
