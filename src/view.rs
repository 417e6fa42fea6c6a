//! Per-connection session state.
//!
//! A view owns everything a single client session can see or change:
//! module aliases, session configuration, globals, the capability mask and
//! the compiled statement cache. Mutations are staged in a transaction
//! frame (implicit around a single unit, or explicit between BEGIN and
//! COMMIT) and only published to the shared [`Database`] on commit.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    ops,
    sync::Arc,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Result,
    cache::StatementsCache,
    caps::Capability,
    common::verbose,
    compiler::Fingerprint,
    error::Error,
    protocol::{ProtocolVersion, TypeId, ext::BufMutExt},
    registry::{Database, SchemaHandle},
    unit::{CompiledQuery, ConfigOp, ConfigScope, QueryUnit},
};

/// What a committed unit changed outside the session, reported upward so
/// observers (sibling connections, config listeners) can react.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SideEffects(u8);

impl SideEffects {
    pub const NONE: SideEffects = SideEffects(0);
    pub const SCHEMA_CHANGES: SideEffects = SideEffects(1 << 0);
    pub const DATABASE_CONFIG_CHANGES: SideEffects = SideEffects(1 << 1);
    pub const INSTANCE_CONFIG_CHANGES: SideEffects = SideEffects(1 << 2);
    pub const ROLE_CHANGES: SideEffects = SideEffects(1 << 3);
    pub const GLOBAL_SCHEMA_CHANGES: SideEffects = SideEffects(1 << 4);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: SideEffects) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for SideEffects {
    type Output = SideEffects;

    fn bitor(self, rhs: SideEffects) -> SideEffects {
        SideEffects(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for SideEffects {
    fn bitor_assign(&mut self, rhs: SideEffects) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SideEffects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SideEffects({:#07b})", self.0)
    }
}

#[derive(Clone)]
struct Savepoint {
    name: String,
    config: BTreeMap<String, serde_json::Value>,
    globals: BTreeMap<String, Bytes>,
    modaliases: BTreeMap<String, String>,
    user_schema: Option<SchemaHandle>,
    global_schema: Option<SchemaHandle>,
    new_types: HashMap<String, TypeId>,
    pending_db_config: Vec<ConfigOp>,
    flags: FrameFlags,
}

#[derive(Clone, Copy, Default)]
struct FrameFlags {
    with_ddl: bool,
    with_role_ddl: bool,
    with_sysconfig: bool,
    with_dbconfig: bool,
    with_set: bool,
}

struct TransactionFrame {
    txid: u64,
    implicit: bool,
    // session-visible overlays; merged into the view on commit
    config: BTreeMap<String, serde_json::Value>,
    globals: BTreeMap<String, Bytes>,
    modaliases: BTreeMap<String, String>,
    // pending publications
    user_schema: Option<SchemaHandle>,
    base_user_schema: SchemaHandle,
    global_schema: Option<SchemaHandle>,
    new_types: HashMap<String, TypeId>,
    pending_db_config: Vec<ConfigOp>,
    savepoints: Vec<Savepoint>,
    flags: FrameFlags,
    tx_error: Option<String>,
}

/// Session state of one client connection.
pub struct ConnectionView {
    db: Arc<Database>,
    namespace: String,
    protocol_version: ProtocolVersion,
    capability_mask: Capability,
    query_cache_enabled: bool,
    config: BTreeMap<String, serde_json::Value>,
    globals: BTreeMap<String, Bytes>,
    modaliases: BTreeMap<String, String>,
    cache: StatementsCache,
    tx: Option<TransactionFrame>,
    next_txid: u64,
}

impl ConnectionView {
    pub(crate) fn new(
        db: Arc<Database>,
        query_cache_enabled: bool,
        protocol_version: ProtocolVersion,
        cache_size: usize,
    ) -> ConnectionView {
        ConnectionView {
            db,
            namespace: crate::registry::DEFAULT_NAMESPACE.to_string(),
            protocol_version,
            capability_mask: Capability::ALL,
            query_cache_enabled,
            config: BTreeMap::new(),
            globals: BTreeMap::new(),
            modaliases: BTreeMap::new(),
            cache: StatementsCache::new(cache_size),
            tx: None,
            next_txid: 1,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn capability_mask(&self) -> Capability {
        self.capability_mask
    }

    pub fn set_capability_mask(&mut self, mask: Capability) {
        self.capability_mask = mask;
    }

    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    pub fn in_explicit_tx(&self) -> bool {
        self.tx.as_ref().is_some_and(|frame| !frame.implicit)
    }

    pub fn in_tx_error(&self) -> bool {
        self.tx.as_ref().is_some_and(|frame| frame.tx_error.is_some())
    }

    pub fn in_tx_with_ddl(&self) -> bool {
        self.tx.as_ref().is_some_and(|frame| frame.flags.with_ddl)
    }

    pub fn txid(&self) -> Option<u64> {
        self.tx.as_ref().map(|frame| frame.txid)
    }

    /// Transaction status byte for `ReadyForQuery`.
    pub fn tx_status(&self) -> u8 {
        match &self.tx {
            None => b'I',
            Some(frame) if frame.tx_error.is_some() => b'E',
            Some(_) => b'T',
        }
    }

    /// The error every non-rollback operation gets while the transaction
    /// is in the failed state.
    pub fn in_tx_error_message(&self) -> Error {
        let detail = self
            .tx
            .as_ref()
            .and_then(|frame| frame.tx_error.as_deref())
            .unwrap_or("unknown error");
        Error::transaction(format!(
            "current transaction is aborted, commands ignored until \
             end of transaction block: {detail}"
        ))
    }

    fn begin_frame(&mut self, implicit: bool) {
        let txid = self.next_txid;
        self.next_txid += 1;
        verbose!(txid, implicit, "transaction frame start");
        self.tx = Some(TransactionFrame {
            txid,
            implicit,
            config: self.config.clone(),
            globals: self.globals.clone(),
            modaliases: self.modaliases.clone(),
            user_schema: None,
            base_user_schema: self
                .db
                .user_schema(&self.namespace)
                .unwrap_or_else(|| Arc::new(Bytes::new())),
            global_schema: None,
            new_types: HashMap::new(),
            pending_db_config: Vec::new(),
            savepoints: Vec::new(),
            flags: FrameFlags::default(),
            tx_error: None,
        });
    }

    /// Stage a unit: open a frame if none is active and record the state
    /// classes the unit intends to touch.
    pub fn start(&mut self, unit: &QueryUnit) -> Result<()> {
        if self.in_tx_error() && !unit.is_rollback() {
            return Err(self.in_tx_error_message());
        }

        if self.tx.is_none() {
            self.begin_frame(unit.tx_id.is_none());
        } else if unit.tx_id.is_some() {
            let frame = self.tx.as_mut().expect("checked above");
            if frame.implicit {
                frame.implicit = false;
            } else {
                return Err(Error::transaction(
                    "already in an explicit transaction block",
                ));
            }
        }

        let frame = self.tx.as_mut().expect("frame opened above");
        if unit.has_ddl() {
            frame.flags.with_ddl = true;
        }
        if unit.has_role_ddl {
            frame.flags.with_role_ddl = true;
        }
        if unit.system_config {
            frame.flags.with_sysconfig = true;
        }
        if unit.database_config {
            frame.flags.with_dbconfig = true;
        }
        if unit.has_set || unit.set_global {
            frame.flags.with_set = true;
        }
        Ok(())
    }

    /// Absorb a successfully executed unit, publishing upward when it ends
    /// the transaction.
    pub fn on_success(
        &mut self,
        unit: &QueryUnit,
        new_types: HashMap<String, TypeId>,
    ) -> Result<SideEffects> {
        {
            let frame = self
                .tx
                .as_mut()
                .ok_or_else(|| Error::internal("on_success outside a transaction"))?;

            if let Some(aliases) = &unit.modaliases {
                frame.modaliases = aliases.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            }
            for op in &unit.config_ops {
                match op.scope {
                    ConfigScope::Session => match &op.value {
                        Some(value) => {
                            frame.config.insert(op.name.clone(), value.clone());
                        }
                        None => {
                            frame.config.remove(&op.name);
                        }
                    },
                    ConfigScope::Database => frame.pending_db_config.push(op.clone()),
                    // instance scope is applied by the coordinator through
                    // the dedicated backend path
                    ConfigScope::Instance => {}
                }
            }
            if let Some(schema) = &unit.user_schema {
                frame.user_schema = Some(Arc::new(schema.clone()));
            }
            if let Some(schema) = &unit.global_schema {
                frame.global_schema = Some(Arc::new(schema.clone()));
            }
            frame.new_types.extend(new_types);
        }

        if unit.tx_savepoint_declare {
            let name = unit
                .sp_name
                .clone()
                .ok_or_else(|| Error::internal("savepoint unit without a name"))?;
            self.declare_savepoint(&name)?;
        }
        if unit.tx_savepoint_rollback {
            let name = unit
                .sp_name
                .clone()
                .ok_or_else(|| Error::internal("savepoint unit without a name"))?;
            self.rollback_tx_to_savepoint(&name)?;
            return Ok(SideEffects::NONE);
        }
        if unit.tx_rollback {
            self.abort_tx();
            return Ok(SideEffects::NONE);
        }

        let frame = self.tx.as_ref().expect("frame still open");
        if frame.implicit || unit.tx_commit {
            self.commit_frame()
        } else {
            Ok(SideEffects::NONE)
        }
    }

    fn commit_frame(&mut self) -> Result<SideEffects> {
        let frame = self.tx.take().expect("commit without a frame");
        let mut side = SideEffects::NONE;

        match frame.user_schema {
            // a pending schema identical to the frame's base is a no-op
            Some(schema) if !Arc::ptr_eq(&schema, &frame.base_user_schema) => {
                side |= SideEffects::SCHEMA_CHANGES;
                self.db
                    .publish_schema(&self.namespace, Some(schema), &frame.new_types);
            }
            None if !frame.new_types.is_empty() => {
                self.db
                    .publish_schema(&self.namespace, None, &frame.new_types);
            }
            _ => {}
        }
        if let Some(global_schema) = frame.global_schema {
            self.db.publish_global_schema(global_schema);
            side |= SideEffects::GLOBAL_SCHEMA_CHANGES;
        }
        if !frame.pending_db_config.is_empty() {
            self.db.apply_config(&frame.pending_db_config);
        }
        if frame.flags.with_dbconfig || !frame.pending_db_config.is_empty() {
            side |= SideEffects::DATABASE_CONFIG_CHANGES;
        }
        if frame.flags.with_sysconfig {
            side |= SideEffects::INSTANCE_CONFIG_CHANGES;
        }
        if frame.flags.with_role_ddl {
            side |= SideEffects::ROLE_CHANGES;
        }
        if frame.flags.with_ddl {
            self.cache.apply_ddl_evictions();
        }

        self.config = frame.config;
        self.globals = frame.globals;
        self.modaliases = frame.modaliases;
        verbose!(txid = frame.txid, "transaction frame committed");
        Ok(side)
    }

    /// Record a failed unit. An implicit frame is discarded outright; an
    /// explicit one enters the failed state until rolled back.
    pub fn on_error(&mut self, message: impl Into<String>) {
        let implicit = match &self.tx {
            Some(frame) => frame.implicit,
            None => return,
        };
        if implicit {
            self.tx = None;
        } else {
            let frame = self.tx.as_mut().expect("checked above");
            frame.tx_error = Some(message.into());
        }
    }

    /// Discard the frame without publishing anything.
    pub fn abort_tx(&mut self) {
        self.tx = None;
    }

    pub fn declare_savepoint(&mut self, name: &str) -> Result<()> {
        let frame = self.tx.as_mut().ok_or_else(|| {
            Error::transaction("savepoints can only be used in transaction blocks")
        })?;
        if frame.implicit {
            return Err(Error::transaction(
                "savepoints can only be used in transaction blocks",
            ));
        }
        frame.savepoints.push(Savepoint {
            name: name.to_string(),
            config: frame.config.clone(),
            globals: frame.globals.clone(),
            modaliases: frame.modaliases.clone(),
            user_schema: frame.user_schema.clone(),
            global_schema: frame.global_schema.clone(),
            new_types: frame.new_types.clone(),
            pending_db_config: frame.pending_db_config.clone(),
            flags: frame.flags,
        });
        Ok(())
    }

    /// Pop savepoints above and including `name`, reinstating the named
    /// snapshot. Preserves the frame and clears the failed state.
    pub fn rollback_tx_to_savepoint(&mut self, name: &str) -> Result<()> {
        let frame = self.tx.as_mut().ok_or_else(|| {
            Error::transaction("savepoints can only be used in transaction blocks")
        })?;
        if frame.implicit {
            return Err(Error::transaction(
                "savepoints can only be used in transaction blocks",
            ));
        }
        let Some(at) = frame.savepoints.iter().rposition(|sp| sp.name == name) else {
            return Err(Error::transaction(format!("there is no {name:?} savepoint")));
        };
        frame.savepoints.truncate(at + 1);
        let sp = frame.savepoints.pop().expect("found above");
        frame.config = sp.config;
        frame.globals = sp.globals;
        frame.modaliases = sp.modaliases;
        frame.user_schema = sp.user_schema;
        frame.global_schema = sp.global_schema;
        frame.new_types = sp.new_types;
        frame.pending_db_config = sp.pending_db_config;
        frame.flags = sp.flags;
        frame.tx_error = None;
        Ok(())
    }

    /// Pop savepoints above and including `name` without restoring state.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let frame = self.tx.as_mut().ok_or_else(|| {
            Error::transaction("savepoints can only be used in transaction blocks")
        })?;
        let Some(at) = frame.savepoints.iter().rposition(|sp| sp.name == name) else {
            return Err(Error::transaction(format!("there is no {name:?} savepoint")));
        };
        frame.savepoints.truncate(at);
        Ok(())
    }

    /// Compiled-query lookup through the per-view cache, falling back to
    /// the database's shared cache.
    ///
    /// Bypassed entirely inside a transaction that has run DDL: the
    /// compiler must observe the uncommitted schema.
    pub fn lookup_compiled_query(&mut self, key: Fingerprint) -> Option<Arc<CompiledQuery>> {
        if !self.query_cache_enabled || self.in_tx_with_ddl() {
            return None;
        }
        let dbver = self.db.dbver();
        if let Some(hit) = self.cache.get(&key, dbver) {
            return Some(hit);
        }
        let group = self.db.lookup_compiled(&self.namespace, &key)?;
        let query = Arc::new(CompiledQuery::new(group));
        self.cache.insert(key, dbver, query.clone());
        Some(query)
    }

    pub fn cache_compiled_query(&mut self, key: Fingerprint, query: Arc<CompiledQuery>) {
        if !self.query_cache_enabled || self.in_tx_with_ddl() || !query.group.cacheable {
            return;
        }
        // statements carrying DDL must not outlive the next DDL boundary
        if query.group.capabilities.contains(Capability::DDL) {
            self.cache.add_to_remove_on_ddl(key);
        }
        self.cache.insert(key, self.db.dbver(), query);
        while self.cache.needs_cleanup() {
            self.cache.cleanup_one();
        }
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Bytes) {
        match &mut self.tx {
            Some(frame) => frame.globals.insert(name.into(), value),
            None => self.globals.insert(name.into(), value),
        };
    }

    pub fn unset_global(&mut self, name: &str) {
        match &mut self.tx {
            Some(frame) => frame.globals.remove(name),
            None => self.globals.remove(name),
        };
    }

    /// Opaque, deterministic blob of the session-visible state. Equal
    /// states serialize to equal blobs, which is what decides whether a
    /// backend connection needs its state re-applied.
    pub fn serialize_state(&self) -> Bytes {
        let (config, globals, modaliases) = match &self.tx {
            Some(frame) => (&frame.config, &frame.globals, &frame.modaliases),
            None => (&self.config, &self.globals, &self.modaliases),
        };

        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_lp_str(&self.namespace);

        buf.put_u32(modaliases.len() as u32);
        for (alias, module) in modaliases {
            buf.put_lp_str(alias);
            buf.put_lp_str(module);
        }

        buf.put_u32(config.len() as u32);
        for (name, value) in config {
            buf.put_lp_str(name);
            buf.put_lp_str(&value.to_string());
        }

        buf.put_u32(globals.len() as u32);
        for (name, value) in globals {
            buf.put_lp_str(name);
            buf.put_lp_bytes(value);
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::{DEFAULT_NAMESPACE, Registry};

    fn view() -> ConnectionView {
        let registry = Registry::new();
        let db = registry.ensure("main");
        registry.new_view(&db, true, crate::protocol::MAX_PROTOCOL)
    }

    fn begin_unit() -> QueryUnit {
        QueryUnit {
            tx_id: Some(1),
            capabilities: Capability::TRANSACTION,
            ..Default::default()
        }
    }

    fn commit_unit() -> QueryUnit {
        QueryUnit {
            tx_commit: true,
            capabilities: Capability::TRANSACTION,
            ..Default::default()
        }
    }

    #[test]
    fn implicit_frame_around_plain_unit() {
        let mut view = view();
        let unit = QueryUnit::default();

        assert!(!view.in_tx());
        view.start(&unit).unwrap();
        assert!(view.in_tx());
        view.on_success(&unit, HashMap::new()).unwrap();
        assert!(!view.in_tx());
    }

    #[test]
    fn explicit_tx_lifecycle() {
        let mut view = view();

        let begin = begin_unit();
        view.start(&begin).unwrap();
        view.on_success(&begin, HashMap::new()).unwrap();
        assert!(view.in_explicit_tx());
        assert_eq!(view.tx_status(), b'T');

        let select = QueryUnit::default();
        view.start(&select).unwrap();
        view.on_success(&select, HashMap::new()).unwrap();
        assert!(view.in_tx());

        let commit = commit_unit();
        view.start(&commit).unwrap();
        view.on_success(&commit, HashMap::new()).unwrap();
        assert!(!view.in_tx());
        assert_eq!(view.tx_status(), b'I');
    }

    #[test]
    fn nested_begin_fails() {
        let mut view = view();
        let begin = begin_unit();
        view.start(&begin).unwrap();
        view.on_success(&begin, HashMap::new()).unwrap();

        let mut again = begin_unit();
        again.tx_id = Some(2);
        assert!(view.start(&again).is_err());
    }

    #[test]
    fn error_state_blocks_until_rollback() {
        let mut view = view();
        let begin = begin_unit();
        view.start(&begin).unwrap();
        view.on_success(&begin, HashMap::new()).unwrap();

        let failing = QueryUnit::default();
        view.start(&failing).unwrap();
        view.on_error("division by zero");
        assert!(view.in_tx_error());
        assert_eq!(view.tx_status(), b'E');

        // ordinary unit is refused
        assert!(view.start(&QueryUnit::default()).is_err());

        // rollback passes and resets to idle
        let rollback = QueryUnit { tx_rollback: true, ..Default::default() };
        view.start(&rollback).unwrap();
        view.on_success(&rollback, HashMap::new()).unwrap();
        assert!(!view.in_tx());

        // and new work is accepted again
        let unit = QueryUnit::default();
        view.start(&unit).unwrap();
        view.on_success(&unit, HashMap::new()).unwrap();
    }

    #[test]
    fn implicit_frame_discarded_on_error() {
        let mut view = view();
        view.start(&QueryUnit::default()).unwrap();
        view.on_error("boom");
        assert!(!view.in_tx());
        assert_eq!(view.tx_status(), b'I');
    }

    #[test]
    fn savepoint_rollback_restores_state_and_clears_error() {
        let mut view = view();
        let begin = begin_unit();
        view.start(&begin).unwrap();
        view.on_success(&begin, HashMap::new()).unwrap();

        let set_a = QueryUnit {
            config_ops: vec![ConfigOp {
                scope: ConfigScope::Session,
                name: "a".into(),
                value: Some(serde_json::json!(1)),
            }],
            has_set: true,
            ..Default::default()
        };
        view.start(&set_a).unwrap();
        view.on_success(&set_a, HashMap::new()).unwrap();

        let declare = QueryUnit {
            tx_savepoint_declare: true,
            sp_name: Some("sp1".into()),
            ..Default::default()
        };
        view.start(&declare).unwrap();
        view.on_success(&declare, HashMap::new()).unwrap();

        let set_b = QueryUnit {
            config_ops: vec![ConfigOp {
                scope: ConfigScope::Session,
                name: "b".into(),
                value: Some(serde_json::json!(2)),
            }],
            has_set: true,
            ..Default::default()
        };
        view.start(&set_b).unwrap();
        view.on_success(&set_b, HashMap::new()).unwrap();
        let with_b = view.serialize_state();

        view.on_error("constraint violation");
        assert!(view.in_tx_error());

        let rollback_sp = QueryUnit {
            tx_savepoint_rollback: true,
            sp_name: Some("sp1".into()),
            ..Default::default()
        };
        view.start(&rollback_sp).unwrap();
        view.on_success(&rollback_sp, HashMap::new()).unwrap();

        assert!(view.in_tx());
        assert!(!view.in_tx_error());
        // `b` is gone, `a` survives
        assert_ne!(view.serialize_state(), with_b);

        // savepoint popped: second rollback to it fails
        assert!(view.rollback_tx_to_savepoint("sp1").is_err());
    }

    #[test]
    fn release_savepoint_pops_without_restoring() {
        let mut view = view();
        let begin = begin_unit();
        view.start(&begin).unwrap();
        view.on_success(&begin, HashMap::new()).unwrap();

        view.declare_savepoint("a").unwrap();
        view.set_global("g", Bytes::from_static(b"1"));
        view.declare_savepoint("b").unwrap();
        let current = view.serialize_state();

        view.release_savepoint("a").unwrap();
        // releasing keeps the current state and forgets both savepoints
        assert_eq!(view.serialize_state(), current);
        assert!(view.rollback_tx_to_savepoint("b").is_err());
        assert!(view.release_savepoint("a").is_err());
    }

    #[test]
    fn savepoints_require_explicit_tx() {
        let mut view = view();
        view.start(&QueryUnit::default()).unwrap();
        assert!(view.declare_savepoint("sp").is_err());
    }

    #[test]
    fn commit_publishes_schema_and_reports_side_effects() {
        let registry = Registry::new();
        let db = registry.ensure("main");
        let mut view = registry.new_view(&db, true, crate::protocol::MAX_PROTOCOL);
        let before = db.dbver();

        let ddl = QueryUnit {
            capabilities: Capability::DDL,
            user_schema: Some(Bytes::from_static(b"schema-v2")),
            ..Default::default()
        };
        view.start(&ddl).unwrap();
        let mut new_types = HashMap::new();
        new_types.insert("default::Foo".to_string(), TypeId([9; 16]));
        let side = view.on_success(&ddl, new_types).unwrap();

        assert!(side.contains(SideEffects::SCHEMA_CHANGES));
        assert!(db.dbver() > before);
        assert_eq!(
            db.backend_type_id(DEFAULT_NAMESPACE, "default::Foo"),
            Some(TypeId([9; 16]))
        );
    }

    #[test]
    fn uncommitted_ddl_bypasses_query_cache() {
        let registry = Registry::new();
        let db = registry.ensure("main");
        let mut view = registry.new_view(&db, true, crate::protocol::MAX_PROTOCOL);

        let key = crate::compiler::CompileRequest::new("SELECT 1", DEFAULT_NAMESPACE)
            .fingerprint();
        let query = Arc::new(CompiledQuery::new(Arc::new({
            let mut g = crate::unit::QueryUnitGroup::new();
            g.append(QueryUnit { cacheable: true, ..Default::default() });
            g
        })));
        view.cache_compiled_query(key, query);
        assert!(view.lookup_compiled_query(key).is_some());

        let begin = begin_unit();
        view.start(&begin).unwrap();
        view.on_success(&begin, HashMap::new()).unwrap();
        let ddl = QueryUnit { capabilities: Capability::DDL, ..Default::default() };
        view.start(&ddl).unwrap();

        assert!(view.in_tx_with_ddl());
        assert!(view.lookup_compiled_query(key).is_none());
    }

    #[test]
    fn serialize_state_is_deterministic() {
        let mut a = view();
        let mut b = view();

        a.set_global("cur_user", Bytes::from_static(b"alice"));
        b.set_global("cur_user", Bytes::from_static(b"alice"));
        assert_eq!(a.serialize_state(), b.serialize_state());

        b.set_global("cur_user", Bytes::from_static(b"bob"));
        assert_ne!(a.serialize_state(), b.serialize_state());

        b.set_global("cur_user", Bytes::from_static(b"alice"));
        b.set_namespace("other");
        assert_ne!(a.serialize_state(), b.serialize_state());
    }

    #[test]
    fn failed_commit_discards_frame() {
        let mut view = view();
        let begin = begin_unit();
        view.start(&begin).unwrap();
        view.on_success(&begin, HashMap::new()).unwrap();

        // the backend reported leaving the transaction; coordinator calls
        // abort_tx and the session is idle again
        view.abort_tx();
        assert!(!view.in_tx());
        assert_eq!(view.tx_status(), b'I');
    }
}
