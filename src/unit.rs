//! Compiled query records.
//!
//! The compiler hands back a group of units, each one an atomic backend
//! step. Units are plain tagged records: every behavior the executor keys
//! off is an explicit field, not a dynamic attribute.

use std::collections::HashMap;

use bytes::Bytes;

use crate::{caps::Capability, protocol::TypeId};

/// Requested/actual shape of the result set.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum Cardinality {
    #[default]
    NoResult = b'n',
    AtMostOne = b'o',
    One = b'A',
    Many = b'm',
    AtLeastOne = b'M',
}

impl Cardinality {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Output serialization format of a query.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum OutputFormat {
    Binary = b'b',
    Json = b'j',
    JsonElements = b'J',
    #[default]
    None = b'n',
}

impl OutputFormat {
    pub fn from_u8(raw: u8) -> Option<OutputFormat> {
        match raw {
            b'b' => Some(OutputFormat::Binary),
            b'j' => Some(OutputFormat::Json),
            b'J' => Some(OutputFormat::JsonElements),
            b'n' => Some(OutputFormat::None),
            _ => None,
        }
    }
}

/// Scope a configuration operation applies to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConfigScope {
    Session,
    Database,
    Instance,
}

/// One configuration mutation produced by the compiler.
#[derive(Clone, PartialEq, Debug)]
pub struct ConfigOp {
    pub scope: ConfigScope,
    pub name: String,
    /// `None` resets the setting.
    pub value: Option<serde_json::Value>,
}

/// Metadata for one declared query parameter.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Param {
    pub name: String,
    pub required: bool,
    pub array_type_id: Option<TypeId>,
    pub outer_idx: Option<usize>,
}

/// One atomic backend step.
#[derive(Clone, Debug, Default)]
pub struct QueryUnit {
    /// One or more SQL statements.
    pub sql: Vec<Bytes>,
    /// Status-line returned in `CommandComplete` on success. When the unit
    /// covers multiple source statements, reflects the last one.
    pub status: Bytes,
    pub output_format: OutputFormat,
    pub cardinality: Cardinality,
    pub capabilities: Capability,
    /// Set only for units cacheable as backend prepared statements.
    pub sql_hash: Bytes,
    /// False means the statements must be executed separately, outside a
    /// transaction.
    pub is_transactional: bool,
    pub cacheable: bool,

    pub in_type_id: TypeId,
    pub in_type_data: Bytes,
    pub in_type_args: Vec<Param>,
    pub out_type_id: TypeId,
    pub out_type_data: Bytes,

    /// Set when the unit starts an explicit transaction.
    pub tx_id: Option<u64>,
    pub tx_commit: bool,
    pub tx_rollback: bool,
    pub tx_savepoint_declare: bool,
    pub tx_savepoint_rollback: bool,
    pub sp_name: Option<String>,

    /// DDL statement marker; data packets from the backend are tagged with
    /// this id.
    pub ddl_stmt_id: Option<String>,
    pub create_db: Option<String>,
    pub drop_db: Option<String>,
    pub create_db_template: Option<String>,
    pub create_ns: Option<String>,
    pub drop_ns: Option<String>,
    /// Future user schema after this unit commits, as an opaque handle.
    pub user_schema: Option<Bytes>,
    pub global_schema: Option<Bytes>,

    pub system_config: bool,
    pub database_config: bool,
    pub set_global: bool,
    pub config_ops: Vec<ConfigOp>,
    pub modaliases: Option<HashMap<String, String>>,
    pub has_set: bool,
    pub has_role_ddl: bool,
    pub globals: Vec<String>,
}

impl QueryUnit {
    pub fn has_ddl(&self) -> bool {
        self.capabilities.contains(Capability::DDL)
    }

    /// True for COMMIT, ROLLBACK, START TRANSACTION and savepoint commands.
    pub fn tx_control(&self) -> bool {
        self.tx_id.is_some()
            || self.tx_commit
            || self.tx_rollback
            || self.tx_savepoint_declare
            || self.tx_savepoint_rollback
    }

    /// Units allowed to run while the transaction is in the failed state.
    pub fn is_rollback(&self) -> bool {
        self.tx_rollback || self.tx_savepoint_rollback
    }
}

/// Ordered, non-empty bundle of units sharing a capability union.
///
/// The group's outward type description and cardinality follow the last
/// appended unit.
#[derive(Clone, Debug, Default)]
pub struct QueryUnitGroup {
    pub capabilities: Capability,
    pub cacheable: bool,
    pub tx_control: bool,
    pub cardinality: Cardinality,
    pub in_type_id: TypeId,
    pub in_type_data: Bytes,
    pub in_type_args: Vec<Param>,
    pub out_type_id: TypeId,
    pub out_type_data: Bytes,
    pub globals: Vec<String>,
    pub units: Vec<QueryUnit>,
}

impl QueryUnitGroup {
    pub fn new() -> QueryUnitGroup {
        QueryUnitGroup { cacheable: true, ..Default::default() }
    }

    pub fn append(&mut self, unit: QueryUnit) {
        self.capabilities |= unit.capabilities;
        if !unit.cacheable {
            self.cacheable = false;
        }
        if unit.tx_control() {
            self.tx_control = true;
        }
        self.cardinality = unit.cardinality;
        self.in_type_id = unit.in_type_id;
        self.in_type_data = unit.in_type_data.clone();
        self.in_type_args = unit.in_type_args.clone();
        self.out_type_id = unit.out_type_id;
        self.out_type_data = unit.out_type_data.clone();
        self.globals.extend(unit.globals.iter().cloned());
        self.units.push(unit);
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// All units are rollbacks; such a group may run in a failed
    /// transaction.
    pub fn is_rollback(&self) -> bool {
        !self.units.is_empty() && self.units.iter().all(QueryUnit::is_rollback)
    }
}

/// Immutable compilation result: a unit group plus argument-embedding
/// metadata. Shared by many executions, never mutated after publication.
#[derive(Debug)]
pub struct CompiledQuery {
    pub group: std::sync::Arc<QueryUnitGroup>,
    /// Index of the first implicitly injected argument, if any.
    pub first_extra: Option<usize>,
    pub extra_counts: Vec<usize>,
    pub extra_blobs: Vec<Bytes>,
}

impl CompiledQuery {
    pub fn new(group: std::sync::Arc<QueryUnitGroup>) -> CompiledQuery {
        CompiledQuery {
            group,
            first_extra: None,
            extra_counts: Vec::new(),
            extra_blobs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn group_append_folds_metadata() {
        let mut group = QueryUnitGroup::new();

        group.append(QueryUnit {
            capabilities: Capability::MODIFICATIONS,
            cacheable: true,
            cardinality: Cardinality::Many,
            ..Default::default()
        });
        group.append(QueryUnit {
            capabilities: Capability::DDL,
            cacheable: false,
            tx_commit: true,
            cardinality: Cardinality::NoResult,
            ..Default::default()
        });

        assert_eq!(
            group.capabilities,
            Capability::MODIFICATIONS | Capability::DDL
        );
        assert!(!group.cacheable);
        assert!(group.tx_control);
        // follows the last unit
        assert_eq!(group.cardinality, Cardinality::NoResult);
        assert_eq!(group.units.len(), 2);
    }

    #[test]
    fn rollback_only_group() {
        let mut group = QueryUnitGroup::new();
        group.append(QueryUnit { tx_rollback: true, ..Default::default() });
        assert!(group.is_rollback());

        group.append(QueryUnit::default());
        assert!(!group.is_rollback());
    }
}
