//! Execution coordinator.
//!
//! Takes a compiled unit group, the bound-arguments blob and a session
//! view, borrows a backend connection and drives the units in order,
//! keeping the view's transaction frame and the connection's applied-state
//! bookkeeping consistent on every exit path.

use std::{collections::HashMap, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Result,
    backend::{Backend, PoolConnection, PoolSet},
    common::verbose,
    engine::CancelFlag,
    error::ErrorKind,
    protocol::TypeId,
    registry::Registry,
    unit::{CompiledQuery, QueryUnit},
    view::{ConnectionView, SideEffects},
};

/// Shared collaborators the coordinator needs for DDL bookkeeping.
pub struct ExecuteEnv<'a, B: Backend> {
    pub registry: &'a Arc<Registry>,
    pub pools: &'a PoolSet<B>,
    pub cancel: &'a CancelFlag,
}

/// Result of driving one unit group.
#[derive(Debug, Default)]
pub struct ExecuteOutcome {
    /// Result data blocks, relayed to the client in order.
    pub data: Vec<Bytes>,
    /// Status line per executed unit.
    pub statuses: Vec<Bytes>,
    pub side_effects: SideEffects,
}

/// Bound arguments with the compiler's implicitly injected extras
/// appended.
fn combined_args(compiled: &CompiledQuery, bind_args: &Bytes) -> Bytes {
    if compiled.first_extra.is_none() || compiled.extra_blobs.is_empty() {
        return bind_args.clone();
    }
    let mut combined = BytesMut::with_capacity(
        bind_args.len() + compiled.extra_blobs.iter().map(Bytes::len).sum::<usize>(),
    );
    combined.put_slice(bind_args);
    for blob in &compiled.extra_blobs {
        combined.put_slice(blob);
    }
    combined.freeze()
}

pub async fn execute<B: Backend>(
    env: &ExecuteEnv<'_, B>,
    compiled: &CompiledQuery,
    bind_args: &Bytes,
    view: &mut ConnectionView,
) -> Result<ExecuteOutcome> {
    let group = &compiled.group;

    if view.in_tx_error() && !group.is_rollback() {
        return Err(view.in_tx_error_message());
    }

    env.cancel.check()?;
    let pool = env.pools.get(view.database().name());
    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| err.context("acquiring backend connection"))?;
    env.cancel.check()?;

    let state = view.serialize_state();
    let mut pending_state = (conn.last_state() != Some(&state)).then_some(state);
    let args = combined_args(compiled, bind_args);

    let mut outcome = ExecuteOutcome::default();
    for unit in &group.units {
        view.start(unit)?;

        match drive_unit(env, view, &mut conn, unit, &args, &mut pending_state).await {
            Ok((data, new_types)) => {
                outcome.data.extend(data);
                outcome.statuses.push(unit.status.clone());
                outcome.side_effects |= view.on_success(unit, new_types)?;
            }
            Err(err) => {
                // a backend-side cancellation is only swallowed when this
                // connection is being cancelled anyway
                let err = if matches!(err.kind(), ErrorKind::BackendCancelled)
                    && env.cancel.is_cancelled()
                {
                    crate::error::Error::aborted()
                } else {
                    err
                };
                view.on_error(err.wire_message());
                // a failed COMMIT, or any error the backend answered by
                // rolling back on its own, leaves the backend out of the
                // transaction while the frame still exists
                let backend_left = matches!(
                    err.kind(),
                    ErrorKind::Backend(be) if be.left_transaction
                );
                if (backend_left || unit.tx_commit) && view.in_tx() {
                    view.abort_tx();
                }
                return Err(err);
            }
        }
        env.cancel.check()?;
    }

    if !view.in_tx() {
        let new_state = view.serialize_state();
        if conn.last_state() != Some(&new_state) {
            conn.set_last_state(new_state);
        }
    }

    Ok(outcome)
}

async fn drive_unit<B: Backend>(
    env: &ExecuteEnv<'_, B>,
    view: &ConnectionView,
    conn: &mut PoolConnection<B>,
    unit: &QueryUnit,
    args: &Bytes,
    pending_state: &mut Option<Bytes>,
) -> Result<(Vec<Bytes>, HashMap<String, TypeId>)> {
    // hooks ahead of the SQL
    if let Some(template) = &unit.create_db_template {
        env.pools.close_database(template);
    }
    if let Some(name) = &unit.drop_db {
        env.pools.close_database(name);
    }

    if unit.system_config {
        conn.apply_system_config(&unit.config_ops).await?;
        env.registry.apply_system_config(&unit.config_ops);
    }

    let mut new_types = HashMap::new();
    let mut data = Vec::new();

    if unit.ddl_stmt_id.is_some() {
        verbose!(ddl_stmt_id = unit.ddl_stmt_id.as_deref(), "run ddl");
        let result = conn.run_ddl(unit, pending_state.take().as_ref()).await?;
        new_types = result.new_types;
    } else if unit.is_transactional {
        data = conn
            .sql_execute(&unit.sql, args, pending_state.take().as_ref())
            .await?;
    } else {
        // non-transactional statements run one at a time, state with the
        // first only
        for sql in &unit.sql {
            let state = pending_state.take();
            data.extend(
                conn.sql_execute(std::slice::from_ref(sql), args, state.as_ref())
                    .await?,
            );
        }
    }

    // hooks after the SQL, each under its own guard
    if let Some(name) = &unit.create_db {
        env.registry.ensure(name);
    }
    if let Some(name) = &unit.drop_db {
        env.registry.drop_database(name);
        env.pools.close_database(name);
    }
    if let Some(name) = &unit.create_ns {
        view.database().create_namespace(name);
    }
    if let Some(name) = &unit.drop_ns {
        view.database().drop_namespace(name);
    }

    Ok((data, new_types))
}
