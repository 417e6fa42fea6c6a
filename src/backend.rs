//! Backend SQL driver seam and connection pool.
//!
//! The SQL driver is an external collaborator; the core drives it through
//! [`Backend`] and never looks inside result blobs. Connections are
//! exclusive per in-flight unit group and are returned to the pool by the
//! guard's `Drop`, so release happens on every exit path.

use std::{
    collections::{HashMap, VecDeque},
    ops,
    pin::pin,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    Result,
    common::verbose,
    protocol::TypeId,
    unit::{ConfigOp, QueryUnit},
};

/// Result of a DDL statement: backend ids for types the statement created.
#[derive(Debug, Default)]
pub struct DdlResult {
    pub new_types: HashMap<String, TypeId>,
}

/// A backend SQL connection.
///
/// `last_state` tracks the session-state blob most recently applied to the
/// connection; the executor compares it against the view to decide whether
/// to resend state.
pub trait Backend: Send + Sized + 'static {
    type Config: Clone + Send + Sync + 'static;

    fn connect(config: &Self::Config) -> impl Future<Output = Result<Self>> + Send;

    fn last_state(&self) -> Option<&Bytes>;

    fn set_last_state(&mut self, state: Bytes);

    /// Execute SQL statements as one transactional batch, returning result
    /// data blocks for the engine to relay. `args` is the opaque
    /// bound-arguments blob.
    fn sql_execute(
        &mut self,
        sql: &[Bytes],
        args: &Bytes,
        state: Option<&Bytes>,
    ) -> impl Future<Output = Result<Vec<Bytes>>> + Send;

    /// Execute a DDL unit, collecting ids of newly created types.
    fn run_ddl(
        &mut self,
        unit: &QueryUnit,
        state: Option<&Bytes>,
    ) -> impl Future<Output = Result<DdlResult>> + Send;

    /// Parse and execute a query with JSON output in one step, for the
    /// HTTP adapter.
    fn parse_execute_json(
        &mut self,
        query: &str,
        variables: &serde_json::Value,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    /// Dedicated path for `CONFIGURE INSTANCE` operations.
    fn apply_system_config(
        &mut self,
        ops: &[ConfigOp],
    ) -> impl Future<Output = Result<()>> + Send;

    fn dump(&mut self) -> impl Future<Output = Result<Vec<Bytes>>> + Send;

    fn restore(&mut self, data: Bytes) -> impl Future<Output = Result<()>> + Send;
}

struct PoolState<B> {
    idle: VecDeque<B>,
    actives: usize,
}

struct PoolShared<B: Backend> {
    config: B::Config,
    max_conn: usize,
    state: Mutex<PoolState<B>>,
    notify: Notify,
}

/// Fixed-size pool of backend connections to one database.
pub struct Pool<B: Backend> {
    shared: Arc<PoolShared<B>>,
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Pool { shared: self.shared.clone() }
    }
}

impl<B: Backend> Pool<B> {
    pub fn new(config: B::Config, max_conn: usize) -> Pool<B> {
        Pool {
            shared: Arc::new(PoolShared {
                config,
                max_conn: max_conn.max(1),
                state: Mutex::new(PoolState { idle: VecDeque::new(), actives: 0 }),
                notify: Notify::new(),
            }),
        }
    }

    /// Borrow a connection, connecting a new one when under the limit,
    /// otherwise waiting for a release.
    pub async fn acquire(&self) -> Result<PoolConnection<B>> {
        loop {
            let connect = {
                let mut state = self.shared.state.lock();
                if let Some(conn) = state.idle.pop_front() {
                    verbose!("pool connection checkout");
                    return Ok(PoolConnection {
                        shared: self.shared.clone(),
                        conn: Some(conn),
                    });
                }
                if state.actives < self.shared.max_conn {
                    state.actives += 1;
                    true
                } else {
                    false
                }
            };

            if connect {
                match B::connect(&self.shared.config).await {
                    Ok(conn) => {
                        return Ok(PoolConnection {
                            shared: self.shared.clone(),
                            conn: Some(conn),
                        });
                    }
                    Err(err) => {
                        self.shared.state.lock().actives -= 1;
                        self.shared.notify.notify_one();
                        return Err(err);
                    }
                }
            }

            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            if !self.shared.state.lock().idle.is_empty() {
                continue;
            }
            notified.await;
        }
    }

    /// Drop every idle connection, e.g. when the database goes away.
    pub fn close_idle(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.idle.len();
        state.actives -= dropped;
        state.idle.clear();
        drop(state);
        if dropped > 0 {
            self.shared.notify.notify_waiters();
        }
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.shared.state.lock().actives
    }
}

/// A checked-out backend connection; returned to the pool on drop.
pub struct PoolConnection<B: Backend> {
    shared: Arc<PoolShared<B>>,
    conn: Option<B>,
}

impl<B: Backend> ops::Deref for PoolConnection<B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.conn.as_ref().expect("connection taken")
    }
}

impl<B: Backend> ops::DerefMut for PoolConnection<B> {
    fn deref_mut(&mut self) -> &mut B {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<B: Backend> Drop for PoolConnection<B> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.state.lock().idle.push_back(conn);
            self.shared.notify.notify_one();
        }
    }
}

/// Pools keyed by database name, sharing one base configuration.
pub struct PoolSet<B: Backend> {
    base_config: B::Config,
    max_conn_per_db: usize,
    pools: Mutex<HashMap<String, Pool<B>>>,
    configure: fn(&B::Config, &str) -> B::Config,
}

impl<B: Backend> PoolSet<B> {
    pub fn new(
        base_config: B::Config,
        max_conn_per_db: usize,
        configure: fn(&B::Config, &str) -> B::Config,
    ) -> PoolSet<B> {
        PoolSet {
            base_config,
            max_conn_per_db,
            pools: Mutex::new(HashMap::new()),
            configure,
        }
    }

    pub fn get(&self, database: &str) -> Pool<B> {
        self.pools
            .lock()
            .entry(database.to_string())
            .or_insert_with(|| {
                let config = (self.configure)(&self.base_config, database);
                Pool::new(config, self.max_conn_per_db)
            })
            .clone()
    }

    /// Close idle connections to a database that is being dropped or used
    /// as a creation template.
    pub fn close_database(&self, database: &str) {
        if let Some(pool) = self.pools.lock().remove(database) {
            pool.close_idle();
        }
    }
}
