//! Thin HTTP adapter.
//!
//! The surrounding HTTP server owns request framing; this module only
//! maps an already-extracted body onto the core and shapes the JSON
//! answer. Queries over HTTP are read-only and stateless: globals and
//! module come from the request itself, never from a session.

use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backend::{Backend, PoolSet},
    error::{Error, ErrorKind},
    registry::{DEFAULT_NAMESPACE, Registry},
};

/// Body of `POST /{db}/edgeql`; a GET carries the same fields in the
/// query string and is parsed by the caller into this record.
#[derive(Debug, Deserialize)]
pub struct HttpQuery {
    pub query: String,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    #[serde(default)]
    pub globals: Option<serde_json::Value>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

fn error_response(err: &Error) -> HttpResponse {
    let kind = match err.kind() {
        ErrorKind::Protocol(_) => "ProtocolError",
        ErrorKind::UnsupportedFeature(_) => "UnsupportedFeatureError",
        ErrorKind::Authentication(_) => "AuthenticationError",
        ErrorKind::Access(_) => "AccessError",
        ErrorKind::DisabledCapability { .. } => "DisabledCapabilityError",
        ErrorKind::TypeSpecNotFound => "TypeSpecNotFoundError",
        ErrorKind::Transaction(_) => "TransactionError",
        ErrorKind::Backend(_) => "BackendError",
        ErrorKind::BackendCancelled => "BackendQueryCancelledError",
        ErrorKind::ConnectionAborted | ErrorKind::Io(_) => "ConnectionError",
        ErrorKind::Internal(_) => "InternalServerError",
    };
    let body = serde_json::json!({
        "error": {
            "message": err.wire_message(),
            "type": kind,
            "code": err.code(),
        }
    });
    HttpResponse { status: 400, body: body.to_string() }
}

/// Handle one `/{db}/edgeql` request.
pub async fn handle<B: Backend>(
    registry: &Arc<Registry>,
    pools: &PoolSet<B>,
    database: &str,
    body: &[u8],
) -> HttpResponse {
    match run_query::<B>(registry, pools, database, body).await {
        Ok(data) => HttpResponse {
            status: 200,
            body: serde_json::json!({ "data": data }).to_string(),
        },
        Err(err) => error_response(&err),
    }
}

async fn run_query<B: Backend>(
    registry: &Arc<Registry>,
    pools: &PoolSet<B>,
    database: &str,
    body: &[u8],
) -> Result<serde_json::Value, Error> {
    let request: HttpQuery = serde_json::from_slice(body)
        .map_err(|err| Error::from(ErrorKind::Protocol(
            crate::protocol::ProtocolError::Malformed("invalid request body"),
        ))
        .context(err.to_string()))?;

    if request.query.is_empty() {
        return Err(crate::protocol::ProtocolError::EmptyQuery.into());
    }
    if Registry::is_system_database(database) {
        return Err(Error::access(format!(
            "database {database:?} does not accept connections"
        )));
    }
    let db = registry
        .get(database)
        .ok_or_else(|| Error::access(format!("database {database:?} does not exist")))?;
    let namespace = request.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
    if !db.has_namespace(namespace) {
        return Err(Error::access(format!(
            "namespace {namespace:?} does not exist"
        )));
    }

    let variables = serde_json::json!({
        "variables": request.variables.unwrap_or(serde_json::Value::Null),
        "globals": request.globals.unwrap_or(serde_json::Value::Null),
        "module": request.module,
        "namespace": namespace,
        "limit": request.limit,
    });

    let pool = pools.get(database);
    let mut conn = pool.acquire().await?;
    let raw = conn.parse_execute_json(&request.query, &variables).await?;

    serde_json::from_slice(&raw)
        .map_err(|_| Error::internal("backend returned invalid json"))
}
