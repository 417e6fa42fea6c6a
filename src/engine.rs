//! Per-connection protocol engine.
//!
//! One engine instance drives one client connection: version negotiation,
//! authentication, then the main dispatch loop over framed messages. The
//! engine owns the connection's [`ConnectionView`] and coordinates the
//! compiler, the shared registry and the backend pool.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    Result,
    backend::{Backend, PoolSet},
    buffer::{ReadBuffer, WriteBuffer},
    common::verbose,
    compiler::{CompileRequest, Compiler, Fingerprint},
    error::Error,
    execute::{ExecuteEnv, ExecuteOutcome, execute},
    net::Transport,
    protocol::{
        ProtocolError, ProtocolVersion,
        client::{self, ClientProtocol, ParsePart, QueryOptions},
        server::{self, SEVERITY_ERROR},
    },
    registry::Registry,
    unit::{CompiledQuery, OutputFormat},
    view::ConnectionView,
};

pub mod auth;
mod handshake;

pub use auth::{AuthConfig, AuthMethod, ScramContinue, Verifier};

/// Cooperative cancellation flag, checked at every suspension point.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::aborted())
        } else {
            Ok(())
        }
    }
}

/// Shared collaborators handed to every engine; explicit, never ambient.
pub struct ServerEnv<C, B: Backend> {
    pub registry: Arc<Registry>,
    pub compiler: C,
    pub pools: PoolSet<B>,
    pub auth: AuthConfig,
    pub suggested_pool_concurrency: usize,
}

enum Flow {
    Continue,
    Terminate,
}

pub struct Engine<IO, C, B: Backend> {
    io: IO,
    transport: Transport,
    env: Arc<ServerEnv<C, B>>,
    rbuf: ReadBuffer,
    wbuf: WriteBuffer,
    cancel: CancelFlag,
    protocol_version: ProtocolVersion,
    view: Option<ConnectionView>,
    /// The last anonymously parsed statement, target of `E` and legacy
    /// `D`.
    last_parse: Option<(Fingerprint, Arc<CompiledQuery>)>,
    /// Set by handlers that answer errors with an immediate
    /// `ReadyForQuery` instead of the recovery sub-loop.
    flush_sync_on_error: bool,
}

impl<IO, C, B> Engine<IO, C, B>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
    C: Compiler,
    B: Backend,
{
    pub fn new(io: IO, env: Arc<ServerEnv<C, B>>, transport: Transport) -> Engine<IO, C, B> {
        Engine {
            io,
            transport,
            env,
            rbuf: ReadBuffer::new(),
            wbuf: WriteBuffer::new(),
            cancel: CancelFlag::new(),
            protocol_version: crate::protocol::MAX_PROTOCOL,
            view: None,
            last_parse: None,
            flush_sync_on_error: false,
        }
    }

    /// Handle for cancelling this connection from outside.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Drive the connection to completion.
    pub async fn run(mut self) -> Result<()> {
        crate::common::span!("connection");
        let result = self.serve().await;
        if let Some(view) = &self.view {
            self.env.registry.close_view(view);
        }
        match &result {
            Ok(()) => tracing::debug!("connection closed"),
            Err(err) => tracing::debug!(error = %err.wire_message(), "connection failed"),
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        if let Err(err) = self.startup().await {
            // auth errors close the connection after reporting
            if !err.is_fatal() {
                self.send_error(&err);
                let _ = self.flush().await;
            }
            return Err(err);
        }
        self.main_loop().await
    }

    // ## Startup

    async fn startup(&mut self) -> Result<()> {
        let tag = self.recv_message().await?;
        if tag != client::Handshake::MSGTYPE {
            return Err(ProtocolError::unexpected(tag, "handshake").into());
        }
        let hs: client::Handshake = self.decode()?;

        let negotiation = handshake::negotiate(&hs);
        self.protocol_version = negotiation.target;
        if negotiation.announce {
            server::write(
                server::NegotiateProtocolVersion {
                    major: negotiation.target.major,
                    minor: negotiation.target.minor,
                },
                &mut self.wbuf,
            );
            self.flush().await?;
        }

        self.authenticate(&hs).await
    }

    async fn authenticate(&mut self, hs: &client::Handshake) -> Result<()> {
        let user = hs
            .param("user")
            .ok_or_else(|| Error::authentication("required parameter \"user\" is missing"))?
            .to_string();
        let database = hs.param("database").unwrap_or(&user).to_string();

        if Registry::is_system_database(&database) {
            return Err(Error::access(format!(
                "database {database:?} does not accept connections"
            )));
        }

        match self.env.auth.method_for(self.transport, &user) {
            AuthMethod::Trust => {}
            AuthMethod::Scram => self.run_scram(&user).await?,
            AuthMethod::Jwt => self.run_jwt(&user, hs).await?,
        }

        let db = self.env.registry.get(&database).ok_or_else(|| {
            Error::access(format!("database {database:?} does not exist"))
        })?;
        let view = self
            .env
            .registry
            .new_view(&db, true, self.protocol_version);
        self.view = Some(view);
        tracing::debug!(user = %user, database = %database, "authenticated");

        server::write(server::Authentication::Ok, &mut self.wbuf);
        server::write(server::ServerKeyData { data: [0; 32] }, &mut self.wbuf);
        let concurrency = self.env.suggested_pool_concurrency.to_string();
        server::write(
            server::ParameterStatus {
                name: "suggested_pool_concurrency",
                value: concurrency.as_bytes(),
            },
            &mut self.wbuf,
        );
        let system_config =
            serde_json::to_vec(&self.env.registry.system_config()).unwrap_or_default();
        server::write(
            server::ParameterStatus { name: "system_config", value: &system_config },
            &mut self.wbuf,
        );
        server::write(server::ReadyForQuery { tx_status: b'I' }, &mut self.wbuf);
        self.flush().await
    }

    async fn run_scram(&mut self, user: &str) -> Result<()> {
        server::write(
            server::Authentication::Sasl { methods: &["SCRAM-SHA-256"] },
            &mut self.wbuf,
        );
        self.flush().await?;

        let first: client::AuthResponse = self.recv_expect("sasl initial response").await?;
        let cont = self.env.auth.verifier().scram_first(user, &first.data)?;
        server::write(
            server::Authentication::SaslContinue { data: &cont.server_message },
            &mut self.wbuf,
        );
        self.flush().await?;

        let last: client::AuthResponse = self.recv_expect("sasl response").await?;
        let fin = self.env.auth.verifier().scram_final(user, &last.data)?;
        server::write(server::Authentication::SaslFinal { data: &fin }, &mut self.wbuf);
        Ok(())
    }

    async fn run_jwt(&mut self, user: &str, hs: &client::Handshake) -> Result<()> {
        // the token may ride in the handshake; request a leg otherwise
        if let Some(token) = hs.param("token") {
            return self.env.auth.verifier().verify_jwt(user, token.as_bytes());
        }
        server::write(
            server::Authentication::Sasl { methods: &["JWT"] },
            &mut self.wbuf,
        );
        self.flush().await?;
        let leg: client::AuthResponse = self.recv_expect("jwt response").await?;
        self.env.auth.verifier().verify_jwt(user, &leg.data)
    }

    // ## Main loop

    async fn main_loop(&mut self) -> Result<()> {
        loop {
            let tag = self.recv_message().await?;
            self.flush_sync_on_error = false;

            match self.dispatch(tag).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Terminate) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.rbuf.discard_message();
                    if let Some(view) = self.view.as_mut() {
                        view.on_error(err.wire_message());
                    }
                    self.send_error(&err);
                    if self.flush_sync_on_error {
                        let tx_status = self.tx_status();
                        server::write(server::ReadyForQuery { tx_status }, &mut self.wbuf);
                        self.flush().await?;
                    } else {
                        self.flush().await?;
                        self.recover_until_sync().await?;
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, tag: u8) -> Result<Flow> {
        verbose!(tag = %(tag as char), "dispatch");
        match tag {
            client::Parse::MSGTYPE => self.on_parse().await?,
            client::Describe::MSGTYPE => self.on_describe()?,
            client::Execute::MSGTYPE => self.on_execute().await?,
            client::OptimisticExecute::MSGTYPE => self.on_optimistic_execute().await?,
            client::FastQuery::MSGTYPE => self.on_fast_query().await?,
            client::SimpleQuery::MSGTYPE => self.on_simple_query().await?,
            client::Sync::MSGTYPE => self.on_sync().await?,
            client::Dump::MSGTYPE => self.on_dump().await?,
            client::Restore::MSGTYPE => self.on_restore().await?,
            client::Terminate::MSGTYPE => {
                self.rbuf.discard_message();
                return Ok(Flow::Terminate);
            }
            other => return Err(ProtocolError::UnknownTag(other).into()),
        }
        Ok(Flow::Continue)
    }

    /// Discard messages until the next `Sync`, then report readiness.
    async fn recover_until_sync(&mut self) -> Result<()> {
        loop {
            let tag = self.recv_message().await?;
            self.rbuf.discard_message();
            if tag == client::Sync::MSGTYPE {
                let tx_status = self.tx_status();
                server::write(server::ReadyForQuery { tx_status }, &mut self.wbuf);
                return self.flush().await;
            }
            verbose!(tag = %(tag as char), "discarded while recovering");
        }
    }

    // ## Handlers

    async fn on_parse(&mut self) -> Result<()> {
        let msg: client::Parse = self.decode()?;
        validate_part(&msg.part)?;

        let req = self.compile_request(&msg.part);
        let key = req.fingerprint();
        let compiled = self.lookup_or_compile(&req, key).await?;

        self.send_description(&compiled, false);
        self.last_parse = Some((key, compiled));
        self.flush().await
    }

    fn on_describe(&mut self) -> Result<()> {
        if self.protocol_version.has_inline_type_data() {
            return Err(ProtocolError::unexpected(
                client::Describe::MSGTYPE,
                "this protocol version",
            )
            .into());
        }
        let msg: client::Describe = self.decode()?;
        if msg.mode != b'T' {
            return Err(ProtocolError::BadDescribeMode(msg.mode).into());
        }
        let (_, compiled) = self
            .last_parse
            .clone()
            .ok_or_else(Error::type_spec_not_found)?;
        self.send_description(&compiled, true);
        Ok(())
    }

    async fn on_execute(&mut self) -> Result<()> {
        let msg: client::Execute = self.decode()?;
        if !msg.stmt_name.is_empty() {
            return Err(Error::unsupported("prepared statements are not yet supported"));
        }
        let (_, compiled) = self.last_parse.clone().ok_or_else(|| {
            Error::from(ProtocolError::Malformed("no statement parsed"))
        })?;

        self.check_capabilities(&compiled, &msg.options)?;
        let outcome = self.run_compiled(&compiled, &msg.bind_args).await?;
        self.send_results(&compiled, &outcome);
        self.flush().await
    }

    async fn on_optimistic_execute(&mut self) -> Result<()> {
        let msg: client::OptimisticExecute = self.decode()?;
        validate_part(&msg.part)?;

        let req = self.compile_request(&msg.part);
        let key = req.fingerprint();
        let compiled = self.lookup_or_compile(&req, key).await?;
        self.last_parse = Some((key, compiled.clone()));

        if compiled.group.in_type_id != msg.in_type_id
            || compiled.group.out_type_id != msg.out_type_id
        {
            // the client bet on stale type ids; describe and stop so it
            // can re-encode its arguments and retry
            self.send_description(&compiled, true);
            return self.flush().await;
        }

        self.check_capabilities(&compiled, &msg.part.options)?;
        let outcome = self.run_compiled(&compiled, &msg.bind_args).await?;
        self.send_results(&compiled, &outcome);
        self.flush().await
    }

    async fn on_fast_query(&mut self) -> Result<()> {
        let msg: client::FastQuery = self.decode()?;
        if msg.mode != b'T' {
            return Err(ProtocolError::BadDescribeMode(msg.mode).into());
        }
        if !msg.bind_args.is_empty() {
            return Err(Error::unsupported(
                "bind arguments are not supported in fast query",
            ));
        }
        validate_part(&msg.part)?;

        let req = self.compile_request(&msg.part);
        let key = req.fingerprint();
        let compiled = self.lookup_or_compile(&req, key).await?;
        self.last_parse = Some((key, compiled.clone()));

        self.check_capabilities(&compiled, &msg.part.options)?;
        self.send_description(&compiled, true);
        let outcome = self.run_compiled(&compiled, &Bytes::new()).await?;
        self.send_results(&compiled, &outcome);
        self.flush().await
    }

    async fn on_simple_query(&mut self) -> Result<()> {
        self.flush_sync_on_error = true;
        let msg: client::SimpleQuery = self.decode()?;
        if msg.query.is_empty() {
            return Err(ProtocolError::EmptyQuery.into());
        }

        // recover a failed transaction before running the script
        if self.view.as_ref().is_some_and(ConnectionView::in_tx_error) {
            self.rollback_failed_tx(&msg.options).await?;
        }

        let part = ParsePart {
            options: msg.options,
            output_format: OutputFormat::None,
            expect_one: false,
            stmt_name: Bytes::new(),
            query: msg.query,
        };
        let req = self.compile_request(&part);
        let key = req.fingerprint();
        let compiled = self.lookup_or_compile(&req, key).await?;

        self.check_capabilities(&compiled, &part.options)?;
        let outcome = self.run_compiled(&compiled, &Bytes::new()).await?;

        for status in &outcome.statuses {
            server::write(
                server::CommandComplete {
                    capabilities: compiled.group.capabilities,
                    status,
                },
                &mut self.wbuf,
            );
        }
        let tx_status = self.tx_status();
        server::write(server::ReadyForQuery { tx_status }, &mut self.wbuf);
        self.flush().await
    }

    /// Compile and run a `ROLLBACK` to clear the failed transaction;
    /// requires the client to have the TRANSACTION capability.
    async fn rollback_failed_tx(&mut self, options: &QueryOptions) -> Result<()> {
        let allowed = options.allow_capabilities
            & self.view.as_ref().expect("authenticated").capability_mask();
        if !allowed.contains(crate::caps::Capability::TRANSACTION) {
            return Err(Error::disabled_capability(crate::caps::Capability::TRANSACTION));
        }

        let part = ParsePart {
            options: options.clone(),
            output_format: OutputFormat::None,
            expect_one: false,
            stmt_name: Bytes::new(),
            query: "ROLLBACK".to_string(),
        };
        let req = self.compile_request(&part);
        let key = req.fingerprint();
        let compiled = self.lookup_or_compile(&req, key).await?;
        self.run_compiled(&compiled, &Bytes::new()).await?;
        Ok(())
    }

    async fn on_sync(&mut self) -> Result<()> {
        let _: client::Sync = self.decode()?;
        let tx_status = self.tx_status();
        server::write(server::ReadyForQuery { tx_status }, &mut self.wbuf);
        self.flush().await
    }

    async fn on_dump(&mut self) -> Result<()> {
        let _msg: client::Dump = self.decode()?;
        let view = self.view.as_ref().expect("authenticated");
        let db = view.database().clone();

        let pool = self.env.pools.get(db.name());
        // dump wants a stable schema; introspection is held for the
        // duration
        let _introspection = db.introspection_lock().await;
        self.cancel.check()?;
        let mut conn = pool.acquire().await?;
        let blocks = conn.dump().await?;
        drop(conn);

        for block in &blocks {
            server::write(
                server::Data { blocks: std::slice::from_ref(block) },
                &mut self.wbuf,
            );
        }
        server::write(
            server::CommandComplete {
                capabilities: crate::caps::Capability::NONE,
                status: b"DUMP",
            },
            &mut self.wbuf,
        );
        self.flush().await
    }

    async fn on_restore(&mut self) -> Result<()> {
        let msg: client::Restore = self.decode()?;
        let view = self.view.as_ref().expect("authenticated");
        if view.in_tx() {
            return Err(Error::transaction(
                "RESTORE must not run inside a transaction block",
            ));
        }
        let db = view.database().clone();

        let pool = self.env.pools.get(db.name());
        let _introspection = db.introspection_lock().await;
        self.cancel.check()?;
        let mut conn = pool.acquire().await?;
        conn.restore(msg.data).await?;
        drop(conn);

        server::write(
            server::CommandComplete {
                capabilities: crate::caps::Capability::NONE,
                status: b"RESTORE",
            },
            &mut self.wbuf,
        );
        self.flush().await
    }

    // ## Plumbing

    fn compile_request(&self, part: &ParsePart) -> CompileRequest {
        let view = self.view.as_ref().expect("authenticated");
        CompileRequest {
            source: part.query.clone(),
            protocol_version: self.protocol_version,
            output_format: part.output_format,
            expect_one: part.expect_one,
            implicit_limit: part.options.implicit_limit,
            inline_typeids: part.options.inline_typeids,
            inline_typenames: part.options.inline_typenames,
            inline_objectids: !part.options.explicit_objectids,
            allow_capabilities: part.options.allow_capabilities,
            module: part.options.module.clone(),
            namespace: view.namespace().to_string(),
            read_only: part.options.prohibit_mutation,
        }
    }

    async fn lookup_or_compile(
        &mut self,
        req: &CompileRequest,
        key: Fingerprint,
    ) -> Result<Arc<CompiledQuery>> {
        let view = self.view.as_mut().expect("authenticated");
        if let Some(hit) = view.lookup_compiled_query(key) {
            return Ok(hit);
        }
        let db = view.database().clone();
        self.cancel.check()?;
        let group = db.compile_cached(req, &self.env.compiler).await?;
        self.cancel.check()?;
        let compiled = Arc::new(CompiledQuery::new(group));
        self.view
            .as_mut()
            .expect("authenticated")
            .cache_compiled_query(key, compiled.clone());
        Ok(compiled)
    }

    fn check_capabilities(
        &self,
        compiled: &CompiledQuery,
        options: &QueryOptions,
    ) -> Result<()> {
        let view = self.view.as_ref().expect("authenticated");
        let allowed = options.allow_capabilities & view.capability_mask();
        let denied = compiled.group.capabilities.disallowed_by(allowed);
        if denied.is_empty() {
            Ok(())
        } else {
            Err(Error::disabled_capability(denied))
        }
    }

    async fn run_compiled(
        &mut self,
        compiled: &CompiledQuery,
        bind_args: &Bytes,
    ) -> Result<ExecuteOutcome> {
        let env = ExecuteEnv {
            registry: &self.env.registry,
            pools: &self.env.pools,
            cancel: &self.cancel,
        };
        execute(
            &env,
            compiled,
            bind_args,
            self.view.as_mut().expect("authenticated"),
        )
        .await
    }

    fn send_description(&mut self, compiled: &CompiledQuery, full: bool) {
        let group = &compiled.group;
        let description = server::Description {
            capabilities: group.capabilities,
            result_cardinality: group.cardinality.as_u8(),
            in_type_id: group.in_type_id,
            in_type_data: &group.in_type_data,
            out_type_id: group.out_type_id,
            out_type_data: &group.out_type_data,
            include_type_data: full || self.protocol_version.has_inline_type_data(),
        };
        if full {
            server::write(server::CommandDataDescription(description), &mut self.wbuf);
        } else {
            server::write(server::ParseComplete(description), &mut self.wbuf);
        }
    }

    fn send_results(&mut self, compiled: &CompiledQuery, outcome: &ExecuteOutcome) {
        if !outcome.data.is_empty() {
            server::write(server::Data { blocks: &outcome.data }, &mut self.wbuf);
        }
        let status = outcome
            .statuses
            .last()
            .map(|status| status.as_ref())
            .unwrap_or(b"OK");
        server::write(
            server::CommandComplete {
                capabilities: compiled.group.capabilities,
                status,
            },
            &mut self.wbuf,
        );
    }

    fn send_error(&mut self, err: &Error) {
        server::write(
            server::ErrorResponse {
                severity: SEVERITY_ERROR,
                code: err.code(),
                message: &err.wire_message(),
            },
            &mut self.wbuf,
        );
    }

    fn tx_status(&self) -> u8 {
        self.view
            .as_ref()
            .map(ConnectionView::tx_status)
            .unwrap_or(b'I')
    }

    fn decode<M: ClientProtocol>(&mut self) -> Result<M> {
        let tag = self.rbuf.message_tag();
        let mut payload = self.rbuf.take_rest();
        let msg = client::decode_as::<M>(tag, &mut payload)?;
        if !payload.is_empty() {
            return Err(ProtocolError::UnparsedData.into());
        }
        self.rbuf.finish_message()?;
        Ok(msg)
    }

    async fn recv_message(&mut self) -> Result<u8> {
        loop {
            self.cancel.check()?;
            if self.rbuf.take_message()? {
                return Ok(self.rbuf.message_tag());
            }
            let read = self.io.read_buf(self.rbuf.bytes_mut()).await?;
            if read == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Receive one message and decode it as `M`, for fixed protocol
    /// phases.
    async fn recv_expect<M: ClientProtocol>(&mut self, phase: &'static str) -> Result<M> {
        let tag = self.recv_message().await?;
        if tag != M::MSGTYPE {
            return Err(ProtocolError::unexpected(tag, phase).into());
        }
        self.decode()
    }

    async fn flush(&mut self) -> Result<()> {
        self.cancel.check()?;
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let mut buf = self.wbuf.take();
        self.io.write_all_buf(&mut buf).await?;
        self.io.flush().await?;
        Ok(())
    }
}

fn validate_part(part: &ParsePart) -> Result<()> {
    if !part.stmt_name.is_empty() {
        return Err(Error::unsupported("prepared statements are not yet supported"));
    }
    if part.query.is_empty() {
        return Err(ProtocolError::EmptyQuery.into());
    }
    Ok(())
}

/// Accept connections and spawn an engine per client.
pub async fn serve<C, B>(
    listener: crate::net::Listener,
    env: Arc<ServerEnv<C, B>>,
) -> Result<()>
where
    C: Compiler + Send + Sync + 'static,
    B: Backend + Send + Sync,
    B::Config: Send + Sync,
{
    loop {
        let socket = listener.accept().await?;
        let transport = socket.transport();
        let env = env.clone();
        tokio::spawn(async move {
            let engine = Engine::new(socket, env, transport);
            if let Err(err) = engine.run().await {
                tracing::debug!(error = %err.wire_message(), "connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use bytes::{Buf, BufMut};
    use tokio::{io::DuplexStream, task::JoinHandle};

    use super::*;
    use crate::{
        backend::DdlResult,
        caps::Capability,
        error::BackendError,
        protocol::{ext::BufMutExt, header},
        unit::{Cardinality, QueryUnit, QueryUnitGroup},
    };

    const TYPE_ID: [u8; 16] = [0xAA; 16];

    struct MockCompiler {
        calls: AtomicUsize,
    }

    impl Compiler for MockCompiler {
        async fn compile(&self, req: &CompileRequest) -> Result<QueryUnitGroup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut group = QueryUnitGroup::new();
            for stmt in req.source.split(';') {
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                group.append(compile_stmt(stmt));
            }
            Ok(group)
        }
    }

    fn compile_stmt(stmt: &str) -> QueryUnit {
        let status = stmt.split_whitespace().next().unwrap_or("OK").to_uppercase();
        let mut unit = QueryUnit {
            sql: vec![Bytes::copy_from_slice(stmt.as_bytes())],
            status: Bytes::from(status.into_bytes()),
            is_transactional: true,
            cacheable: true,
            cardinality: Cardinality::Many,
            in_type_id: crate::protocol::TypeId(TYPE_ID),
            in_type_data: Bytes::from_static(b"in-desc"),
            out_type_id: crate::protocol::TypeId(TYPE_ID),
            out_type_data: Bytes::from_static(b"out-desc"),
            ..Default::default()
        };
        if stmt.eq_ignore_ascii_case("begin") {
            unit.tx_id = Some(1);
            unit.capabilities = Capability::TRANSACTION;
        } else if stmt.eq_ignore_ascii_case("commit") {
            unit.tx_commit = true;
            unit.capabilities = Capability::TRANSACTION;
        } else if stmt.eq_ignore_ascii_case("rollback") {
            unit.tx_rollback = true;
            unit.capabilities = Capability::TRANSACTION;
        } else if stmt.to_uppercase().starts_with("CREATE TYPE") {
            unit.ddl_stmt_id = Some("ddl-1".to_string());
            unit.user_schema = Some(Bytes::copy_from_slice(stmt.as_bytes()));
            unit.capabilities = Capability::DDL;
            unit.cacheable = false;
        }
        unit
    }

    struct MockBackend {
        last_state: Option<Bytes>,
    }

    impl Backend for MockBackend {
        type Config = ();

        async fn connect(_: &()) -> Result<MockBackend> {
            Ok(MockBackend { last_state: None })
        }

        fn last_state(&self) -> Option<&Bytes> {
            self.last_state.as_ref()
        }

        fn set_last_state(&mut self, state: Bytes) {
            self.last_state = Some(state);
        }

        async fn sql_execute(
            &mut self,
            sql: &[Bytes],
            _: &Bytes,
            _: Option<&Bytes>,
        ) -> Result<Vec<Bytes>> {
            for stmt in sql {
                if stmt.windows(3).any(|w| w == b"1/0") {
                    return Err(BackendError::new("division by zero").into());
                }
            }
            Ok(vec![Bytes::from_static(b"data-block")])
        }

        async fn run_ddl(&mut self, _: &QueryUnit, _: Option<&Bytes>) -> Result<DdlResult> {
            let mut result = DdlResult::default();
            result.new_types.insert(
                "default::Foo".to_string(),
                crate::protocol::TypeId([5; 16]),
            );
            Ok(result)
        }

        async fn parse_execute_json(
            &mut self,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<Bytes> {
            Ok(Bytes::from_static(b"[]"))
        }

        async fn apply_system_config(&mut self, _: &[crate::unit::ConfigOp]) -> Result<()> {
            Ok(())
        }

        async fn dump(&mut self) -> Result<Vec<Bytes>> {
            Ok(vec![Bytes::from_static(b"dump-block")])
        }

        async fn restore(&mut self, _: Bytes) -> Result<()> {
            Ok(())
        }
    }

    type TestEnv = Arc<ServerEnv<MockCompiler, MockBackend>>;

    fn test_env() -> TestEnv {
        let registry = Registry::new();
        registry.ensure("main");
        Arc::new(ServerEnv {
            registry,
            compiler: MockCompiler { calls: AtomicUsize::new(0) },
            pools: PoolSet::new((), 4, |_, _| ()),
            auth: AuthConfig::trust_all(),
            suggested_pool_concurrency: 4,
        })
    }

    struct TestClient {
        io: DuplexStream,
        rbuf: ReadBuffer,
        wbuf: WriteBuffer,
    }

    impl TestClient {
        async fn flush(&mut self) {
            let mut buf = self.wbuf.take();
            self.io.write_all_buf(&mut buf).await.unwrap();
        }

        async fn recv_frame(&mut self) -> (u8, Bytes) {
            loop {
                if self.rbuf.take_message().unwrap() {
                    let tag = self.rbuf.message_tag();
                    let payload = self.rbuf.take_rest();
                    self.rbuf.finish_message().unwrap();
                    return (tag, payload);
                }
                let read = self.io.read_buf(self.rbuf.bytes_mut()).await.unwrap();
                assert!(read > 0, "server closed the stream");
            }
        }

        /// Read frames until `ReadyForQuery`, returning the status byte.
        async fn recv_until_ready(&mut self) -> u8 {
            loop {
                let (tag, payload) = self.recv_frame().await;
                if tag == b'Z' {
                    return payload[2];
                }
            }
        }

        async fn recv_eof(&mut self) {
            loop {
                if self.rbuf.take_message().unwrap() {
                    self.rbuf.discard_message();
                    continue;
                }
                if self.io.read_buf(self.rbuf.bytes_mut()).await.unwrap() == 0 {
                    return;
                }
            }
        }

        fn headers(&mut self, allow: Option<Capability>) {
            match allow {
                Some(caps) => {
                    self.wbuf.put_u16(1);
                    self.wbuf.put_u16(header::ALLOW_CAPABILITIES);
                    self.wbuf.put_u32(8);
                    self.wbuf.put_u64(caps.bits());
                }
                None => self.wbuf.put_u16(0),
            }
        }

        async fn parse(&mut self, query: &str) {
            self.wbuf.new_message(b'P');
            self.headers(None);
            self.wbuf.put_u8(b'b');
            self.wbuf.put_u8(b'm');
            self.wbuf.put_lp_bytes(b"");
            self.wbuf.put_lp_str(query);
            self.wbuf.end_message();
            self.flush().await;
        }

        async fn execute(&mut self, args: &[u8]) {
            self.wbuf.new_message(b'E');
            self.headers(None);
            self.wbuf.put_lp_bytes(b"");
            self.wbuf.put_lp_bytes(args);
            self.wbuf.end_message();
            self.flush().await;
        }

        async fn optimistic(&mut self, query: &str, in_id: [u8; 16], out_id: [u8; 16]) {
            self.wbuf.new_message(b'O');
            self.headers(None);
            self.wbuf.put_u8(b'b');
            self.wbuf.put_u8(b'm');
            self.wbuf.put_lp_bytes(b"");
            self.wbuf.put_lp_str(query);
            self.wbuf.put_slice(&in_id);
            self.wbuf.put_slice(&out_id);
            self.wbuf.put_lp_bytes(b"args");
            self.wbuf.end_message();
            self.flush().await;
        }

        async fn fast_query(&mut self, query: &str, mode: u8, args: &[u8]) {
            self.wbuf.new_message(b'F');
            self.headers(None);
            self.wbuf.put_u8(b'b');
            self.wbuf.put_u8(b'm');
            self.wbuf.put_lp_bytes(b"");
            self.wbuf.put_lp_str(query);
            self.wbuf.put_u8(mode);
            self.wbuf.put_lp_bytes(args);
            self.wbuf.end_message();
            self.flush().await;
        }

        async fn simple_query(&mut self, query: &str, allow: Option<Capability>) {
            self.wbuf.new_message(b'Q');
            self.headers(allow);
            self.wbuf.put_lp_str(query);
            self.wbuf.end_message();
            self.flush().await;
        }

        async fn describe(&mut self, mode: u8) {
            self.wbuf.new_message(b'D');
            self.headers(None);
            self.wbuf.put_u8(mode);
            self.wbuf.put_lp_bytes(b"");
            self.wbuf.end_message();
            self.flush().await;
        }

        async fn sync(&mut self) {
            self.wbuf.new_message(b'S');
            self.wbuf.end_message();
            self.flush().await;
        }

        async fn terminate(&mut self) {
            self.wbuf.new_message(b'X');
            self.wbuf.end_message();
            self.flush().await;
        }
    }

    async fn connect_version(
        env: &TestEnv,
        major: u16,
        minor: u16,
        database: &str,
    ) -> (TestClient, JoinHandle<Result<()>>) {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let engine = Engine::new(server_io, env.clone(), Transport::Tcp);
        let handle = tokio::spawn(engine.run());

        let mut client = TestClient {
            io: client_io,
            rbuf: ReadBuffer::new(),
            wbuf: WriteBuffer::new(),
        };
        client.wbuf.new_message(b'V');
        client.wbuf.put_u16(major);
        client.wbuf.put_u16(minor);
        client.wbuf.put_u16(2);
        client.wbuf.put_lp_str("user");
        client.wbuf.put_lp_str("edgedb");
        client.wbuf.put_lp_str("database");
        client.wbuf.put_lp_str(database);
        client.wbuf.put_u16(0);
        client.wbuf.end_message();
        client.flush().await;
        (client, handle)
    }

    /// Connect at the maximum version and drain the auth frames.
    async fn connect(env: &TestEnv) -> (TestClient, JoinHandle<Result<()>>) {
        let (mut client, handle) = connect_version(env, 1, 0, "main").await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'R');
        assert_eq!(payload.get_u32(), 0);
        assert_eq!(client.recv_until_ready().await, b'I');
        (client, handle)
    }

    #[tokio::test]
    async fn mid_range_version_is_negotiated_then_authed() {
        let env = test_env();
        let (mut client, _handle) = connect_version(&env, 0, 10, "main").await;

        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'v');
        assert_eq!(payload.get_u16(), 0);
        assert_eq!(payload.get_u16(), 10);

        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'R');
        assert_eq!(payload.get_u32(), 0);

        let (tag, payload) = client.recv_frame().await;
        assert_eq!(tag, b'K');
        assert_eq!(payload.len(), 32);
        assert!(payload.iter().all(|&b| b == 0));

        assert_eq!(client.recv_until_ready().await, b'I');
    }

    #[tokio::test]
    async fn max_version_connects_silently() {
        let env = test_env();
        let (mut client, _handle) = connect_version(&env, 1, 0, "main").await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'R', "no NegotiateProtocolVersion expected");
    }

    #[tokio::test]
    async fn template_database_is_refused() {
        let env = test_env();
        let (mut client, handle) = connect_version(&env, 1, 0, "__template__").await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0400_0100);
        client.recv_eof().await;
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn unknown_database_is_refused() {
        let env = test_env();
        let (mut client, handle) = connect_version(&env, 1, 0, "missing").await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0400_0100);
        drop(client);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn parse_then_execute() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.parse("SELECT 1").await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'1');
        // headers + cardinality + in id
        assert_eq!(payload.get_u16(), 1);
        assert_eq!(payload.get_u16(), header::SERVER_CAPABILITIES);
        let _caps = {
            let len = payload.get_u32() as usize;
            payload.split_to(len)
        };
        assert_eq!(payload.get_u8(), Cardinality::Many.as_u8());
        assert_eq!(&payload.split_to(16)[..], &TYPE_ID);

        client.execute(b"").await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'D');
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'C');

        client.sync().await;
        assert_eq!(client.recv_until_ready().await, b'I');
    }

    #[tokio::test]
    async fn empty_parse_reports_error_and_recovers_on_sync() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.parse("").await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0300_0000);
        let message = {
            let len = payload.get_u32() as usize;
            payload.split_to(len)
        };
        assert_eq!(&message[..], b"empty query");

        // messages before the Sync are discarded by the recovery loop
        client.parse("SELECT 1").await;
        client.sync().await;
        let (tag, payload) = client.recv_frame().await;
        assert_eq!(tag, b'Z', "discarded parse must not answer");
        assert_eq!(payload[2], b'I');
    }

    #[tokio::test]
    async fn optimistic_execute_with_stale_ids_stops_at_description() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.optimistic("SELECT 1", [0; 16], [0; 16]).await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'T');

        // nothing executed: the next frame is the Sync answer
        client.sync().await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'Z');
    }

    #[tokio::test]
    async fn optimistic_execute_with_matching_ids_runs() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.optimistic("SELECT 1", TYPE_ID, TYPE_ID).await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'D');
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'C');
    }

    #[tokio::test]
    async fn fast_query_rejects_bind_args() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.fast_query("SELECT 1", b'T', b"surprise").await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0200_0100);

        client.sync().await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'Z');
    }

    #[tokio::test]
    async fn fast_query_describes_then_executes() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.fast_query("SELECT 1", b'T', b"").await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'T');
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'D');
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'C');
    }

    #[tokio::test]
    async fn simple_query_emits_status_per_unit() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.simple_query("SELECT 1; SELECT 2", None).await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'C');
        // skip capability headers
        payload.get_u16();
        payload.get_u16();
        let len = payload.get_u32() as usize;
        payload.split_to(len);
        let len = payload.get_u32() as usize;
        assert_eq!(&payload.split_to(len)[..], b"SELECT");

        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'C');
        let (tag, payload) = client.recv_frame().await;
        assert_eq!(tag, b'Z');
        assert_eq!(payload[2], b'I');
    }

    #[tokio::test]
    async fn script_error_enters_failed_tx_until_rollback() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client
            .simple_query("BEGIN; SELECT 1/0; SELECT 1", None)
            .await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0600_0000);
        let (tag, payload) = client.recv_frame().await;
        assert_eq!(tag, b'Z');
        assert_eq!(payload[2], b'E', "session is in a failed transaction");

        // recovery path compiles and runs a rollback, then the script
        client.simple_query("SELECT 1", None).await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'C');
        let (tag, payload) = client.recv_frame().await;
        assert_eq!(tag, b'Z');
        assert_eq!(payload[2], b'I');
    }

    #[tokio::test]
    async fn failed_tx_recovery_requires_transaction_capability() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.simple_query("BEGIN; SELECT 1/0", None).await;
        assert_eq!(client.recv_until_ready().await, b'E');

        client
            .simple_query("SELECT 1", Some(Capability::MODIFICATIONS))
            .await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0300_0300);
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'Z');

        // with the capability granted the same script goes through
        client.simple_query("SELECT 1", None).await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'C');
        assert_eq!(client.recv_until_ready().await, b'I');
    }

    #[tokio::test]
    async fn committed_ddl_invalidates_sibling_caches() {
        let env = test_env();
        let (mut alice, _ha) = connect(&env).await;
        let (mut bob, _hb) = connect(&env).await;

        bob.parse("SELECT Foo").await;
        let (tag, _) = bob.recv_frame().await;
        assert_eq!(tag, b'1');
        let before = env.compiler.calls.load(Ordering::SeqCst);

        // a cache hit costs no compilation
        bob.parse("SELECT Foo").await;
        let (tag, _) = bob.recv_frame().await;
        assert_eq!(tag, b'1');
        assert_eq!(env.compiler.calls.load(Ordering::SeqCst), before);

        alice.simple_query("CREATE TYPE Foo", None).await;
        assert_eq!(alice.recv_until_ready().await, b'I');
        let after_ddl = env.compiler.calls.load(Ordering::SeqCst);

        // the committed DDL bumped dbver; bob's entry is stale now
        bob.parse("SELECT Foo").await;
        let (tag, _) = bob.recv_frame().await;
        assert_eq!(tag, b'1');
        assert_eq!(env.compiler.calls.load(Ordering::SeqCst), after_ddl + 1);
    }

    #[tokio::test]
    async fn legacy_describe_returns_type_description() {
        let env = test_env();
        let (mut client, _handle) = connect_version(&env, 0, 10, "main").await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'v');
        assert_eq!(client.recv_until_ready().await, b'I');

        client.parse("SELECT 1").await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'1');

        client.describe(b'T').await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'T');
    }

    #[tokio::test]
    async fn describe_is_gone_in_modern_protocol() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.describe(b'T').await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0300_0000);
    }

    #[tokio::test]
    async fn describe_without_parse_has_no_type_spec() {
        let env = test_env();
        let (mut client, _handle) = connect_version(&env, 0, 10, "main").await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'v');
        assert_eq!(client.recv_until_ready().await, b'I');

        client.describe(b'T').await;
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0300_0200);
    }

    #[tokio::test]
    async fn dump_emits_blocks_and_completion() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.wbuf.new_message(b'>');
        client.headers(None);
        client.wbuf.end_message();
        client.flush().await;

        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'D');
        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'C');
        payload.get_u16();
        payload.get_u16();
        let len = payload.get_u32() as usize;
        payload.split_to(len);
        let len = payload.get_u32() as usize;
        assert_eq!(&payload.split_to(len)[..], b"DUMP");
    }

    #[tokio::test]
    async fn restore_completes() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.wbuf.new_message(b'<');
        client.headers(None);
        client.wbuf.put_u16(1);
        client.wbuf.put_slice(b"dump-bytes");
        client.wbuf.end_message();
        client.flush().await;

        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'C');
        payload.get_u16();
        payload.get_u16();
        let len = payload.get_u32() as usize;
        payload.split_to(len);
        let len = payload.get_u32() as usize;
        assert_eq!(&payload.split_to(len)[..], b"RESTORE");
    }

    #[tokio::test]
    async fn terminate_closes_cleanly_and_releases_view() {
        let env = test_env();
        let db = env.registry.get("main").unwrap();
        let (mut client, handle) = connect(&env).await;
        assert_eq!(db.view_count(), 1);

        client.terminate().await;
        handle.await.unwrap().unwrap();
        assert_eq!(db.view_count(), 0);
    }

    #[tokio::test]
    async fn unknown_tag_is_a_protocol_error() {
        let env = test_env();
        let (mut client, _handle) = connect(&env).await;

        client.wbuf.new_message(b'?');
        client.wbuf.end_message();
        client.flush().await;

        let (tag, mut payload) = client.recv_frame().await;
        assert_eq!(tag, b'E');
        let _severity = payload.get_u8();
        assert_eq!(payload.get_u32(), 0x0300_0000);
        client.sync().await;
        let (tag, _) = client.recv_frame().await;
        assert_eq!(tag, b'Z');
    }
}
