//! Compilation requests and the compiler seam.
//!
//! The compiler itself is an external collaborator; the core only knows how
//! to describe what it wants compiled and how to key the result for
//! caching.

use std::hash::{DefaultHasher, Hash, Hasher};

use crate::{
    Result,
    caps::Capability,
    protocol::ProtocolVersion,
    unit::{OutputFormat, QueryUnitGroup},
};

/// Deterministic cache key over normalized request inputs.
///
/// Two equal fingerprints mean the compilation results are interchangeable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Fingerprint(u64);

/// Everything that affects the result of a compilation.
#[derive(Clone, Debug)]
pub struct CompileRequest {
    pub source: String,
    pub protocol_version: ProtocolVersion,
    pub output_format: OutputFormat,
    pub expect_one: bool,
    pub implicit_limit: u64,
    pub inline_typeids: bool,
    pub inline_typenames: bool,
    pub inline_objectids: bool,
    pub allow_capabilities: Capability,
    pub module: Option<String>,
    pub namespace: String,
    pub read_only: bool,
}

impl CompileRequest {
    pub fn new(source: impl Into<String>, namespace: impl Into<String>) -> CompileRequest {
        CompileRequest {
            source: source.into(),
            protocol_version: crate::protocol::MAX_PROTOCOL,
            output_format: OutputFormat::Binary,
            expect_one: false,
            implicit_limit: 0,
            inline_typeids: false,
            inline_typenames: false,
            inline_objectids: true,
            allow_capabilities: Capability::ALL,
            module: None,
            namespace: namespace.into(),
            read_only: false,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = DefaultHasher::new();
        for token in tokens(&self.source) {
            token.hash(&mut hasher);
        }
        (self.protocol_version.major, self.protocol_version.minor).hash(&mut hasher);
        (self.output_format as u8).hash(&mut hasher);
        self.expect_one.hash(&mut hasher);
        self.implicit_limit.hash(&mut hasher);
        self.inline_typeids.hash(&mut hasher);
        self.inline_typenames.hash(&mut hasher);
        self.inline_objectids.hash(&mut hasher);
        self.allow_capabilities.bits().hash(&mut hasher);
        self.module.hash(&mut hasher);
        self.namespace.hash(&mut hasher);
        self.read_only.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }
}

/// Whitespace-insensitive token stream of the query source.
///
/// `#` starts a comment running to end of line. String literals are kept
/// intact so whitespace inside them stays significant.
fn tokens(source: &str) -> impl Iterator<Item = &str> {
    let mut rest = source;
    std::iter::from_fn(move || {
        loop {
            rest = rest.trim_start();
            if let Some(after) = rest.strip_prefix('#') {
                rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("");
                continue;
            }
            break;
        }
        if rest.is_empty() {
            return None;
        }

        let bytes = rest.as_bytes();
        let len = match bytes[0] {
            b'\'' | b'"' => {
                let quote = bytes[0];
                match bytes[1..].iter().position(|&b| b == quote) {
                    Some(i) => i + 2,
                    None => rest.len(),
                }
            }
            _ => rest
                .find(|c: char| c.is_whitespace() || c == '#')
                .unwrap_or(rest.len()),
        };

        let (token, tail) = rest.split_at(len);
        rest = tail;
        Some(token)
    })
}

/// The EdgeQL-to-SQL compiler pool, seen from the core.
pub trait Compiler: Send + Sync {
    fn compile(&self, req: &CompileRequest)
    -> impl Future<Output = Result<QueryUnitGroup>> + Send;
}

impl<C: Compiler> Compiler for &C {
    fn compile(
        &self,
        req: &CompileRequest,
    ) -> impl Future<Output = Result<QueryUnitGroup>> + Send {
        C::compile(self, req)
    }
}
