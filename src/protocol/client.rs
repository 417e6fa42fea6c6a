//! Client-to-server messages.
//!
//! All struct fields here mirror the actual message received from the
//! client. Decoding consumes the message payload; the caller closes the
//! frame with [`finish_message`][crate::buffer::ReadBuffer::finish_message]
//! so trailing garbage is always caught.

use bytes::Bytes;

use super::{ProtocolError, TypeId, ext::BytesExt, header};
use crate::{caps::Capability, unit::OutputFormat};

/// A type that can be decoded from a client message payload.
pub trait ClientProtocol: Sized {
    const MSGTYPE: u8;

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError>;
}

/// Decode a message known only by tag, verifying it matches.
pub fn decode_as<M: ClientProtocol>(tag: u8, body: &mut Bytes) -> Result<M, ProtocolError> {
    if tag != M::MSGTYPE {
        return Err(ProtocolError::UnknownTag(tag));
    }
    M::decode(body)
}

/// Typed view of a message's header block.
///
/// Every recognized key is validated eagerly; an unknown key fails the
/// whole message.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub implicit_limit: u64,
    pub inline_typeids: bool,
    pub inline_typenames: bool,
    pub explicit_objectids: bool,
    pub allow_capabilities: Capability,
    pub module: Option<String>,
    pub prohibit_mutation: bool,
}

impl Default for QueryOptions {
    fn default() -> QueryOptions {
        QueryOptions {
            implicit_limit: 0,
            inline_typeids: false,
            inline_typenames: false,
            explicit_objectids: false,
            allow_capabilities: Capability::ALL,
            module: None,
            prohibit_mutation: false,
        }
    }
}

fn header_bool(key: u16, value: &Bytes) -> Result<bool, ProtocolError> {
    match &value[..] {
        b"true" => Ok(true),
        b"false" => Ok(false),
        _ => Err(ProtocolError::BadHeaderValue(key)),
    }
}

fn header_u64(key: u16, value: &Bytes) -> Result<u64, ProtocolError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(ProtocolError::BadHeaderValue(key))
}

impl QueryOptions {
    /// Parse a `nfields:u16, (key:u16, value:lp_bytes)*` block.
    pub fn parse(body: &mut Bytes) -> Result<QueryOptions, ProtocolError> {
        let mut options = QueryOptions::default();
        let nfields = body.try_get_u16()?;
        for _ in 0..nfields {
            let key = body.try_get_u16()?;
            let mut value = body.get_lp_bytes()?;
            match key {
                header::IMPLICIT_LIMIT => {
                    options.implicit_limit = header_u64(key, &value)?;
                }
                header::IMPLICIT_TYPENAMES => {
                    options.inline_typenames = header_bool(key, &value)?;
                }
                header::IMPLICIT_TYPEIDS => {
                    options.inline_typeids = header_bool(key, &value)?;
                }
                header::ALLOW_CAPABILITIES => {
                    if value.len() != 8 {
                        return Err(ProtocolError::BadHeaderValue(key));
                    }
                    options.allow_capabilities =
                        Capability::from_bits(value.try_get_u64()?);
                }
                header::EXPLICIT_OBJECTIDS => {
                    options.explicit_objectids = header_bool(key, &value)?;
                }
                header::EXPLICIT_MODULE => {
                    let module = String::from_utf8(value.to_vec())
                        .map_err(|_| ProtocolError::BadHeaderValue(key))?;
                    options.module = Some(module);
                }
                header::PROHIBIT_MUTATION => {
                    options.prohibit_mutation = header_bool(key, &value)?;
                }
                _ => return Err(ProtocolError::UnknownHeader(key)),
            }
        }
        Ok(options)
    }
}

/// The opening message of a connection.
#[derive(Debug)]
pub struct Handshake {
    pub major: u16,
    pub minor: u16,
    /// Connection parameters, notably `user` and `database`.
    pub params: Vec<(String, String)>,
    /// Protocol extensions; only meaningful to legacy protocol versions.
    pub extensions: Vec<String>,
}

impl Handshake {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl ClientProtocol for Handshake {
    const MSGTYPE: u8 = b'V';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let major = body.try_get_u16()?;
        let minor = body.try_get_u16()?;

        let nparams = body.try_get_u16()?;
        let mut params = Vec::with_capacity(nparams as usize);
        for _ in 0..nparams {
            let key = body.get_lp_str()?;
            let value = body.get_lp_str()?;
            params.push((key, value));
        }

        let nexts = body.try_get_u16()?;
        let mut extensions = Vec::with_capacity(nexts as usize);
        for _ in 0..nexts {
            let name = body.get_lp_str()?;
            // extension headers are opaque to the server
            let nheaders = body.try_get_u16()?;
            for _ in 0..nheaders {
                let _key = body.try_get_u16()?;
                let _value = body.get_lp_bytes()?;
            }
            extensions.push(name);
        }

        Ok(Handshake { major, minor, params, extensions })
    }
}

/// An authentication data leg, e.g. a SASL response.
#[derive(Debug)]
pub struct AuthResponse {
    pub data: Bytes,
}

impl ClientProtocol for AuthResponse {
    const MSGTYPE: u8 = b'p';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let data = body.get_lp_bytes()?;
        Ok(AuthResponse { data })
    }
}

/// Fields shared by `Parse`, `OptimisticExecute` and `FastQuery`.
#[derive(Debug)]
pub struct ParsePart {
    pub options: QueryOptions,
    pub output_format: OutputFormat,
    pub expect_one: bool,
    /// Prepared statement name; a non-empty name is unsupported.
    pub stmt_name: Bytes,
    pub query: String,
}

impl ParsePart {
    fn decode(body: &mut Bytes) -> Result<ParsePart, ProtocolError> {
        let options = QueryOptions::parse(body)?;
        let output_format = OutputFormat::from_u8(body.try_get_u8()?)
            .ok_or(ProtocolError::Malformed("invalid output format"))?;
        let expect_one = match body.try_get_u8()? {
            b'o' => true,
            b'm' => false,
            _ => return Err(ProtocolError::Malformed("invalid cardinality")),
        };
        let stmt_name = body.get_lp_bytes()?;
        let query = body.get_lp_str()?;
        Ok(ParsePart { options, output_format, expect_one, stmt_name, query })
    }
}

/// Compile a query and describe its types.
#[derive(Debug)]
pub struct Parse {
    pub part: ParsePart,
}

impl ClientProtocol for Parse {
    const MSGTYPE: u8 = b'P';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Parse { part: ParsePart::decode(body)? })
    }
}

/// Legacy type description request; gone from modern protocol versions.
#[derive(Debug)]
pub struct Describe {
    pub options: QueryOptions,
    pub mode: u8,
    pub stmt_name: Bytes,
}

impl ClientProtocol for Describe {
    const MSGTYPE: u8 = b'D';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let options = QueryOptions::parse(body)?;
        let mode = body.try_get_u8()?;
        let stmt_name = body.get_lp_bytes()?;
        Ok(Describe { options, mode, stmt_name })
    }
}

/// Execute the last anonymously parsed query.
#[derive(Debug)]
pub struct Execute {
    pub options: QueryOptions,
    pub stmt_name: Bytes,
    pub bind_args: Bytes,
}

impl ClientProtocol for Execute {
    const MSGTYPE: u8 = b'E';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let options = QueryOptions::parse(body)?;
        let stmt_name = body.get_lp_bytes()?;
        let bind_args = body.get_lp_bytes()?;
        Ok(Execute { options, stmt_name, bind_args })
    }
}

/// Parse and execute in one round trip, betting the cached type ids still
/// match.
#[derive(Debug)]
pub struct OptimisticExecute {
    pub part: ParsePart,
    pub in_type_id: TypeId,
    pub out_type_id: TypeId,
    pub bind_args: Bytes,
}

impl ClientProtocol for OptimisticExecute {
    const MSGTYPE: u8 = b'O';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let part = ParsePart::decode(body)?;
        let in_type_id = body.get_type_id()?;
        let out_type_id = body.get_type_id()?;
        let bind_args = body.get_lp_bytes()?;
        Ok(OptimisticExecute { part, in_type_id, out_type_id, bind_args })
    }
}

/// Describe-and-execute without arguments.
#[derive(Debug)]
pub struct FastQuery {
    pub part: ParsePart,
    pub mode: u8,
    pub bind_args: Bytes,
}

impl ClientProtocol for FastQuery {
    const MSGTYPE: u8 = b'F';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let part = ParsePart::decode(body)?;
        let mode = body.try_get_u8()?;
        let bind_args = body.get_lp_bytes()?;
        Ok(FastQuery { part, mode, bind_args })
    }
}

/// Multi-statement script.
#[derive(Debug)]
pub struct SimpleQuery {
    pub options: QueryOptions,
    pub query: String,
}

impl ClientProtocol for SimpleQuery {
    const MSGTYPE: u8 = b'Q';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let options = QueryOptions::parse(body)?;
        let query = body.get_lp_str()?;
        Ok(SimpleQuery { options, query })
    }
}

/// Request a database dump.
#[derive(Debug)]
pub struct Dump {
    pub options: QueryOptions,
}

impl ClientProtocol for Dump {
    const MSGTYPE: u8 = b'>';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Dump { options: QueryOptions::parse(body)? })
    }
}

/// Restore a database from a dump stream.
#[derive(Debug)]
pub struct Restore {
    pub options: QueryOptions,
    pub jobs: u16,
    pub data: Bytes,
}

impl ClientProtocol for Restore {
    const MSGTYPE: u8 = b'<';

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let options = QueryOptions::parse(body)?;
        let jobs = body.try_get_u16()?;
        let data = body.split_to(body.len());
        Ok(Restore { options, jobs, data })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl ClientProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn decode(_: &mut Bytes) -> Result<Self, ProtocolError> {
                Ok(Self)
            }
        }
    )*};
}

unit_msg! {
    /// Barrier: flush and report readiness.
    struct Sync, b'S';

    /// Close the connection.
    struct Terminate, b'X';
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use super::*;
    use crate::protocol::ext::BufMutExt;

    fn empty_headers(buf: &mut Vec<u8>) {
        buf.put_u16(0);
    }

    #[test]
    fn parse_message_roundtrip() {
        let mut raw = Vec::new();
        raw.put_u16(1);
        raw.put_u16(header::IMPLICIT_LIMIT);
        raw.put_lp_str("100");
        raw.put_u8(b'b');
        raw.put_u8(b'm');
        raw.put_lp_bytes(b"");
        raw.put_lp_str("SELECT 1");

        let mut body = Bytes::from(raw);
        let msg = Parse::decode(&mut body).unwrap();
        assert!(body.is_empty());
        assert_eq!(msg.part.query, "SELECT 1");
        assert_eq!(msg.part.options.implicit_limit, 100);
        assert_eq!(msg.part.output_format, OutputFormat::Binary);
        assert!(!msg.part.expect_one);
        assert!(msg.part.stmt_name.is_empty());
    }

    #[test]
    fn unknown_header_key_fails() {
        let mut raw = Vec::new();
        raw.put_u16(1);
        raw.put_u16(0xBEEF);
        raw.put_lp_bytes(b"x");
        let mut body = Bytes::from(raw);
        assert!(matches!(
            QueryOptions::parse(&mut body),
            Err(ProtocolError::UnknownHeader(0xBEEF))
        ));
    }

    #[test]
    fn allow_capabilities_header() {
        let mut raw = Vec::new();
        raw.put_u16(1);
        raw.put_u16(header::ALLOW_CAPABILITIES);
        raw.put_u32(8);
        raw.put_u64(Capability::TRANSACTION.bits());
        let mut body = Bytes::from(raw);
        let options = QueryOptions::parse(&mut body).unwrap();
        assert_eq!(options.allow_capabilities, Capability::TRANSACTION);
    }

    #[test]
    fn bad_bool_header_fails() {
        let mut raw = Vec::new();
        raw.put_u16(1);
        raw.put_u16(header::IMPLICIT_TYPEIDS);
        raw.put_lp_bytes(b"yes");
        let mut body = Bytes::from(raw);
        assert!(matches!(
            QueryOptions::parse(&mut body),
            Err(ProtocolError::BadHeaderValue(_))
        ));
    }

    #[test]
    fn handshake_with_params_and_extensions() {
        let mut raw = Vec::new();
        raw.put_u16(0);
        raw.put_u16(13);
        raw.put_u16(2);
        raw.put_lp_str("user");
        raw.put_lp_str("edgedb");
        raw.put_lp_str("database");
        raw.put_lp_str("main");
        raw.put_u16(1);
        raw.put_lp_str("my_ext");
        raw.put_u16(1);
        raw.put_u16(0x0001);
        raw.put_lp_bytes(b"v");

        let mut body = Bytes::from(raw);
        let hs = Handshake::decode(&mut body).unwrap();
        assert!(body.is_empty());
        assert_eq!((hs.major, hs.minor), (0, 13));
        assert_eq!(hs.param("user"), Some("edgedb"));
        assert_eq!(hs.param("database"), Some("main"));
        assert_eq!(hs.extensions, ["my_ext"]);
    }

    #[test]
    fn optimistic_execute_carries_type_ids() {
        let mut raw = Vec::new();
        empty_headers(&mut raw);
        raw.put_u8(b'j');
        raw.put_u8(b'o');
        raw.put_lp_bytes(b"");
        raw.put_lp_str("SELECT 1");
        raw.put_slice(&[1; 16]);
        raw.put_slice(&[2; 16]);
        raw.put_lp_bytes(b"args");

        let mut body = Bytes::from(raw);
        let msg = OptimisticExecute::decode(&mut body).unwrap();
        assert_eq!(msg.in_type_id, TypeId([1; 16]));
        assert_eq!(msg.out_type_id, TypeId([2; 16]));
        assert_eq!(&msg.bind_args[..], b"args");
        assert!(msg.part.expect_one);
        assert_eq!(msg.part.output_format, OutputFormat::Json);
    }

    #[test]
    fn truncated_message_fails() {
        let mut raw = Vec::new();
        empty_headers(&mut raw);
        raw.put_u8(b'b');
        let mut body = Bytes::from(raw);
        assert!(matches!(
            Parse::decode(&mut body),
            Err(ProtocolError::Incomplete)
        ));
    }
}
