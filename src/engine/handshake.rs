//! Protocol version negotiation.

use crate::protocol::{MAX_PROTOCOL, ProtocolVersion, client::Handshake};

pub(crate) struct Negotiation {
    /// Version the connection will speak.
    pub target: ProtocolVersion,
    /// Whether to announce it with a `NegotiateProtocolVersion` frame.
    pub announce: bool,
}

/// Clamp the requested version into the supported range.
///
/// Anything other than an extension-free request for the server maximum is
/// confirmed explicitly, so the client always learns the effective version.
/// No extensions are supported, so requesting any forces an announcement
/// regardless of version.
pub(crate) fn negotiate(handshake: &Handshake) -> Negotiation {
    let requested = ProtocolVersion::new(handshake.major, handshake.minor);
    let target = requested.clamp_supported();
    Negotiation {
        target,
        announce: requested != MAX_PROTOCOL || !handshake.extensions.is_empty(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{MIN_PROTOCOL, client::ClientProtocol, ext::BufMutExt};
    use bytes::{BufMut, Bytes};

    fn handshake(major: u16, minor: u16, extensions: &[&str]) -> Handshake {
        let mut raw = Vec::new();
        raw.put_u16(major);
        raw.put_u16(minor);
        raw.put_u16(0);
        raw.put_u16(extensions.len() as u16);
        for ext in extensions {
            raw.put_lp_str(ext);
            raw.put_u16(0);
        }
        Handshake::decode(&mut Bytes::from(raw)).unwrap()
    }

    #[test]
    fn exact_max_is_silent() {
        let n = negotiate(&handshake(MAX_PROTOCOL.major, MAX_PROTOCOL.minor, &[]));
        assert_eq!(n.target, MAX_PROTOCOL);
        assert!(!n.announce);
    }

    #[test]
    fn in_range_request_is_confirmed_verbatim() {
        let n = negotiate(&handshake(0, 10, &[]));
        assert_eq!(n.target, ProtocolVersion::new(0, 10));
        assert!(n.announce);
    }

    #[test]
    fn out_of_range_requests_are_clamped() {
        let n = negotiate(&handshake(2, 0, &[]));
        assert_eq!(n.target, MAX_PROTOCOL);
        assert!(n.announce);

        let n = negotiate(&handshake(0, 1, &[]));
        assert_eq!(n.target, MIN_PROTOCOL);
        assert!(n.announce);
    }

    #[test]
    fn extensions_force_announcement() {
        let n = negotiate(&handshake(0, 13, &["ext"]));
        assert_eq!(n.target, ProtocolVersion::new(0, 13));
        assert!(n.announce);

        // even an exact-maximum request is announced when it carries an
        // extension the server cannot honor
        let n = negotiate(&handshake(MAX_PROTOCOL.major, MAX_PROTOCOL.minor, &["ext"]));
        assert_eq!(n.target, MAX_PROTOCOL);
        assert!(n.announce);
    }
}
