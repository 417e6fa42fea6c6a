//! Authentication method selection.
//!
//! The engine sequences the wire exchange; the mechanisms themselves
//! (SCRAM state machines, JWT validation) are injected through
//! [`Verifier`].

use std::collections::HashMap;

use bytes::Bytes;

use crate::{Result, error::Error, net::Transport};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthMethod {
    Trust,
    Scram,
    Jwt,
}

/// Continuation of a SCRAM exchange: the server message for the next leg.
pub struct ScramContinue {
    pub server_message: Bytes,
}

/// Credential verification, implemented outside the core.
pub trait Verifier: Send + Sync {
    /// Handle the client-first SCRAM message.
    fn scram_first(&self, user: &str, client_first: &[u8]) -> Result<ScramContinue>;

    /// Handle the client-final SCRAM message, returning the server-final
    /// data.
    fn scram_final(&self, user: &str, client_final: &[u8]) -> Result<Bytes>;

    fn verify_jwt(&self, user: &str, token: &[u8]) -> Result<()>;
}

/// Rejects every credential-bearing method. Stands in where only `Trust`
/// is configured.
struct RejectAll;

impl Verifier for RejectAll {
    fn scram_first(&self, _: &str, _: &[u8]) -> Result<ScramContinue> {
        Err(Error::authentication("SCRAM is not configured"))
    }

    fn scram_final(&self, _: &str, _: &[u8]) -> Result<Bytes> {
        Err(Error::authentication("SCRAM is not configured"))
    }

    fn verify_jwt(&self, _: &str, _: &[u8]) -> Result<()> {
        Err(Error::authentication("JWT is not configured"))
    }
}

/// Per-server authentication table: a method per transport, user
/// overrides, and the verifier implementing the mechanisms.
pub struct AuthConfig {
    tcp_method: AuthMethod,
    unix_method: AuthMethod,
    user_methods: HashMap<String, AuthMethod>,
    verifier: Box<dyn Verifier>,
}

impl AuthConfig {
    pub fn new(
        tcp_method: AuthMethod,
        unix_method: AuthMethod,
        verifier: Box<dyn Verifier>,
    ) -> AuthConfig {
        AuthConfig {
            tcp_method,
            unix_method,
            user_methods: HashMap::new(),
            verifier,
        }
    }

    /// Trust every connection; for tests and local development.
    pub fn trust_all() -> AuthConfig {
        AuthConfig::new(AuthMethod::Trust, AuthMethod::Trust, Box::new(RejectAll))
    }

    pub fn set_user_method(&mut self, user: impl Into<String>, method: AuthMethod) {
        self.user_methods.insert(user.into(), method);
    }

    pub fn method_for(&self, transport: Transport, user: &str) -> AuthMethod {
        if let Some(method) = self.user_methods.get(user) {
            return *method;
        }
        match transport {
            Transport::Tcp => self.tcp_method,
            Transport::Unix => self.unix_method,
        }
    }

    pub fn verifier(&self) -> &dyn Verifier {
        &*self.verifier
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_selection() {
        let mut auth = AuthConfig::new(
            AuthMethod::Scram,
            AuthMethod::Trust,
            Box::new(RejectAll),
        );
        auth.set_user_method("metrics", AuthMethod::Jwt);

        assert_eq!(auth.method_for(Transport::Tcp, "alice"), AuthMethod::Scram);
        assert_eq!(auth.method_for(Transport::Unix, "alice"), AuthMethod::Trust);
        assert_eq!(auth.method_for(Transport::Tcp, "metrics"), AuthMethod::Jwt);
    }
}
