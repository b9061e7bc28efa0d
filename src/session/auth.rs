//! Credential logging and the authentication policy
//!
//! Every attempt is recorded before a decision goes back to the transport.
//! Passwords are always accepted; public keys are refused with the method
//! list narrowed to `password`, so the client falls back to a password.

use chrono::{DateTime, Utc};
use russh::keys::{HashAlg, PublicKey, PublicKeyBase64};
use russh::server::Auth;
use russh::{MethodKind, MethodSet};
use std::fmt;
use std::net::IpAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    /// Failure reply that leaves only password to continue with.
    ///
    /// russh clears `partial_success` on the wire for public-key requests, so
    /// clients see a plain failure; the narrowed method list is what steers
    /// them to password.
    Partial,
    Reject,
}

impl AuthDecision {
    pub fn into_auth(self) -> Auth {
        match self {
            AuthDecision::Accept => Auth::Accept,
            AuthDecision::Partial => Auth::Reject {
                proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
                partial_success: true,
            },
            AuthDecision::Reject => Auth::Reject {
                proceed_with_methods: Some(allowed_methods()),
                partial_success: false,
            },
        }
    }
}

impl fmt::Display for AuthDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthDecision::Accept => write!(f, "accept"),
            AuthDecision::Partial => write!(f, "partial"),
            AuthDecision::Reject => write!(f, "reject"),
        }
    }
}

/// Methods advertised to clients.
pub fn allowed_methods() -> MethodSet {
    MethodSet::from([MethodKind::PublicKey, MethodKind::Password].as_slice())
}

/// What a public key looks like in the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDetails {
    pub algorithm: String,
    pub fingerprint: String,
    pub base64: String,
    pub bits: Option<usize>,
}

impl From<&PublicKey> for KeyDetails {
    fn from(key: &PublicKey) -> Self {
        Self {
            algorithm: key.algorithm().as_str().to_string(),
            fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
            base64: key.public_key_base64(),
            bits: key_bits(key),
        }
    }
}

fn key_bits(key: &PublicKey) -> Option<usize> {
    let data = key.key_data();
    if data.ed25519().is_some() {
        return Some(256);
    }
    if let Some(rsa) = data.rsa() {
        return Some(mpint_bits(rsa.n.as_bytes()));
    }
    // ecdsa-sha2-nistp256 and friends carry the size in the name
    let algorithm = key.algorithm();
    algorithm
        .as_str()
        .rsplit("nistp")
        .next()
        .filter(|_| data.ecdsa().is_some())
        .and_then(|size| size.parse().ok())
}

fn mpint_bits(bytes: &[u8]) -> usize {
    let mut significant = bytes.iter().skip_while(|b| **b == 0);
    match significant.next() {
        Some(first) => {
            let rest = significant.count();
            rest * 8 + (8 - first.leading_zeros() as usize)
        }
        None => 0,
    }
}

#[derive(Debug, Clone)]
pub enum Credential {
    None,
    Password(String),
    PublicKey(KeyDetails),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::None => "none",
            Credential::Password(_) => "password",
            Credential::PublicKey(_) => "publickey",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthAttempt {
    pub username: String,
    pub credential: Credential,
    pub decision: AuthDecision,
    pub timestamp: DateTime<Utc>,
}

impl AuthAttempt {
    fn log(&self, peer: IpAddr) {
        let decision = self.decision.to_string();
        let timestamp = self.timestamp.to_rfc3339();
        match &self.credential {
            Credential::None => info!(
                peer = %peer,
                username = %self.username,
                method = self.credential.kind(),
                decision = %decision,
                timestamp = %timestamp,
                "Authentication attempt"
            ),
            Credential::Password(password) => info!(
                peer = %peer,
                username = %self.username,
                method = self.credential.kind(),
                password = %password,
                decision = %decision,
                timestamp = %timestamp,
                "Authentication attempt"
            ),
            Credential::PublicKey(key) => info!(
                peer = %peer,
                username = %self.username,
                method = self.credential.kind(),
                key_type = %key.algorithm,
                fingerprint = %key.fingerprint,
                key_base64 = %key.base64,
                key_bits = ?key.bits,
                decision = %decision,
                timestamp = %timestamp,
                "Authentication attempt"
            ),
        }
    }
}

/// Per-connection authentication policy.
#[derive(Debug, Clone, Copy)]
pub struct AuthPolicy {
    peer: IpAddr,
}

impl AuthPolicy {
    pub fn new(peer: IpAddr) -> Self {
        Self { peer }
    }

    fn record(&self, username: &str, credential: Credential, decision: AuthDecision) -> AuthDecision {
        let attempt = AuthAttempt {
            username: username.to_string(),
            credential,
            decision,
            timestamp: Utc::now(),
        };
        attempt.log(self.peer);
        attempt.decision
    }

    pub fn check_password(&self, username: &str, password: &str) -> AuthDecision {
        self.record(
            username,
            Credential::Password(password.to_string()),
            AuthDecision::Accept,
        )
    }

    pub fn check_public_key(&self, username: &str, key: &PublicKey) -> AuthDecision {
        self.record(
            username,
            Credential::PublicKey(KeyDetails::from(key)),
            AuthDecision::Partial,
        )
    }

    pub fn check_none(&self, username: &str) -> AuthDecision {
        self.record(username, Credential::None, AuthDecision::Reject)
    }
}
