//! Single-identity public key authentication

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use sp_core::AuthenticationError;

use crate::keys::PublicKeySource;

/// How the client tried to authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Key offered without a signature (probe)
    PublicKeyOffered,
    /// Signed public key attempt
    PublicKey,
}

impl AuthMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::PublicKeyOffered => "publickey (offered)",
            Self::PublicKey => "publickey",
        }
    }
}

/// Counters of authentication outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Accepts exactly one user presenting exactly one public key
#[derive(Debug)]
pub struct AuthGate {
    user: String,
    key_blob: Vec<u8>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl AuthGate {
    pub fn new(user: impl Into<String>, credential: &dyn PublicKeySource) -> Self {
        Self {
            user: user.into(),
            key_blob: credential.public_key_blob(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Compare a presented identity without recording anything
    pub fn evaluate(&self, user: &str, key: &dyn PublicKeySource) -> Result<(), AuthenticationError> {
        if user != self.user {
            return Err(AuthenticationError::InvalidUser(user.to_string()));
        }
        if key.public_key_blob() != self.key_blob {
            return Err(AuthenticationError::UnauthorizedKey);
        }
        Ok(())
    }

    /// Evaluate an attempt and record its outcome before returning it
    pub fn check(
        &self,
        peer: SocketAddr,
        user: &str,
        key: &dyn PublicKeySource,
        method: AuthMethod,
    ) -> Result<(), AuthenticationError> {
        let outcome = self.evaluate(user, key);
        self.record(peer, user, method, &outcome);
        outcome
    }

    /// Record an attempt whose outcome is already known
    pub fn record(
        &self,
        peer: SocketAddr,
        user: &str,
        method: AuthMethod,
        outcome: &Result<(), AuthenticationError>,
    ) {
        match outcome {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Accepted {} for {} from {}", method.as_str(), user, peer);
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Rejected {} for {} from {}: {}",
                    method.as_str(),
                    user,
                    peer,
                    e
                );
            }
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn stats(&self) -> AuthStats {
        AuthStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedKey(Vec<u8>);

    impl PublicKeySource for FixedKey {
        fn public_key_blob(&self) -> Vec<u8> {
            self.0.clone()
        }

        fn fingerprint(&self) -> String {
            "test".to_string()
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_exact_identity_accepted() {
        let gate = AuthGate::new("packer", &FixedKey(vec![1, 2, 3]));
        let result = gate.check(peer(), "packer", &FixedKey(vec![1, 2, 3]), AuthMethod::PublicKey);
        assert_eq!(result, Ok(()));
        assert_eq!(gate.stats(), AuthStats { accepted: 1, rejected: 0 });
    }

    #[test]
    fn test_wrong_user_rejected() {
        let gate = AuthGate::new("packer", &FixedKey(vec![1, 2, 3]));
        let result = gate.check(peer(), "root", &FixedKey(vec![1, 2, 3]), AuthMethod::PublicKey);
        assert_eq!(result, Err(AuthenticationError::InvalidUser("root".to_string())));
        assert_eq!(gate.stats().rejected, 1);
    }

    #[test]
    fn test_user_match_is_case_sensitive() {
        let gate = AuthGate::new("packer", &FixedKey(vec![1]));
        assert!(gate.evaluate("Packer", &FixedKey(vec![1])).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let gate = AuthGate::new("packer", &FixedKey(vec![1, 2, 3]));
        let result = gate.check(peer(), "packer", &FixedKey(vec![1, 2, 4]), AuthMethod::PublicKey);
        assert_eq!(result, Err(AuthenticationError::UnauthorizedKey));
    }

    #[test]
    fn test_evaluate_does_not_count() {
        let gate = AuthGate::new("packer", &FixedKey(vec![9]));
        let _ = gate.evaluate("packer", &FixedKey(vec![9]));
        let _ = gate.evaluate("nobody", &FixedKey(vec![9]));
        assert_eq!(gate.stats(), AuthStats::default());
    }
}
