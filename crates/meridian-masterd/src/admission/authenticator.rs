//! Admission decision makers.

use meridian_core::protocol::Credential;
use std::sync::Mutex;
use subtle::ConstantTimeEq;

/// Decides whether a presented credential admits a node.
///
/// Implementations must be side-effect-free apart from consulting their own
/// backing state: verification can run concurrently from several admission
/// workers and may be retried. The broker ships a shared-secret
/// implementation; a session store or a real verifier can be slotted in
/// without touching the queue.
pub trait Authenticator: Send + Sync + 'static {
    /// Return true to admit the node presenting `credential`.
    fn verify(&self, credential: &Credential) -> bool;
}

/// Reference authenticator: compares credential bytes against a shared
/// secret.
///
/// Both credential kinds verify against the same secret here; issuing and
/// tracking session ids is a concern for a richer [`Authenticator`]. The
/// comparison is constant-time in the secret's contents.
#[derive(Debug)]
pub struct SharedSecret {
    secret: Mutex<Vec<u8>>,
}

impl SharedSecret {
    /// Build an authenticator holding `secret`.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Mutex::new(secret.into()),
        }
    }

    /// Replace the secret. Entries already verified are unaffected.
    pub fn set(&self, secret: impl Into<Vec<u8>>) {
        *self.secret.lock().expect("lock poisoned") = secret.into();
    }
}

impl Authenticator for SharedSecret {
    fn verify(&self, credential: &Credential) -> bool {
        let secret = self.secret.lock().expect("lock poisoned");
        bool::from(credential.bytes().ct_eq(&secret))
    }
}
