//! Optional credential verification for the hello handshake.

use async_trait::async_trait;
use relay_store::UserRepo;
use tracing::warn;

/// Checks an identity/secret pair during the handshake. The relay runs
/// open (no verifier) unless one is configured.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, identity: &str, secret: &str) -> bool;
}

/// Verifier backed by the user table.
pub struct StoreVerifier {
    users: UserRepo,
}

impl StoreVerifier {
    pub fn new(users: UserRepo) -> Self {
        Self { users }
    }
}

#[async_trait]
impl CredentialVerifier for StoreVerifier {
    async fn verify(&self, identity: &str, secret: &str) -> bool {
        match self.users.verify(identity, secret) {
            Ok(valid) => valid,
            Err(err) => {
                warn!(identity, error = %err, "credential lookup failed");
                false
            }
        }
    }
}
