use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

const TOKEN_LEN: usize = 48;
const NONCE_BYTES: usize = 16;

/// Generates opaque identifiers, lease nonces and token plaintexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn job_id(&self) -> String {
        prefixed("job")
    }

    pub fn workspace_id(&self) -> String {
        prefixed("ws")
    }

    pub fn session_id(&self) -> String {
        prefixed("sess")
    }

    /// Lowercase hex nonce for workspace leases.
    pub fn nonce(&self) -> String {
        let bytes: [u8; NONCE_BYTES] = rand::thread_rng().gen();
        hex::encode(bytes)
    }

    /// Alphanumeric token plaintext. Only its hash is ever stored.
    pub fn token(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect()
    }
}

fn prefixed(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
