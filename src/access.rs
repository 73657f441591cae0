use argon2::{
    password_hash::{
        rand_core::OsRng, Error as PasswordHashError, PasswordHash, PasswordHasher,
        PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};
use thiserror::Error;
use tokio::task;

/// Argon2 memory cost in kibibytes (~19 MB).
pub const DEFAULT_MEMORY_COST_KIB: u32 = 19_456;
/// Argon2 time cost (iterations).
pub const DEFAULT_TIME_COST: u32 = 2;
/// Argon2 parallelism (lanes).
pub const DEFAULT_PARALLELISM: u32 = 1;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("key hashing join error: {0}")]
    Join(#[from] task::JoinError),
    #[error("key hashing error: {0:?}")]
    PasswordHash(PasswordHashError),
    #[error("argon2 error: {0:?}")]
    Argon2(argon2::Error),
}

/// Hashes and verifies the optional key guarding an entry's retrieval.
///
/// The stored value is a salted Argon2id hash string; the plaintext key is
/// never persisted. Hashing runs on the blocking thread pool since the work
/// factor is deliberately slow.
#[derive(Debug, Clone, Copy)]
pub struct AccessGate {
    memory_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for AccessGate {
    fn default() -> Self {
        Self {
            memory_cost_kib: DEFAULT_MEMORY_COST_KIB,
            time_cost: DEFAULT_TIME_COST,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl AccessGate {
    pub fn new(memory_cost_kib: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            memory_cost_kib,
            time_cost,
            parallelism,
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, AccessError> {
        let params = Params::new(self.memory_cost_kib, self.time_cost, self.parallelism, None)
            .map_err(AccessError::Argon2)?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Hash a key for storage. Two calls with the same key produce different
    /// strings (fresh salt each time) that both verify.
    pub async fn hash(&self, key: &str) -> Result<String, AccessError> {
        let gate = *self;
        let key = key.to_owned();

        task::spawn_blocking(move || {
            let argon2 = gate.hasher()?;
            let salt = SaltString::generate(&mut OsRng);
            let hash = argon2
                .hash_password(key.as_bytes(), &salt)
                .map_err(AccessError::PasswordHash)?
                .to_string();
            Ok::<_, AccessError>(hash)
        })
        .await?
    }

    /// Check a key against a stored hash. `Ok(false)` means the key does not
    /// match; errors are reserved for malformed stored hashes. The underlying
    /// comparison is constant-time.
    pub async fn verify(&self, key: &str, stored_hash: &str) -> Result<bool, AccessError> {
        let key = key.to_owned();
        let stored_hash = stored_hash.to_owned();

        task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&stored_hash).map_err(AccessError::PasswordHash)?;
            match Argon2::default().verify_password(key.as_bytes(), &parsed) {
                Ok(()) => Ok(true),
                Err(PasswordHashError::Password) => Ok(false),
                Err(err) => Err(AccessError::PasswordHash(err)),
            }
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // low-cost parameters so the tests stay fast
    fn test_gate() -> AccessGate {
        AccessGate::new(64, 1, 1)
    }

    #[tokio::test]
    async fn same_key_hashes_differently_but_both_verify() {
        let gate = test_gate();

        let first = gate.hash("secret").await.unwrap();
        let second = gate.hash("secret").await.unwrap();
        assert_ne!(first, second);

        assert!(gate.verify("secret", &first).await.unwrap());
        assert!(gate.verify("secret", &second).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_key_fails_verification() {
        let gate = test_gate();
        let stored = gate.hash("secret").await.unwrap();

        assert!(!gate.verify("wrong", &stored).await.unwrap());
        assert!(!gate.verify("", &stored).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_stored_hash_is_an_error() {
        let gate = test_gate();
        assert!(gate.verify("secret", "not-a-hash").await.is_err());
    }
}
