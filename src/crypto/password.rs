use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString},
    Argon2, ParamsBuilder,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;
use crate::error::{AppError, Result};

/// The memory cost for Argon2 in MB.
const ARGON2_MEMORY_MB: u32 = 19;
/// The number of iterations for Argon2.
const ARGON2_ITERATIONS: u32 = 3;
/// The parallelism factor for Argon2.
const ARGON2_PARALLELISM: u32 = 6;

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug)]
pub struct HashParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: ARGON2_MEMORY_MB * 1024,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

/// One-way Argon2id password hashing.
///
/// Digests are PHC strings carrying their own salt and parameters. Verification
/// compares derived material in constant time.
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    /// Digest verified against when the account does not exist, so that a
    /// missing user costs the same as a wrong password.
    decoy_hash: String,
}

impl PasswordHasher {
    /// Creates a new `PasswordHasher` with the given cost parameters.
    pub fn new(params: HashParams) -> Result<Self> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            ParamsBuilder::new()
                .m_cost(params.memory_kib)
                .t_cost(params.iterations)
                .p_cost(params.parallelism)
                .build()
                .map_err(|e| AppError::Encryption(format!("Argon2 params: {}", e)))?,
        );

        let mut hasher = Self {
            argon2,
            decoy_hash: String::new(),
        };

        let mut decoy = [0u8; 32];
        OsRng.fill_bytes(&mut decoy);
        hasher.decoy_hash = hasher.hash(&hex::encode(decoy))?;

        Ok(hasher)
    }

    /// Hashes a password using Argon2id.
    ///
    /// # Arguments
    ///
    /// * `password` - The password to hash.
    ///
    /// # Returns
    ///
    /// A `Result` containing the PHC-formatted digest.
    pub fn hash(&self, password: &str) -> Result<String> {
        let password_bytes = Zeroizing::new(password.as_bytes().to_vec());

        let mut salt_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut salt_bytes);

        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| AppError::Encryption(format!("Salt encoding error: {}", e)))?;

        let password_hash = self
            .argon2
            .hash_password(&password_bytes, &salt)
            .map_err(|e| AppError::Encryption(format!("Argon2 hash error: {}", e)))?
            .to_string();

        tracing::debug!("Password hashed successfully with Argon2");
        Ok(password_hash)
    }

    /// Verifies a password against a digest.
    ///
    /// An unparsable digest verifies as `false`.
    pub fn verify(&self, hash: &str, password: &str) -> bool {
        let parsed_hash = match PasswordHash::new(hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!("Stored password hash is unparsable: {}", e);
                return false;
            }
        };

        self.argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok()
    }

    /// Spends the same work as [`PasswordHasher::verify`] without a real digest.
    pub fn verify_decoy(&self, password: &str) {
        let _ = self.verify(&self.decoy_hash, password);
    }
}
