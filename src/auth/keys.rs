use rand::Rng;
use sha2::{Digest, Sha256};

const KEY_PREFIX: &str = "sk-mule-";
const KEY_RANDOM_LEN: usize = 32;

/// A newly generated API key containing the raw plaintext and its hash.
#[derive(Debug)]
pub struct GeneratedKey {
    /// The full plaintext key to display to the user exactly once.
    pub plaintext: String,
    /// The SHA-256 digest stored in the database and used for lookup.
    pub hash: String,
    /// The short prefix (e.g. "sk-mule-a1b2c3d4...") for display in listings.
    pub prefix: String,
}

/// Generate a new API key with the format `sk-mule-{32 alphanumeric}`.
pub fn generate_api_key() -> GeneratedKey {
    let random_part = generate_random_alphanumeric(KEY_RANDOM_LEN);
    let plaintext = format!("{KEY_PREFIX}{random_part}");
    let prefix = format!("{KEY_PREFIX}{}...", &random_part[..8]);
    let hash = hash_key(&plaintext);

    GeneratedKey {
        plaintext,
        hash,
        prefix,
    }
}

/// SHA-256 digest of a key, returned as a hex string.
///
/// Deterministic so that validation is an indexed equality lookup; keys are
/// presented on every provider registration and every API call, and carry
/// 190 bits of entropy, so no salted slow hash is needed on top.
pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a random alphanumeric string of the given length.
fn generate_random_alphanumeric(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
