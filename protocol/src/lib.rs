use {
    anyhow::{ensure, Error},
    serde::{de, Deserialize, Deserializer, Serialize, Serializer},
    std::{
        borrow::Cow,
        fmt::{self, Debug, Display},
        str::FromStr,
    },
};

pub mod keys;

pub use keys::{AttachmentIv, AttachmentKeys};

/// Attachment frame format produced and consumed by the current client.
pub const VERSION: u32 = 2;

/// Length of the AES-256 half of a combined key.
pub const KEY_LENGTH: usize = 32;
/// Length of the HMAC-SHA-256 half of a combined key.
pub const MAC_LENGTH: usize = 32;
/// Length of a combined key: AES key followed by MAC key.
pub const KEY_SET_LENGTH: usize = KEY_LENGTH + MAC_LENGTH;
pub const IV_LENGTH: usize = 16;
pub const DIGEST_LENGTH: usize = 32;
pub const HEX_DIGEST_LENGTH: usize = 64;
pub const AES_CBC_BLOCK_SIZE: usize = 16;

/// Smallest padded size; attachments below this all land in one bucket.
pub const MIN_PADDED_SIZE: u64 = 541;

const BUCKET_BASE: f64 = 1.05;

/// Rounds a plaintext length up to its padding bucket.
///
/// Buckets grow by 5% per step, so an attachment's padded size leaks at most
/// which bucket it falls into. Deterministic, and always at least the input.
pub fn padded_size(plaintext_len: u64) -> u64 {
    if plaintext_len <= MIN_PADDED_SIZE {
        return MIN_PADDED_SIZE;
    }
    let exponent = (plaintext_len as f64).ln() / BUCKET_BASE.ln();
    let bucket = BUCKET_BASE.powf(exponent.ceil()).floor() as u64;
    // Clamps float rounding at bucket edges; the result may never shrink.
    bucket.max(plaintext_len)
}

/// SHA-256 of an attachment's unpadded plaintext, used for content addressing
/// and deduplication. Rendered as lowercase hex everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaintextHash([u8; DIGEST_LENGTH]);

impl PlaintextHash {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }
}

impl From<[u8; DIGEST_LENGTH]> for PlaintextHash {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Display for PlaintextHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for PlaintextHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlaintextHash({})", hex::encode(self.0))
    }
}

impl FromStr for PlaintextHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(
            s.len() == HEX_DIGEST_LENGTH,
            "invalid hash length; got {}, expected {HEX_DIGEST_LENGTH}",
            s.len(),
        );
        let mut bytes = [0u8; DIGEST_LENGTH];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for PlaintextHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PlaintextHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}
