use {
    kuvert_protocol::{DIGEST_LENGTH, IV_LENGTH, KEY_SET_LENGTH},
    std::io,
    thiserror::Error as ThisError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything an attachment crypto operation can fail with. Integrity
/// failures (`BadMac`, `BadOuterMac`, `BadDigest`, `ReencryptedDigestMismatch`)
/// are equally fatal: the output must be discarded. No variant carries key
/// material or plaintext.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid key length; got {got}, expected {KEY_SET_LENGTH}")]
    InvalidKeyLength { got: usize },

    #[error("invalid IV length; got {got}, expected {IV_LENGTH}")]
    InvalidIvLength { got: usize },

    #[error("invalid digest length; got {got}, expected {DIGEST_LENGTH}")]
    InvalidDigestLength { got: usize },

    #[error("dangerous option used outside a test environment")]
    TestOnlyFeatureUsed,

    #[error("MAC mismatch")]
    BadMac,

    #[error("outer layer MAC mismatch")]
    BadOuterMac,

    #[error("digest mismatch")]
    BadDigest,

    #[error("reencrypted frame digest does not match the stored digest")]
    ReencryptedDigestMismatch,

    #[error("ciphertext ended before a complete frame was read")]
    TruncatedFrame,

    #[error("operation aborted")]
    Aborted,

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Wraps the error so it can travel through a `std::io::Write` stage.
    /// `from_io` on the other side restores the original variant.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            other => io::Error::other(other),
        }
    }

    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(err) => err,
            Err(err) => Self::Io(err),
        }
    }
}

/// Failures are logged where the operation was invoked; externally-requested
/// aborts are re-raised without noise.
pub(crate) fn log_failure(err: &Error, message: &'static str) {
    if !err.is_aborted() {
        tracing::error!(%err, "{message}");
    }
}
