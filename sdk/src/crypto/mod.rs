//! Attachment content is protected with AES-256-CBC and an appended
//! HMAC-SHA-256 tag (encrypt-then-MAC; the construction is deliberately not
//! an AEAD mode). Every encrypted attachment is one self-contained frame:
//!
//! - IV (128 bits) - random per encryption, prepended to the ciphertext
//! - ciphertext - AES-256-CBC over the padded plaintext, PKCS#7 on the last
//!   block
//! - MAC (256 bits) - HMAC-SHA-256 over the IV and the ciphertext
//!
//! Before encryption the plaintext is extended with zero bytes up to its
//! padding bucket, so the frame length only leaks the bucket. Because the
//! zero padding is not self-describing, decryption must be told the original
//! plaintext length and trims everything past it.
//!
//! Two hashes ride along with every operation: the digest (SHA-256 over the
//! whole frame) lets a peer verify the frame end to end, and the plaintext
//! hash (SHA-256 over the unpadded plaintext, lowercase hex) is used for
//! content addressing and deduplication.
//!
//! When an attachment is fetched back from the backup service, the frame is
//! wrapped in a second, structurally identical frame under an independent
//! key pair. Decryption peels the outer frame first and verifies its MAC;
//! the digest is computed over the inner frame only.
//!
//! Both plaintext and ciphertext may exceed available memory, so every
//! operation is a chain of `Write` adapters driven from a streaming source;
//! nothing buffers more than a couple of cipher blocks plus the trailing
//! MAC window.

mod decrypt;
mod encrypt;
mod error;
mod io;
mod reencrypt;

pub use {
    decrypt::{
        decrypt_attachment, decrypt_attachment_to_sink, DecryptOptions, DecryptedAttachment,
        IntegrityCheck,
    },
    encrypt::{
        ciphertext_length, encrypt_attachment, encrypt_attachment_to_file,
        encrypt_attachment_to_writer, plaintext_hash_for_bytes, DangerousIv, EncryptOptions,
        EncryptedAttachment, Encryptor, PlaintextSource,
    },
    error::{Error, Result},
    reencrypt::{decrypt_and_reencrypt, ReencryptedAttachment},
};

/// Builds a combined key from raw bytes arriving off the wire or out of the
/// database. The base64 form is handled by `AttachmentKeys::from_str`.
pub fn attachment_keys_from_slice(bytes: &[u8]) -> Result<kuvert_protocol::AttachmentKeys> {
    kuvert_protocol::AttachmentKeys::from_slice(bytes)
        .map_err(|_| Error::InvalidKeyLength { got: bytes.len() })
}

/// Trusted environment query gating the dangerous encryption options.
///
/// Deliberately an environment variable rather than `cfg(test)`: the gate
/// stays observable from integration tests, and release builds can only
/// enable it explicitly.
pub fn is_test_environment() -> bool {
    std::env::var_os("KUVERT_TEST_ENVIRONMENT").is_some_and(|value| value == "1" || value == "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_gate() {
        assert!(attachment_keys_from_slice(&[0u8; 64]).is_ok());
        let err = attachment_keys_from_slice(&[0u8; 63]).unwrap_err();
        assert!(matches!(err, Error::InvalidKeyLength { got: 63 }));
    }
}
