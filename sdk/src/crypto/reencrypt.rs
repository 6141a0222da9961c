use {
    super::{
        decrypt::{decrypt_attachment_to_sink, DecryptOptions},
        encrypt::{EncryptOptions, Encryptor},
        error::{log_failure, Error, Result},
    },
    crate::store::{with_unlink_on_error, AttachmentRoot},
    kuvert_protocol::{AttachmentIv, AttachmentKeys, PlaintextHash, VERSION},
    serde::Serialize,
    std::io,
    tracing::instrument,
};

/// A remotely fetched attachment rekeyed into the local store.
#[derive(Debug, Serialize)]
pub struct ReencryptedAttachment {
    pub path: String,
    pub iv: AttachmentIv,
    /// Freshly generated combined key the new frame is encrypted under.
    pub local_key: AttachmentKeys,
    pub plaintext_hash: PlaintextHash,
    pub version: u32,
}

/// Decrypts a fetched frame and immediately re-encrypts it under a fresh
/// local key, writing a single output file. The decryption pipeline drains
/// straight into the encryption pipeline, so the plaintext never reaches
/// disk and both sides advance in lockstep.
#[instrument(skip_all, fields(id = options.id_for_logging))]
pub fn decrypt_and_reencrypt(
    options: &DecryptOptions<'_>,
    root: &AttachmentRoot,
) -> Result<ReencryptedAttachment> {
    let result: Result<_> = (|| {
        let local_key =
            AttachmentKeys::generate().map_err(|err| Error::Io(io::Error::other(err)))?;
        let (relative, absolute) = root.allocate()?;
        let (decrypted, encrypted) = with_unlink_on_error(&absolute, |file| {
            let mut encryptor = Encryptor::new(file, &EncryptOptions::new(&local_key))?;
            let decrypted = decrypt_attachment_to_sink(options, &mut encryptor)?;
            let (_file, encrypted) = encryptor.finish()?;
            Ok((decrypted, encrypted))
        })?;
        Ok(ReencryptedAttachment {
            path: relative,
            iv: encrypted.iv,
            local_key,
            plaintext_hash: decrypted.plaintext_hash,
            version: VERSION,
        })
    })();
    if let Err(err) = &result {
        log_failure(err, "attachment re-encryption failed");
    }
    result
}
