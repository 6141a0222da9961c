use {
    super::{
        error::{log_failure, Error, Result},
        io::{CbcDecryptWriter, HashingWriter, HmacSha256, MacSplitWriter, TrimWriter},
    },
    crate::store::{with_unlink_on_error, AttachmentRoot},
    hmac::Mac,
    kuvert_protocol::{
        AttachmentIv, AttachmentKeys, PlaintextHash, DIGEST_LENGTH, KEY_LENGTH, MAC_LENGTH,
    },
    std::{
        io::{self, Write},
        path::Path,
    },
    subtle::ConstantTimeEq,
    tracing::instrument,
};

/// Which integrity checks run after the pipeline drains. The inner MAC is
/// always verified first.
#[derive(Debug)]
pub enum IntegrityCheck {
    /// Remotely produced frame: the computed digest must match the one the
    /// sender announced.
    Standard { their_digest: [u8; DIGEST_LENGTH] },
    /// This client produced the ciphertext itself; MAC only.
    Local,
    /// Thumbnail generated client-side after download; MAC only.
    BackupThumbnail,
}

impl IntegrityCheck {
    pub fn standard(their_digest: &[u8]) -> Result<Self> {
        let their_digest = <[u8; DIGEST_LENGTH]>::try_from(their_digest).map_err(|_| {
            Error::InvalidDigestLength {
                got: their_digest.len(),
            }
        })?;
        Ok(Self::Standard { their_digest })
    }
}

pub struct DecryptOptions<'a> {
    pub ciphertext_path: &'a Path,
    /// Opaque tag carried into diagnostics; never interpreted.
    pub id_for_logging: &'a str,
    /// Unpadded plaintext length as declared by the sender. Trusted: an
    /// undersized value truncates plaintext, an oversized one keeps padding.
    pub plaintext_size: u64,
    /// Combined key; `attachment_keys_from_slice` or
    /// `AttachmentKeys::from_str` build one from its wire forms.
    pub keys: &'a AttachmentKeys,
    pub integrity: IntegrityCheck,
    /// Present when the frame was fetched from the backup service, which
    /// wraps it in a second frame under its own keys.
    pub outer_keys: Option<&'a AttachmentKeys>,
}

#[derive(Debug, Clone)]
pub struct DecryptedAttachment {
    /// The IV observed in the (inner) frame.
    pub iv: AttachmentIv,
    pub plaintext_hash: PlaintextHash,
}

type InnerChain<W> = HashingWriter<MacSplitWriter<CbcDecryptWriter<TrimWriter<HashingWriter<W>>>>>;

fn inner_chain<W: Write>(
    sink: W,
    aes_key: &[u8; KEY_LENGTH],
    mac_key: &[u8; MAC_LENGTH],
    plaintext_size: u64,
) -> InnerChain<W> {
    let plaintext_hash_stage = HashingWriter::new(sink);
    let trim_stage = TrimWriter::new(plaintext_hash_stage, plaintext_size);
    let cipher_stage = CbcDecryptWriter::new(trim_stage, aes_key, false);
    let mac_stage = MacSplitWriter::new(cipher_stage, mac_key);
    // The digest tee sits inside any outer layer, so it always covers the
    // inner frame; with an outer layer present only the outer MAC guards the
    // outer bytes.
    HashingWriter::new(mac_stage)
}

struct InnerOutcome {
    iv: AttachmentIv,
    plaintext_hash: [u8; DIGEST_LENGTH],
    digest: [u8; DIGEST_LENGTH],
    hmac: HmacSha256,
    their_mac: [u8; MAC_LENGTH],
}

fn finish_inner<W: Write>(chain: InnerChain<W>) -> io::Result<InnerOutcome> {
    let (mac_stage, digest, _frame_size) = chain.finish()?;
    let (cipher_stage, hmac, their_mac) = mac_stage.finish()?;
    let (trim_stage, iv) = cipher_stage.finish()?;
    let plaintext_hash_stage = trim_stage.finish()?;
    let (_sink, plaintext_hash, _plaintext_size) = plaintext_hash_stage.finish()?;
    Ok(InnerOutcome {
        iv,
        plaintext_hash,
        digest,
        hmac,
        their_mac,
    })
}

type OuterVerdict = Option<(HmacSha256, [u8; MAC_LENGTH])>;

fn verify(
    outcome: InnerOutcome,
    integrity: &IntegrityCheck,
    outer: OuterVerdict,
) -> Result<DecryptedAttachment> {
    outcome
        .hmac
        .verify_slice(&outcome.their_mac)
        .map_err(|_| Error::BadMac)?;
    if let IntegrityCheck::Standard { their_digest } = integrity {
        if !bool::from(outcome.digest.ct_eq(their_digest)) {
            return Err(Error::BadDigest);
        }
    }
    if let Some((outer_hmac, outer_their_mac)) = outer {
        outer_hmac
            .verify_slice(&outer_their_mac)
            .map_err(|_| Error::BadOuterMac)?;
    }
    Ok(DecryptedAttachment {
        iv: outcome.iv,
        plaintext_hash: outcome.plaintext_hash.into(),
    })
}

fn run_to_sink<W: Write>(options: &DecryptOptions<'_>, sink: &mut W) -> Result<DecryptedAttachment> {
    let (aes_key, mac_key) = options.keys.split();
    let mut source = fs_err::File::open(options.ciphertext_path)?;
    let inner = inner_chain(sink, aes_key, mac_key, options.plaintext_size);

    let (outcome, outer) = if let Some(outer_keys) = options.outer_keys {
        let (outer_aes, outer_mac) = outer_keys.split();
        let cipher_stage = CbcDecryptWriter::new(inner, outer_aes, true);
        let mut outer_chain = MacSplitWriter::new(cipher_stage, outer_mac);
        io::copy(&mut source, &mut outer_chain).map_err(Error::from_io)?;
        (|| -> io::Result<_> {
            let (cipher_stage, outer_hmac, outer_their_mac) = outer_chain.finish()?;
            let (inner, _outer_iv) = cipher_stage.finish()?;
            let outcome = finish_inner(inner)?;
            Ok((outcome, Some((outer_hmac, outer_their_mac))))
        })()
        .map_err(Error::from_io)?
    } else {
        let mut chain = inner;
        io::copy(&mut source, &mut chain).map_err(Error::from_io)?;
        (finish_inner(chain).map_err(Error::from_io)?, None)
    };

    verify(outcome, &options.integrity, outer)
}

/// Decrypts into a caller-supplied sink. This is the primitive behind both
/// re-encryption and in-memory consumers.
#[instrument(skip_all, fields(id = options.id_for_logging))]
pub fn decrypt_attachment_to_sink<W: Write>(
    options: &DecryptOptions<'_>,
    sink: &mut W,
) -> Result<DecryptedAttachment> {
    let result = run_to_sink(options, sink);
    if let Err(err) = &result {
        log_failure(err, "attachment decryption failed");
    }
    result
}

/// Decrypts into a freshly allocated file under the attachment root and
/// returns its relative path. The partial file is removed if anything fails,
/// integrity checks included.
#[instrument(skip_all, fields(id = options.id_for_logging))]
pub fn decrypt_attachment(
    options: &DecryptOptions<'_>,
    root: &AttachmentRoot,
) -> Result<(DecryptedAttachment, String)> {
    let result: Result<_> = (|| {
        let (relative, absolute) = root.allocate()?;
        let decrypted = with_unlink_on_error(&absolute, |file| run_to_sink(options, file))?;
        Ok((decrypted, relative))
    })();
    if let Err(err) = &result {
        log_failure(err, "attachment decryption failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use {
        super::{
            super::encrypt::{
                encrypt_attachment_to_writer, EncryptOptions, EncryptedAttachment,
                PlaintextSource,
            },
            *,
        },
        kuvert_protocol::IV_LENGTH,
        tempfile::NamedTempFile,
    };

    fn write_frame(frame: &[u8]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        fs_err::write(file.path(), frame).unwrap();
        file
    }

    fn encrypt_to_frame(
        plaintext: &[u8],
        keys: &AttachmentKeys,
    ) -> (Vec<u8>, EncryptedAttachment) {
        let mut frame = Vec::new();
        let encrypted = encrypt_attachment_to_writer(
            PlaintextSource::Bytes(plaintext),
            &EncryptOptions::new(keys),
            &mut frame,
        )
        .unwrap();
        (frame, encrypted)
    }

    #[test]
    fn roundtrip_restores_plaintext() {
        let keys = AttachmentKeys::generate().unwrap();
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (frame, encrypted) = encrypt_to_frame(&plaintext, &keys);
        let file = write_frame(&frame);

        let mut decrypted = Vec::new();
        let result = decrypt_attachment_to_sink(
            &DecryptOptions {
                ciphertext_path: file.path(),
                id_for_logging: "roundtrip",
                plaintext_size: plaintext.len() as u64,
                keys: &keys,
                integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
                outer_keys: None,
            },
            &mut decrypted,
        )
        .unwrap();

        assert_eq!(decrypted, plaintext);
        assert_eq!(result.plaintext_hash, encrypted.plaintext_hash);
        assert_eq!(result.iv, encrypted.iv);
    }

    #[test]
    fn undersized_declared_length_truncates() {
        let keys = AttachmentKeys::generate().unwrap();
        let (frame, encrypted) = encrypt_to_frame(b"0123456789", &keys);
        let file = write_frame(&frame);

        let mut decrypted = Vec::new();
        decrypt_attachment_to_sink(
            &DecryptOptions {
                ciphertext_path: file.path(),
                id_for_logging: "truncating",
                plaintext_size: 4,
                keys: &keys,
                integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
                outer_keys: None,
            },
            &mut decrypted,
        )
        .unwrap();
        assert_eq!(decrypted, b"0123");
    }

    #[test]
    fn flipped_mac_byte_is_rejected() {
        let keys = AttachmentKeys::generate().unwrap();
        let (mut frame, encrypted) = encrypt_to_frame(b"tamper target", &keys);
        *frame.last_mut().unwrap() ^= 0x01;
        let file = write_frame(&frame);

        let mut sink = Vec::new();
        let err = decrypt_attachment_to_sink(
            &DecryptOptions {
                ciphertext_path: file.path(),
                id_for_logging: "bad-mac",
                plaintext_size: 13,
                keys: &keys,
                integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
                outer_keys: None,
            },
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadMac));
    }

    #[test]
    fn every_tampered_byte_is_rejected() {
        let keys = AttachmentKeys::generate().unwrap();
        let (frame, encrypted) = encrypt_to_frame(b"bit flips", &keys);

        // One position from each frame region: IV, ciphertext body, MAC.
        for index in [3, IV_LENGTH + 7, frame.len() - MAC_LENGTH + 1] {
            let mut tampered = frame.clone();
            tampered[index] ^= 0x80;
            let file = write_frame(&tampered);
            let mut sink = Vec::new();
            let err = decrypt_attachment_to_sink(
                &DecryptOptions {
                    ciphertext_path: file.path(),
                    id_for_logging: "bit-flip",
                    plaintext_size: 9,
                    keys: &keys,
                    integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
                    outer_keys: None,
                },
                &mut sink,
            )
            .unwrap_err();
            assert!(matches!(err, Error::BadMac), "index {index}: {err}");
        }
    }

    #[test]
    fn wrong_digest_is_rejected_after_mac() {
        let keys = AttachmentKeys::generate().unwrap();
        let (frame, _) = encrypt_to_frame(b"digest check", &keys);
        let file = write_frame(&frame);

        let mut sink = Vec::new();
        let err = decrypt_attachment_to_sink(
            &DecryptOptions {
                ciphertext_path: file.path(),
                id_for_logging: "bad-digest",
                plaintext_size: 12,
                keys: &keys,
                integrity: IntegrityCheck::standard(&[0u8; DIGEST_LENGTH]).unwrap(),
                outer_keys: None,
            },
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadDigest));
    }

    #[test]
    fn local_mode_skips_digest_comparison() {
        let keys = AttachmentKeys::generate().unwrap();
        let (frame, _) = encrypt_to_frame(b"local file", &keys);
        let file = write_frame(&frame);

        let mut sink = Vec::new();
        decrypt_attachment_to_sink(
            &DecryptOptions {
                ciphertext_path: file.path(),
                id_for_logging: "local",
                plaintext_size: 10,
                keys: &keys,
                integrity: IntegrityCheck::Local,
                outer_keys: None,
            },
            &mut sink,
        )
        .unwrap();
        assert_eq!(sink, b"local file");
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let keys = AttachmentKeys::generate().unwrap();
        let (frame, encrypted) = encrypt_to_frame(b"shrinking", &keys);

        for keep in [frame.len() - 1, MAC_LENGTH - 1, 0] {
            let file = write_frame(&frame[..keep]);
            let mut sink = Vec::new();
            let err = decrypt_attachment_to_sink(
                &DecryptOptions {
                    ciphertext_path: file.path(),
                    id_for_logging: "truncated",
                    plaintext_size: 9,
                    keys: &keys,
                    integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
                    outer_keys: None,
                },
                &mut sink,
            )
            .unwrap_err();
            assert!(
                matches!(err, Error::TruncatedFrame | Error::BadMac),
                "keep {keep}: {err}"
            );
        }
    }

    #[test]
    fn digest_length_gate() {
        let err = IntegrityCheck::standard(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, Error::InvalidDigestLength { got: 16 }));
    }

    #[test]
    fn outer_layer_peels_before_inner_frame() {
        std::env::set_var("KUVERT_TEST_ENVIRONMENT", "1");
        let inner_keys = AttachmentKeys::generate().unwrap();
        let outer_keys = AttachmentKeys::generate().unwrap();
        let plaintext = b"wrapped for backup";
        let (inner_frame, encrypted) = encrypt_to_frame(plaintext, &inner_keys);

        // The backup service wraps the finished frame as-is, without a
        // second round of bucket padding.
        let outer_options = EncryptOptions {
            dangerous_test_only_skip_padding: true,
            ..EncryptOptions::new(&outer_keys)
        };
        let mut outer_frame = Vec::new();
        encrypt_attachment_to_writer(
            PlaintextSource::Bytes(&inner_frame),
            &outer_options,
            &mut outer_frame,
        )
        .unwrap();

        let file = write_frame(&outer_frame);
        let mut decrypted = Vec::new();
        let result = decrypt_attachment_to_sink(
            &DecryptOptions {
                ciphertext_path: file.path(),
                id_for_logging: "outer",
                plaintext_size: plaintext.len() as u64,
                keys: &inner_keys,
                // The digest covers the inner frame even when an outer
                // layer is present.
                integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
                outer_keys: Some(&outer_keys),
            },
            &mut decrypted,
        )
        .unwrap();
        assert_eq!(decrypted, plaintext);
        assert_eq!(result.plaintext_hash, encrypted.plaintext_hash);
        assert_eq!(result.iv, encrypted.iv);

        // A flipped byte in the outer MAC passes every inner check and must
        // still fail.
        let mut tampered = outer_frame.clone();
        *tampered.last_mut().unwrap() ^= 0x01;
        let file = write_frame(&tampered);
        let mut sink = Vec::new();
        let err = decrypt_attachment_to_sink(
            &DecryptOptions {
                ciphertext_path: file.path(),
                id_for_logging: "outer-tampered",
                plaintext_size: plaintext.len() as u64,
                keys: &inner_keys,
                integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
                outer_keys: Some(&outer_keys),
            },
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadOuterMac));
    }
}
