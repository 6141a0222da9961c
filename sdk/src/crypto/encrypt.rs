use {
    super::{
        error::{log_failure, Error, Result},
        io::{CbcEncryptWriter, HashingWriter, IvPrefixWriter, MacWriter, PaddingWriter},
        is_test_environment,
    },
    crate::store::{with_unlink_on_error, AttachmentRoot},
    kuvert_protocol::{
        padded_size, AttachmentIv, AttachmentKeys, PlaintextHash, AES_CBC_BLOCK_SIZE,
        DIGEST_LENGTH, IV_LENGTH, MAC_LENGTH,
    },
    sha2::{Digest, Sha256},
    std::{
        io::{self, Read, Write},
        path::Path,
    },
    subtle::ConstantTimeEq,
    tracing::instrument,
};

/// Where the plaintext of an encryption comes from.
pub enum PlaintextSource<'a> {
    Bytes(&'a [u8]),
    Reader(&'a mut dyn Read),
    File(&'a Path),
}

/// Overrides the random IV. Both variants bypass the freshness guarantee of
/// a random IV, hence the name.
#[derive(Clone, Debug)]
pub enum DangerousIv {
    /// Pins the IV so test vectors are reproducible. Rejected outside a test
    /// environment.
    ForTesting(AttachmentIv),
    /// Re-encrypting an attachment for backup with the IV it was originally
    /// encrypted under; the produced frame must hash to the digest the
    /// backup already stores, or the whole operation fails.
    ReencryptingForBackup {
        iv: AttachmentIv,
        digest_to_match: [u8; DIGEST_LENGTH],
    },
}

impl DangerousIv {
    pub fn for_testing(iv: &[u8]) -> Result<Self> {
        Ok(Self::ForTesting(iv_from_slice(iv)?))
    }

    pub fn reencrypting_for_backup(iv: &[u8], digest_to_match: &[u8]) -> Result<Self> {
        let digest_to_match =
            <[u8; DIGEST_LENGTH]>::try_from(digest_to_match).map_err(|_| {
                Error::InvalidDigestLength {
                    got: digest_to_match.len(),
                }
            })?;
        Ok(Self::ReencryptingForBackup {
            iv: iv_from_slice(iv)?,
            digest_to_match,
        })
    }
}

fn iv_from_slice(bytes: &[u8]) -> Result<AttachmentIv> {
    <[u8; IV_LENGTH]>::try_from(bytes)
        .map(AttachmentIv::from)
        .map_err(|_| Error::InvalidIvLength { got: bytes.len() })
}

pub struct EncryptOptions<'a> {
    pub keys: &'a AttachmentKeys,
    pub dangerous_iv: Option<DangerousIv>,
    /// Omits the zero padding stage. Rejected outside a test environment.
    pub dangerous_test_only_skip_padding: bool,
    /// Padding bucket policy; `kuvert_protocol::padded_size` unless the
    /// caller substitutes its own.
    pub pad_target: fn(u64) -> u64,
}

impl<'a> EncryptOptions<'a> {
    pub fn new(keys: &'a AttachmentKeys) -> Self {
        Self {
            keys,
            dangerous_iv: None,
            dangerous_test_only_skip_padding: false,
            pad_target: padded_size,
        }
    }
}

/// Everything a caller needs to persist or announce a freshly encrypted
/// attachment.
#[derive(Debug, Clone)]
pub struct EncryptedAttachment {
    /// SHA-256 over the complete frame.
    pub digest: [u8; DIGEST_LENGTH],
    pub iv: AttachmentIv,
    pub plaintext_hash: PlaintextHash,
    /// IV, ciphertext and MAC together.
    pub ciphertext_size: u64,
}

type EncryptChain<W> =
    HashingWriter<PaddingWriter<CbcEncryptWriter<IvPrefixWriter<MacWriter<HashingWriter<W>>>>>>;

/// The assembled encryption pipeline. Plaintext goes in through `Write`;
/// `finish` flushes the trailing padding, cipher and MAC stages and hands
/// back the sink together with the result record.
///
/// Also serves as the sink half of re-encryption: a decryption pipeline can
/// write straight into it.
pub struct Encryptor<W: Write> {
    chain: EncryptChain<W>,
    iv: AttachmentIv,
    digest_to_match: Option<[u8; DIGEST_LENGTH]>,
}

impl<W: Write> Encryptor<W> {
    pub fn new(sink: W, options: &EncryptOptions<'_>) -> Result<Self> {
        if options.dangerous_test_only_skip_padding && !is_test_environment() {
            return Err(Error::TestOnlyFeatureUsed);
        }
        let (iv, digest_to_match) = match &options.dangerous_iv {
            Some(DangerousIv::ForTesting(iv)) => {
                if !is_test_environment() {
                    return Err(Error::TestOnlyFeatureUsed);
                }
                (*iv, None)
            }
            Some(DangerousIv::ReencryptingForBackup {
                iv,
                digest_to_match,
            }) => (*iv, Some(*digest_to_match)),
            None => (
                AttachmentIv::generate().map_err(|err| Error::Io(io::Error::other(err)))?,
                None,
            ),
        };

        let (aes_key, mac_key) = options.keys.split();
        let digest_stage = HashingWriter::new(sink);
        let mac_stage = MacWriter::new(digest_stage, mac_key);
        let iv_stage = IvPrefixWriter::new(mac_stage, iv);
        let cipher_stage = CbcEncryptWriter::new(iv_stage, aes_key, &iv);
        let pad_target = (!options.dangerous_test_only_skip_padding).then_some(options.pad_target);
        let padding_stage = PaddingWriter::new(cipher_stage, pad_target);
        Ok(Self {
            chain: HashingWriter::new(padding_stage),
            iv,
            digest_to_match,
        })
    }

    pub fn finish(self) -> Result<(W, EncryptedAttachment)> {
        let Self {
            chain,
            iv,
            digest_to_match,
        } = self;
        let (sink, digest, plaintext_hash, ciphertext_size) = (|| -> io::Result<_> {
            let (padding_stage, plaintext_hash, _plaintext_size) = chain.finish()?;
            let cipher_stage = padding_stage.finish()?;
            let iv_stage = cipher_stage.finish()?;
            let mac_stage = iv_stage.finish()?;
            let (digest_stage, _mac) = mac_stage.finish()?;
            let (sink, digest, ciphertext_size) = digest_stage.finish()?;
            Ok((sink, digest, plaintext_hash, ciphertext_size))
        })()
        .map_err(Error::from_io)?;

        if let Some(expected) = digest_to_match {
            if !bool::from(digest.ct_eq(&expected)) {
                return Err(Error::ReencryptedDigestMismatch);
            }
        }
        Ok((
            sink,
            EncryptedAttachment {
                digest,
                iv,
                plaintext_hash: plaintext_hash.into(),
                ciphertext_size,
            },
        ))
    }
}

impl<W: Write> Write for Encryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.chain.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.chain.flush()
    }
}

fn drive<W: Write>(plaintext: PlaintextSource<'_>, encryptor: &mut Encryptor<W>) -> Result<()> {
    match plaintext {
        PlaintextSource::Bytes(bytes) => {
            encryptor.write_all(bytes).map_err(Error::from_io)?;
        }
        PlaintextSource::Reader(reader) => {
            io::copy(reader, encryptor).map_err(Error::from_io)?;
        }
        PlaintextSource::File(path) => {
            let mut file = fs_err::File::open(path)?;
            io::copy(&mut file, encryptor).map_err(Error::from_io)?;
        }
    }
    Ok(())
}

/// Encrypts and discards the frame, returning only the result record. Used
/// to learn the digest, plaintext hash and size an attachment would have.
pub fn encrypt_attachment(
    plaintext: PlaintextSource<'_>,
    options: &EncryptOptions<'_>,
) -> Result<EncryptedAttachment> {
    let mut sink = io::sink();
    encrypt_attachment_to_writer(plaintext, options, &mut sink)
}

pub fn encrypt_attachment_to_writer<W: Write>(
    plaintext: PlaintextSource<'_>,
    options: &EncryptOptions<'_>,
    sink: &mut W,
) -> Result<EncryptedAttachment> {
    let result = (|| {
        let mut encryptor = Encryptor::new(sink, options)?;
        drive(plaintext, &mut encryptor)?;
        let (_sink, encrypted) = encryptor.finish()?;
        Ok(encrypted)
    })();
    if let Err(err) = &result {
        log_failure(err, "attachment encryption failed");
    }
    result
}

/// Encrypts into a freshly allocated file under the attachment root. The
/// partial file is removed if anything fails, digest comparison included.
#[instrument(skip_all)]
pub fn encrypt_attachment_to_file(
    plaintext: PlaintextSource<'_>,
    options: &EncryptOptions<'_>,
    root: &AttachmentRoot,
) -> Result<(EncryptedAttachment, String)> {
    let (relative, absolute) = root.allocate()?;
    let encrypted = with_unlink_on_error(&absolute, |file| {
        let mut encryptor = Encryptor::new(file, options)?;
        drive(plaintext, &mut encryptor)?;
        let (_file, encrypted) = encryptor.finish()?;
        Ok(encrypted)
    });
    match encrypted {
        Ok(encrypted) => Ok((encrypted, relative)),
        Err(err) => {
            log_failure(&err, "attachment encryption failed");
            Err(err)
        }
    }
}

/// Frame size of an attachment of the given plaintext length under the
/// default padding policy.
pub fn ciphertext_length(plaintext_len: u64) -> u64 {
    (IV_LENGTH + MAC_LENGTH) as u64 + aes_cbc_ciphertext_length(padded_size(plaintext_len))
}

// PKCS#7 always appends a block, even for block-aligned input.
fn aes_cbc_ciphertext_length(len: u64) -> u64 {
    (len / AES_CBC_BLOCK_SIZE as u64 + 1) * AES_CBC_BLOCK_SIZE as u64
}

pub fn plaintext_hash_for_bytes(bytes: &[u8]) -> PlaintextHash {
    let digest: [u8; DIGEST_LENGTH] = Sha256::digest(bytes).into();
    digest.into()
}
