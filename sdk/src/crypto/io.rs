use {
    super::error::Error,
    aes::Aes256,
    block_padding::Pkcs7,
    cbc::cipher::{generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit},
    hmac::{Hmac, Mac},
    kuvert_protocol::{
        AttachmentIv, AES_CBC_BLOCK_SIZE, DIGEST_LENGTH, IV_LENGTH, KEY_LENGTH, MAC_LENGTH,
    },
    sha2::{Digest, Sha256},
    std::io::{self, Write},
};

pub(crate) type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEncryptor = cbc::Encryptor<Aes256>;
type Aes256CbcDecryptor = cbc::Decryptor<Aes256>;

pub(crate) fn new_hmac(mac_key: &[u8; MAC_LENGTH]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(mac_key).expect("HMAC-SHA-256 accepts any key length")
}

/// Passes through any writes and calculates the SHA-256 hash and size of the
/// written data.
pub(crate) struct HashingWriter<W> {
    hasher: Sha256,
    size: u64,
    inner: W,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            hasher: Sha256::new(),
            size: 0,
            inner,
        }
    }

    pub fn finish(mut self) -> io::Result<(W, [u8; DIGEST_LENGTH], u64)>
    where
        W: Write,
    {
        self.inner.flush()?;
        Ok((self.inner, self.hasher.finalize().into(), self.size))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.inner.write(buf)?;
        let written = buf
            .get(..len)
            .ok_or_else(|| io::Error::other("inner writer returned invalid length"))?;
        self.hasher.update(written);
        self.size += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Counts the plaintext bytes passing through and, on finish, extends the
/// stream with zero bytes up to the injected padding policy's target.
pub(crate) struct PaddingWriter<W> {
    inner: W,
    pad_target: Option<fn(u64) -> u64>,
    written: u64,
}

impl<W: Write> PaddingWriter<W> {
    pub fn new(inner: W, pad_target: Option<fn(u64) -> u64>) -> Self {
        Self {
            inner,
            pad_target,
            written: 0,
        }
    }

    pub fn finish(mut self) -> io::Result<W> {
        const ZERO_CHUNK: [u8; 4096] = [0u8; 4096];

        if let Some(pad_target) = self.pad_target {
            let target = pad_target(self.written);
            if target < self.written {
                return Err(Error::Internal("padding target below plaintext length").into_io());
            }
            let mut remaining = target - self.written;
            while remaining > 0 {
                let len = remaining.min(ZERO_CHUNK.len() as u64) as usize;
                self.inner.write_all(&ZERO_CHUNK[..len])?;
                remaining -= len as u64;
            }
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for PaddingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.inner.write(buf)?;
        self.written += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Emits the IV before the first forwarded byte (or on finish, if the stream
/// stays empty).
pub(crate) struct IvPrefixWriter<W> {
    inner: W,
    iv: AttachmentIv,
    iv_written: bool,
}

impl<W: Write> IvPrefixWriter<W> {
    pub fn new(inner: W, iv: AttachmentIv) -> Self {
        Self {
            inner,
            iv,
            iv_written: false,
        }
    }

    pub fn finish(mut self) -> io::Result<W> {
        if !self.iv_written {
            self.inner.write_all(self.iv.as_bytes())?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for IvPrefixWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.iv_written {
            self.inner.write_all(self.iv.as_bytes())?;
            self.iv_written = true;
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// HMAC-SHA-256 tee: re-emits every byte unchanged and appends the 32-byte
/// tag on finish.
pub(crate) struct MacWriter<W> {
    inner: W,
    hmac: HmacSha256,
}

impl<W: Write> MacWriter<W> {
    pub fn new(inner: W, mac_key: &[u8; MAC_LENGTH]) -> Self {
        Self {
            inner,
            hmac: new_hmac(mac_key),
        }
    }

    pub fn finish(mut self) -> io::Result<(W, [u8; MAC_LENGTH])> {
        let tag: [u8; MAC_LENGTH] = self.hmac.finalize().into_bytes().into();
        self.inner.write_all(&tag)?;
        Ok((self.inner, tag))
    }
}

impl<W: Write> Write for MacWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.inner.write(buf)?;
        let written = buf
            .get(..len)
            .ok_or_else(|| io::Error::other("inner writer returned invalid length"))?;
        self.hmac.update(written);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming MAC splitter: holds back the trailing 32 bytes of the stream,
/// forwarding (and HMAC-ing) only bytes known not to be the tag. The
/// retained tag is surfaced on finish without being forwarded.
pub(crate) struct MacSplitWriter<W> {
    inner: W,
    hmac: HmacSha256,
    tail: Vec<u8>,
}

impl<W: Write> MacSplitWriter<W> {
    pub fn new(inner: W, mac_key: &[u8; MAC_LENGTH]) -> Self {
        Self {
            inner,
            hmac: new_hmac(mac_key),
            tail: Vec::new(),
        }
    }

    pub fn finish(self) -> io::Result<(W, HmacSha256, [u8; MAC_LENGTH])> {
        if self.tail.len() < MAC_LENGTH {
            return Err(Error::TruncatedFrame.into_io());
        }
        let their_mac = self
            .tail
            .as_slice()
            .try_into()
            .map_err(|_| Error::Internal("retained more than one tag").into_io())?;
        Ok((self.inner, self.hmac, their_mac))
    }
}

impl<W: Write> Write for MacSplitWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tail.extend_from_slice(buf);
        if self.tail.len() > MAC_LENGTH {
            let emit = self.tail.len() - MAC_LENGTH;
            self.hmac.update(&self.tail[..emit]);
            self.inner.write_all(&self.tail[..emit])?;
            self.tail.drain(..emit);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// AES-256-CBC encryption, one block at a time. Input accumulates to block
/// boundaries; finish PKCS#7-pads the final partial block, emitting a whole
/// padding block when the input is block-aligned.
pub(crate) struct CbcEncryptWriter<W> {
    inner: W,
    cipher: Aes256CbcEncryptor,
    buf: Vec<u8>,
}

impl<W: Write> CbcEncryptWriter<W> {
    pub fn new(inner: W, aes_key: &[u8; KEY_LENGTH], iv: &AttachmentIv) -> Self {
        Self {
            inner,
            cipher: Aes256CbcEncryptor::new(
                GenericArray::from_slice(aes_key),
                GenericArray::from_slice(iv.as_bytes()),
            ),
            buf: Vec::new(),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        let Self {
            mut inner,
            cipher,
            buf,
        } = self;
        // write() drains every complete block, so at most a partial is left.
        let mut block = [0u8; AES_CBC_BLOCK_SIZE];
        block[..buf.len()].copy_from_slice(&buf);
        let ciphertext = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut block, buf.len())
            .map_err(|_| Error::Internal("PKCS#7 padding failed").into_io())?;
        inner.write_all(ciphertext)?;
        Ok(inner)
    }
}

impl<W: Write> Write for CbcEncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.buf.extend_from_slice(buf);
        let full = self.buf.len() - self.buf.len() % AES_CBC_BLOCK_SIZE;
        if full > 0 {
            for block in self.buf[..full].chunks_exact_mut(AES_CBC_BLOCK_SIZE) {
                self.cipher
                    .encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            self.inner.write_all(&self.buf[..full])?;
            self.buf.drain(..full);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Takes the first 16 bytes of the stream as the IV, then streams the
/// AES-256-CBC decipher of the rest.
///
/// With `strip_pkcs7` the cipher-level padding of the final block is removed
/// (the outer backup layer has no other way to find the inner frame's end).
/// Without it the deciphered bytes are emitted verbatim: the inner pipeline
/// discards everything past the declared plaintext size anyway, and a
/// tampered final block then surfaces as a MAC mismatch instead of a padding
/// error. Malformed padding in strip mode is left for the MAC checks too.
pub(crate) struct CbcDecryptWriter<W> {
    inner: W,
    aes_key: [u8; KEY_LENGTH],
    strip_pkcs7: bool,
    cipher: Option<Aes256CbcDecryptor>,
    iv: Option<AttachmentIv>,
    // Undeciphered input carried between writes.
    buf: Vec<u8>,
    // Last deciphered block, held until we know it is not the final one.
    held_block: Option<[u8; AES_CBC_BLOCK_SIZE]>,
}

impl<W: Write> CbcDecryptWriter<W> {
    pub fn new(inner: W, aes_key: &[u8; KEY_LENGTH], strip_pkcs7: bool) -> Self {
        Self {
            inner,
            aes_key: *aes_key,
            strip_pkcs7,
            cipher: None,
            iv: None,
            buf: Vec::new(),
            held_block: None,
        }
    }

    pub fn finish(self) -> io::Result<(W, AttachmentIv)> {
        let Self {
            mut inner,
            iv,
            strip_pkcs7,
            buf,
            held_block,
            ..
        } = self;
        let (Some(iv), true) = (iv, buf.is_empty()) else {
            // Never saw a full IV, or the ciphertext is not block-aligned.
            return Err(Error::TruncatedFrame.into_io());
        };
        // CBC with PKCS#7 always produces at least one block.
        let block = held_block.ok_or_else(|| Error::TruncatedFrame.into_io())?;
        let emit = if strip_pkcs7 {
            AES_CBC_BLOCK_SIZE - pkcs7_length(&block)
        } else {
            AES_CBC_BLOCK_SIZE
        };
        inner.write_all(&block[..emit])?;
        Ok((inner, iv))
    }
}

impl<W: Write> Write for CbcDecryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.buf.extend_from_slice(buf);
        if self.cipher.is_none() {
            if self.buf.len() < IV_LENGTH {
                return Ok(buf.len());
            }
            let iv = AttachmentIv::from_slice(&self.buf[..IV_LENGTH])
                .map_err(|_| Error::Internal("IV slice length").into_io())?;
            self.cipher = Some(Aes256CbcDecryptor::new(
                GenericArray::from_slice(&self.aes_key),
                GenericArray::from_slice(iv.as_bytes()),
            ));
            self.iv = Some(iv);
            self.buf.drain(..IV_LENGTH);
        }
        let full = self.buf.len() - self.buf.len() % AES_CBC_BLOCK_SIZE;
        if full > 0 {
            let cipher = self
                .cipher
                .as_mut()
                .ok_or_else(|| io::Error::other("decipher not initialized"))?;
            for block in self.buf[..full].chunks_exact_mut(AES_CBC_BLOCK_SIZE) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            if let Some(previous) = self.held_block.take() {
                self.inner.write_all(&previous)?;
            }
            self.inner.write_all(&self.buf[..full - AES_CBC_BLOCK_SIZE])?;
            let mut held = [0u8; AES_CBC_BLOCK_SIZE];
            held.copy_from_slice(&self.buf[full - AES_CBC_BLOCK_SIZE..full]);
            self.held_block = Some(held);
            self.buf.drain(..full);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn pkcs7_length(block: &[u8; AES_CBC_BLOCK_SIZE]) -> usize {
    let pad = block[AES_CBC_BLOCK_SIZE - 1] as usize;
    if (1..=AES_CBC_BLOCK_SIZE).contains(&pad)
        && block[AES_CBC_BLOCK_SIZE - pad..]
            .iter()
            .all(|&byte| byte as usize == pad)
    {
        pad
    } else {
        0
    }
}

/// Forwards exactly the first `declared_size` bytes and silently discards
/// the rest. The declared size is trusted: an undersized value truncates
/// real plaintext, an oversized one keeps padding bytes.
pub(crate) struct TrimWriter<W> {
    inner: W,
    remaining: u64,
}

impl<W: Write> TrimWriter<W> {
    pub fn new(inner: W, declared_size: u64) -> Self {
        Self {
            inner,
            remaining: declared_size,
        }
    }

    pub fn finish(self) -> io::Result<W> {
        Ok(self.inner)
    }
}

impl<W: Write> Write for TrimWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let take = (buf.len() as u64).min(self.remaining) as usize;
        if take > 0 {
            self.inner.write_all(&buf[..take])?;
            self.remaining -= take as u64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
