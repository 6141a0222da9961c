use {
    crate::{IV_LENGTH, KEY_LENGTH, KEY_SET_LENGTH, MAC_LENGTH},
    anyhow::{format_err, Error},
    base64::{display::Base64Display, prelude::BASE64_URL_SAFE_NO_PAD, Engine},
    rand::{rngs::OsRng, CryptoRng, RngCore, TryRngCore},
    serde::{de, Deserialize, Deserializer, Serialize, Serializer},
    std::{
        borrow::Cow,
        fmt::{self, Debug, Display},
        str::FromStr,
    },
};

/// Combined key protecting one attachment: a 32-byte AES-256 key followed by
/// a 32-byte HMAC-SHA-256 key. Only this combined form is ever persisted or
/// put on the wire; the halves exist just for the duration of a call.
#[derive(Clone)]
pub struct AttachmentKeys([u8; KEY_SET_LENGTH]);

impl AttachmentKeys {
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; KEY_SET_LENGTH];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| format_err!("OsRng error: {err:?}"))?;
        Ok(Self(bytes))
    }

    pub fn generate_with_rng<R: CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SET_LENGTH];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let array = <[u8; KEY_SET_LENGTH]>::try_from(bytes).map_err(|_| {
            format_err!(
                "invalid key length; got {}, expected {KEY_SET_LENGTH}",
                bytes.len()
            )
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SET_LENGTH] {
        &self.0
    }

    /// Partitions the combined key into its AES and MAC halves.
    pub fn split(&self) -> (&[u8; KEY_LENGTH], &[u8; MAC_LENGTH]) {
        let (aes, mac) = self.0.split_at(KEY_LENGTH);
        (
            aes.try_into().expect("split point is fixed"),
            mac.try_into().expect("split point is fixed"),
        )
    }

    pub fn aes_key(&self) -> &[u8; KEY_LENGTH] {
        self.split().0
    }

    pub fn mac_key(&self) -> &[u8; MAC_LENGTH] {
        self.split().1
    }

    pub fn display_unmasked(&self) -> impl Display + '_ {
        Base64Display::new(self.0.as_ref(), &BASE64_URL_SAFE_NO_PAD)
    }
}

impl Debug for AttachmentKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentKeys").finish()
    }
}

impl FromStr for AttachmentKeys {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for AttachmentKeys {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BASE64_URL_SAFE_NO_PAD.encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttachmentKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

/// AES-CBC initialization vector of one attachment frame. Not secret; it is
/// the first 16 bytes of the frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AttachmentIv([u8; IV_LENGTH]);

impl AttachmentIv {
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; IV_LENGTH];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| format_err!("OsRng error: {err:?}"))?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let array = <[u8; IV_LENGTH]>::try_from(bytes).map_err(|_| {
            format_err!(
                "invalid IV length; got {}, expected {IV_LENGTH}",
                bytes.len()
            )
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; IV_LENGTH] {
        &self.0
    }
}

impl From<[u8; IV_LENGTH]> for AttachmentIv {
    fn from(bytes: [u8; IV_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Display for AttachmentIv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Base64Display::new(self.0.as_ref(), &BASE64_URL_SAFE_NO_PAD).fmt(f)
    }
}

impl Debug for AttachmentIv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentIv({self})")
    }
}

impl FromStr for AttachmentIv {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for AttachmentIv {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BASE64_URL_SAFE_NO_PAD.encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttachmentIv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}
