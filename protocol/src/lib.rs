pub mod credentials;
pub mod encoding;
pub mod endpoints;

pub use crate::credentials::Passphrase;

use {
    chrono::Utc,
    rand::RngCore,
    serde::{Deserialize, Deserializer, Serialize, Serializer, de},
    std::{borrow::Cow, fmt, str::FromStr},
};

pub type DateTimeUtc = chrono::DateTime<Utc>;

/// Passphrases shorter than this are rejected before any key is derived.
pub const MIN_PASSPHRASE_LENGTH: usize = 8;

const ID_LENGTH: usize = 12;
const ID_SEQUENCE_LENGTH: usize = 8;

/// Identifier of a stored image.
///
/// The first 8 bytes come from a monotonic sequence owned by the store, so two
/// records never share an id, even across restarts. The remaining bytes are
/// random and only make ids harder to guess.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId([u8; ID_LENGTH]);

#[derive(Debug, thiserror::Error)]
#[error("invalid image id: expected {} lowercase hex characters", ID_LENGTH * 2)]
pub struct InvalidImageId;

impl ImageId {
    #[must_use]
    #[inline]
    pub fn from_sequence(sequence: u64) -> Self {
        let mut bytes = [0; ID_LENGTH];
        let (head, tail) = bytes.split_at_mut(ID_SEQUENCE_LENGTH);
        head.copy_from_slice(&sequence.to_be_bytes());
        rand::rng().fill_bytes(tail);
        Self(bytes)
    }

    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidImageId> {
        <[u8; ID_LENGTH]>::try_from(bytes)
            .map(Self)
            .map_err(|_| InvalidImageId)
    }
}

impl FromStr for ImageId {
    type Err = InvalidImageId;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // `hex::decode` also accepts uppercase, which would give one id two spellings.
        if s.len() != ID_LENGTH * 2 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(InvalidImageId);
        }
        let bytes = hex::decode(s).map_err(|_| InvalidImageId)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for ImageId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ImageId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageId({self})")
    }
}

impl Serialize for ImageId {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ImageId {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

/// Public description of a stored image.
///
/// This is everything `list` exposes. The IV, tag and ciphertext are kept in
/// the blob area and never leave the server in this form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    #[serde(rename = "_id")]
    pub id: ImageId,
    pub original_name: String,
    pub mime_type: String,
    /// Length of the original plaintext in bytes.
    pub size: u64,
    pub upload_date: DateTimeUtc,
}
