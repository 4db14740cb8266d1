use {
    crate::MIN_PASSPHRASE_LENGTH,
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    std::fmt::{self, Debug},
    zeroize::Zeroizing,
};

/// Secret used to derive the key of a single image.
///
/// The server never stores it. The same passphrase must be supplied again to
/// decrypt the image.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

#[derive(Debug, thiserror::Error)]
#[error("Encryption key must be at least {} characters", MIN_PASSPHRASE_LENGTH)]
pub struct PassphraseTooShort;

impl Passphrase {
    #[must_use]
    #[inline]
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    #[must_use]
    #[inline]
    pub fn as_unmasked_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in Unicode scalar values, not bytes or UTF-16 code units.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    #[inline]
    pub fn ensure_min_length(&self) -> Result<(), PassphraseTooShort> {
        if self.len() < MIN_PASSPHRASE_LENGTH {
            return Err(PassphraseTooShort);
        }
        Ok(())
    }
}

impl From<&str> for Passphrase {
    #[inline]
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}

impl<'de> Deserialize<'de> for Passphrase {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl Serialize for Passphrase {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_unmasked_str().serialize(serializer)
    }
}

impl Debug for Passphrase {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passphrase").finish_non_exhaustive()
    }
}
