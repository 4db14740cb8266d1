use {
    super::{CryptoError, KEY_SIZE},
    imgvault_protocol::Passphrase,
    sha2::{Digest, Sha256},
    std::fmt,
    zeroize::Zeroizing,
};

/// 256-bit key derived from a passphrase. Zeroized on drop.
#[derive(Clone)]
pub struct KeyMaterial(Zeroizing<[u8; KEY_SIZE]>);

impl KeyMaterial {
    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Derives the image key from `passphrase` alone.
///
/// Minimum length is the caller's business; only an empty passphrase is
/// rejected here.
#[inline]
pub fn derive_key(passphrase: &Passphrase) -> Result<KeyMaterial, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::InvalidKeyInput);
    }
    let mut key = Zeroizing::new([0; KEY_SIZE]);
    key.copy_from_slice(&Sha256::digest(passphrase.as_unmasked_str().as_bytes()));
    Ok(KeyMaterial(key))
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let first = derive_key(&"password123".into()).unwrap();
        let second = derive_key(&"password123".into()).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(
            hex::encode(first.as_bytes()),
            "ef92b778bafe771e89245b89ecbc08a44a4e166c06659911881f383d4473e94f"
        );

        let other = derive_key(&"password124".into()).unwrap();
        assert_ne!(first.as_bytes(), other.as_bytes());
    }

    #[test]
    fn empty_passphrase() {
        assert_eq!(
            derive_key(&"".into()).unwrap_err(),
            CryptoError::InvalidKeyInput
        );
    }

    #[test]
    fn debug_is_redacted() {
        let key = derive_key(&"password123".into()).unwrap();
        assert_eq!(format!("{key:?}"), "KeyMaterial { .. }");
    }
}
