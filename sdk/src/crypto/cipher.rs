use {
    super::{BLOCK_SIZE, CryptoError, KEY_SIZE, KeyMaterial, TAG_SIZE},
    aes::Aes256,
    cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7},
    hkdf::Hkdf,
    hmac::{Hmac, Mac},
    rand::RngCore,
    serde::{Deserialize, Serialize},
    sha2::Sha256,
    std::fmt,
    zeroize::Zeroizing,
};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const CBC_KEY_INFO: &[u8] = b"imgvault cbc key";
const MAC_KEY_INFO: &[u8] = b"imgvault mac key";

/// Output of a single encryption. The three fields are only meaningful
/// together and are stored as one unit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedImage {
    pub iv: [u8; BLOCK_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for EncryptedImage {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedImage")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

pub struct Cipher {
    cbc_key: Zeroizing<[u8; KEY_SIZE]>,
    mac_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl Cipher {
    #[must_use]
    #[inline]
    pub fn new(key: &KeyMaterial) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());
        let mut cbc_key = Zeroizing::new([0; KEY_SIZE]);
        let mut mac_key = Zeroizing::new([0; KEY_SIZE]);
        hkdf.expand(CBC_KEY_INFO, &mut *cbc_key)
            .expect("HKDF output length is valid");
        hkdf.expand(MAC_KEY_INFO, &mut *mac_key)
            .expect("HKDF output length is valid");
        Self { cbc_key, mac_key }
    }

    /// Encrypts `plaintext` under a freshly generated IV.
    #[must_use]
    #[inline]
    pub fn encrypt(&self, plaintext: &[u8]) -> EncryptedImage {
        let mut iv = [0; BLOCK_SIZE];
        rand::rng().fill_bytes(&mut iv);
        self.encrypt_with_iv(iv, plaintext)
    }

    fn encrypt_with_iv(&self, iv: [u8; BLOCK_SIZE], plaintext: &[u8]) -> EncryptedImage {
        let ciphertext = cbc_encrypt(&self.cbc_key, &iv, plaintext);
        let tag = self.tag(&iv, &ciphertext);
        EncryptedImage {
            iv,
            tag,
            ciphertext,
        }
    }

    #[inline]
    pub fn decrypt(&self, image: &EncryptedImage) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let len = image.ciphertext.len();
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(CryptoError::MalformedCiphertext);
        }
        let mut mac = self.mac();
        mac.update(&image.iv);
        mac.update(&image.ciphertext);
        mac.verify_slice(&image.tag)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        cbc_decrypt(&self.cbc_key, &image.iv, &image.ciphertext)
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&*self.mac_key).expect("HMAC accepts any key length")
    }

    fn tag(&self, iv: &[u8; BLOCK_SIZE], ciphertext: &[u8]) -> [u8; TAG_SIZE] {
        let mut mac = self.mac();
        mac.update(iv);
        mac.update(ciphertext);
        mac.finalize().into_bytes().into()
    }
}

fn cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; BLOCK_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn cbc_decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; BLOCK_SIZE],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {
        super::*,
        crate::crypto::derive_key,
        proptest::prelude::*,
    };

    fn cipher(passphrase: &str) -> Cipher {
        Cipher::new(&derive_key(&passphrase.into()).unwrap())
    }

    #[test]
    fn nist_aes256_cbc_vector() {
        // SP 800-38A F.2.5, first two blocks, followed by a full PKCS#7 padding block.
        let key: [u8; KEY_SIZE] =
            hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
                .unwrap()
                .try_into()
                .unwrap();
        let iv: [u8; BLOCK_SIZE] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let plaintext =
            hex::decode("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51")
                .unwrap();
        let ciphertext = cbc_encrypt(&key, &iv, &plaintext);
        assert_eq!(
            hex::encode(&ciphertext),
            "f58c4c04d6e5f1ba779eabfb5f7bfbd69cfc4e967edb808d679f777bc6702c7d\
             3a3aa5e0213db1a9901f9036cf5102d2"
        );
        assert_eq!(*cbc_decrypt(&key, &iv, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn roundtrip_block_boundaries() {
        let cipher = cipher("password123");
        for size in [0, 1, 15, 16, 17, 4096] {
            let plaintext: Vec<u8> = (0..size).map(|_| rand::random::<u8>()).collect();
            let encrypted = cipher.encrypt(&plaintext);
            assert_eq!(encrypted.ciphertext.len() % BLOCK_SIZE, 0);
            assert!(encrypted.ciphertext.len() > plaintext.len());
            assert_eq!(*cipher.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_key() {
        let encrypted = cipher("password123").encrypt(b"hello.png!");
        for wrong in ["wrongpass", "password124", "Password123"] {
            assert_eq!(
                cipher(wrong).decrypt(&encrypted).unwrap_err(),
                CryptoError::DecryptionFailed
            );
        }
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let cipher = cipher("password123");
        let first = cipher.encrypt(b"same plaintext");
        let second = cipher.encrypt(b"same plaintext");
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(first.tag, second.tag);
    }

    #[test]
    fn tampering_is_indistinguishable_from_wrong_key() {
        let cipher = cipher("password123");
        let encrypted = cipher.encrypt(&[7; 100]);

        let mut flipped_ciphertext = encrypted.clone();
        flipped_ciphertext.ciphertext[3] ^= 1;
        let mut flipped_iv = encrypted.clone();
        flipped_iv.iv[0] ^= 0x80;
        let mut flipped_tag = encrypted.clone();
        flipped_tag.tag[31] ^= 1;
        let mut swapped_iv = encrypted.clone();
        swapped_iv.iv = cipher.encrypt(&[7; 100]).iv;

        for corrupted in [flipped_ciphertext, flipped_iv, flipped_tag, swapped_iv] {
            assert_eq!(
                cipher.decrypt(&corrupted).unwrap_err(),
                CryptoError::DecryptionFailed
            );
        }
    }

    #[test]
    fn malformed_length() {
        let cipher = cipher("password123");
        let mut encrypted = cipher.encrypt(&[1; 40]);
        encrypted.ciphertext.truncate(47);
        assert_eq!(
            cipher.decrypt(&encrypted).unwrap_err(),
            CryptoError::MalformedCiphertext
        );
        encrypted.ciphertext.clear();
        assert_eq!(
            cipher.decrypt(&encrypted).unwrap_err(),
            CryptoError::MalformedCiphertext
        );
    }

    #[test]
    fn debug_hides_content() {
        let encrypted = cipher("password123").encrypt(b"secret");
        assert_eq!(
            format!("{encrypted:?}"),
            "EncryptedImage { ciphertext_len: 16, .. }"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn roundtrip_any_plaintext(
            plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
            passphrase in "\\PC{8,40}",
        ) {
            let cipher = cipher(&passphrase);
            let encrypted = cipher.encrypt(&plaintext);
            prop_assert_eq!(&*cipher.decrypt(&encrypted).unwrap(), &plaintext);
        }

        #[test]
        fn other_passphrase_fails(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            passphrase in "[a-z0-9]{8,20}",
            other in "[A-Z]{8,20}",
        ) {
            let encrypted = cipher(&passphrase).encrypt(&plaintext);
            prop_assert_eq!(
                cipher(&other).decrypt(&encrypted).unwrap_err(),
                CryptoError::DecryptionFailed
            );
        }
    }
}
