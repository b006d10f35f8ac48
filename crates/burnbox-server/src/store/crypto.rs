use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the random PBKDF2 salt at the front of every envelope.
pub const SALT_LEN: usize = 16;
/// AES-GCM nonce length (96 bits).
pub const NONCE_LEN: usize = 12;
/// AES-256 key length.
pub const KEY_LEN: usize = 32;
/// PBKDF2-HMAC-SHA256 rounds.
pub const PBKDF2_ROUNDS: u32 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("envelope is too short")]
    TooShort,
    /// Wrong password, wrong server key and tampered data all land here.
    #[error("decryption failed")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
}

/// Password-based AES-256-GCM envelope.
///
/// Output layout is `salt (16) || nonce (12) || ciphertext+tag`, with no
/// framing. The key is derived from `password || server_key`, so an empty
/// password still yields a server-specific key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Envelope {
    server_key: Vec<u8>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").finish_non_exhaustive()
    }
}

impl Envelope {
    pub fn new(server_key: impl Into<Vec<u8>>) -> Self {
        Self {
            server_key: server_key.into(),
        }
    }

    /// Encrypt `plaintext` under a key derived from `password` and the server key.
    /// Every call draws a fresh salt and nonce.
    pub fn seal(&self, plaintext: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::Encryption)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Reverse of [`Envelope::seal`].
    pub fn open(&self, envelope: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if envelope.len() < SALT_LEN + NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let (salt, rest) = envelope.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self.derive_key(password, salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::Decryption)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decryption)?;
        Ok(Zeroizing::new(plaintext))
    }

    fn derive_key(&self, password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let mut material = Zeroizing::new(Vec::with_capacity(password.len() + self.server_key.len()));
        material.extend_from_slice(password.as_bytes());
        material.extend_from_slice(&self.server_key);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(&material, salt, PBKDF2_ROUNDS, &mut key[..]);
        key
    }
}
