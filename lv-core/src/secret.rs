/*!
The `Secret`: a capability token for a sync folder.

A folder has a single root secret, generated once at `Owner` level. Lower
capability levels are strict subsets of the material above them, forming the
lattice `Owner > ReadWrite > ReadOnly > Download`: a peer holding a `Secret`
at one level can derive any lower level, but can never forge material it
was not given.
*/
use argon2::Argon2;
use p256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::{self, CryptoError};

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("this secret's capability level does not include that material")]
    CapabilityMissing,
    #[error("cannot derive a higher capability level from a lower one")]
    CannotElevate,
    #[error("malformed secret token")]
    BadFormat,
    #[error("secret token checksum did not match")]
    ChecksumMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("argon2 key derivation failed")]
    Argon2(String),
    #[error("serialization failed")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("deserialization failed")]
    Decode(#[from] rmp_serde::decode::Error),
}

type Result<T> = std::result::Result<T, SecretError>;

/// The capability level of a [`Secret`].
///
/// Declaration order is significant: variants compare in descending order
/// of capability (`Owner` is the smallest/highest-privilege value), so
/// `self_level <= required_level` reads naturally as "at least as capable
/// as required".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecretLevel {
    Owner,
    ReadWrite,
    ReadOnly,
    Download,
}

/// A capability token derived from a folder's root key material.
///
/// See the module docs and `DESIGN.md`'s Open Question 1-2 entries for why
/// `encryption_key` (doubling as the path-id key) is available at
/// `ReadOnly` and above, not only at `ReadWrite` and above.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct Secret {
    #[zeroize(skip)]
    level: SecretLevel,
    signing_key: Option<SigningKeyBytes>,
    #[zeroize(skip)]
    verifying_key: VerifyingKeyBytes,
    encryption_key: Option<[u8; 32]>,
    download_token: [u8; 32],
}

/// Stores the raw scalar so the struct can derive `Zeroize`; reconstructed
/// into a `p256::ecdsa::SigningKey` on access.
#[derive(Clone)]
struct SigningKeyBytes([u8; 32]);

impl Zeroize for SigningKeyBytes {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Clone)]
struct VerifyingKeyBytes(Vec<u8>);

impl Secret {
    /// Generates a fresh `Owner` secret with securely random key material.
    pub fn generate() -> Secret {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let mut encryption_key = [0_u8; 32];
        OsRng.fill_bytes(&mut encryption_key);
        let mut download_token = [0_u8; 32];
        OsRng.fill_bytes(&mut download_token);
        Secret {
            level: SecretLevel::Owner,
            signing_key: Some(SigningKeyBytes(signing_key.to_bytes().into())),
            verifying_key: VerifyingKeyBytes(verifying_key.to_sec1_bytes().to_vec()),
            encryption_key: Some(encryption_key),
            download_token,
        }
    }

    /// The capability level this secret was derived at.
    pub fn level(&self) -> SecretLevel {
        self.level
    }

    /// Derives a `Secret` at a lower (or equal) capability level.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::CannotElevate`] if `level` is a higher
    /// capability than `self` holds.
    pub fn derive(&self, level: SecretLevel) -> Result<Secret> {
        if level < self.level {
            return Err(SecretError::CannotElevate);
        }
        Ok(Secret {
            level,
            signing_key: if level == SecretLevel::Owner {
                self.signing_key.clone()
            } else {
                None
            },
            verifying_key: self.verifying_key.clone(),
            encryption_key: if level <= SecretLevel::ReadOnly {
                self.encryption_key
            } else {
                None
            },
            download_token: self.download_token,
        })
    }

    /// The signing key, available only at `Owner`.
    pub fn signing_key(&self) -> Result<SigningKey> {
        let bytes = self
            .signing_key
            .as_ref()
            .ok_or(SecretError::CapabilityMissing)?;
        SigningKey::from_bytes(bytes.0.as_slice().into()).map_err(|_| SecretError::BadFormat)
    }

    /// The verifying key, available at every capability level.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.verifying_key.0).map_err(|_| SecretError::BadFormat)
    }

    /// The symmetric encryption key, available at `ReadOnly` and above.
    pub fn encryption_key(&self) -> Result<&[u8; 32]> {
        self.encryption_key
            .as_ref()
            .ok_or(SecretError::CapabilityMissing)
    }

    /// The path-id key. Identical material to [`Secret::encryption_key`];
    /// see `DESIGN.md`'s Open Question 2.
    pub fn path_id_key(&self) -> Result<&[u8; 32]> {
        self.encryption_key()
    }

    /// The download token, available at every capability level.
    pub fn download_token(&self) -> &[u8; 32] {
        &self.download_token
    }

    /// Computes the `PathId` for a relative path under this secret.
    pub fn path_id(&self, relative_path: &str) -> Result<crypto::Digest28> {
        Ok(crypto::path_id(self.path_id_key()?, relative_path)?)
    }

    /// Exports this secret, encrypted at rest under a user-supplied
    /// passphrase, for storage outside the running process (e.g. so an
    /// operator can write an `Owner` token to a password manager).
    ///
    /// Uses Argon2id to derive a key-encryption key, matching the approach
    /// `asuran-core::repository::key::EncryptedKey` takes for its own
    /// at-rest key wrapping, narrowed here to wrap just this secret's
    /// serialized material rather than a whole repository key bundle.
    pub fn export(&self, passphrase: &[u8]) -> Result<EncryptedSecret> {
        let payload = SecretPayload {
            level: self.level,
            signing_key: self.signing_key.as_ref().map(|k| k.0.to_vec()),
            verifying_key: self.verifying_key.0.clone(),
            encryption_key: self.encryption_key,
            download_token: self.download_token,
        };
        let plaintext = rmp_serde::to_vec(&payload)?;
        let mut salt = [0_u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut kek = [0_u8; 32];
        Argon2::default()
            .hash_password_into(passphrase, &salt, &mut kek)
            .map_err(|e| SecretError::Argon2(e.to_string()))?;
        let mut iv = [0_u8; 16];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = crypto::aes_cbc_encrypt(&kek, &iv, &plaintext)?;
        kek.zeroize();
        Ok(EncryptedSecret {
            salt,
            iv,
            ciphertext,
        })
    }
}

/// Version byte for [`Secret::to_token`]'s wire payload. Bump this if
/// `SecretPayload`'s shape ever changes incompatibly.
const TOKEN_VERSION: u8 = 1;

/// Number of checksum bytes appended to a token's payload, truncated from
/// a [`crypto::ciphertext_hash`] digest. Deliberately short: it only has to
/// catch fat-fingered transcription, not serve as a security boundary.
const TOKEN_CHECKSUM_LEN: usize = 4;

impl Secret {
    /// The single ASCII character a [`Secret::to_token`] string leads
    /// with, so a user (or a pasted-in control API call) can tell a
    /// token's capability level without decoding it.
    fn level_prefix(level: SecretLevel) -> char {
        match level {
            SecretLevel::Owner => 'O',
            SecretLevel::ReadWrite => 'W',
            SecretLevel::ReadOnly => 'R',
            SecretLevel::Download => 'D',
        }
    }

    fn prefix_level(prefix: char) -> Result<SecretLevel> {
        match prefix {
            'O' => Ok(SecretLevel::Owner),
            'W' => Ok(SecretLevel::ReadWrite),
            'R' => Ok(SecretLevel::ReadOnly),
            'D' => Ok(SecretLevel::Download),
            _ => Err(SecretError::BadFormat),
        }
    }

    /// Encodes this secret as the human-readable token SPEC_FULL §4.1
    /// describes: a capability-level prefix character, followed by
    /// Crockford base32 of `[version byte][msgpack payload][checksum]`.
    /// Round-trips through [`Secret::from_token`].
    pub fn to_token(&self) -> Result<String> {
        let payload = SecretPayload {
            level: self.level,
            signing_key: self.signing_key.as_ref().map(|k| k.0.to_vec()),
            verifying_key: self.verifying_key.0.clone(),
            encryption_key: self.encryption_key,
            download_token: self.download_token,
        };
        let mut body = vec![TOKEN_VERSION];
        body.extend(rmp_serde::to_vec(&payload)?);
        let checksum = crypto::ciphertext_hash(&body);
        body.extend_from_slice(&checksum[..TOKEN_CHECKSUM_LEN]);
        let mut token = String::new();
        token.push(Self::level_prefix(self.level));
        token.push_str(&base32::encode(base32::Alphabet::Crockford, &body));
        Ok(token)
    }

    /// Parses a token produced by [`Secret::to_token`], verifying its
    /// checksum and that the prefix character matches the level encoded
    /// in the payload before trusting either.
    pub fn from_token(token: &str) -> Result<Secret> {
        let mut chars = token.chars();
        let prefix = chars.next().ok_or(SecretError::BadFormat)?;
        let expected_level = Self::prefix_level(prefix)?;
        let body = base32::decode(base32::Alphabet::Crockford, chars.as_str())
            .ok_or(SecretError::BadFormat)?;
        if body.len() <= 1 + TOKEN_CHECKSUM_LEN {
            return Err(SecretError::BadFormat);
        }
        let split = body.len() - TOKEN_CHECKSUM_LEN;
        let (signed, checksum) = body.split_at(split);
        let expected = crypto::ciphertext_hash(signed);
        if &expected[..TOKEN_CHECKSUM_LEN] != checksum {
            return Err(SecretError::ChecksumMismatch);
        }
        let (version, payload) = signed.split_at(1);
        if version[0] != TOKEN_VERSION {
            return Err(SecretError::BadFormat);
        }
        let payload: SecretPayload = rmp_serde::from_slice(payload)?;
        if payload.level != expected_level {
            return Err(SecretError::BadFormat);
        }
        Ok(Secret {
            level: payload.level,
            signing_key: payload.signing_key.map(|bytes| {
                let mut arr = [0_u8; 32];
                arr.copy_from_slice(&bytes);
                SigningKeyBytes(arr)
            }),
            verifying_key: VerifyingKeyBytes(payload.verifying_key),
            encryption_key: payload.encryption_key,
            download_token: payload.download_token,
        })
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret").field("level", &self.level).finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct SecretPayload {
    level: SecretLevel,
    signing_key: Option<Vec<u8>>,
    verifying_key: Vec<u8>,
    encryption_key: Option<[u8; 32]>,
    download_token: [u8; 32],
}

/// A [`Secret`] encrypted at rest under a user passphrase.
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    salt: [u8; 16],
    iv: [u8; 16],
    ciphertext: Vec<u8>,
}

impl EncryptedSecret {
    /// Decrypts and reconstructs the original [`Secret`].
    pub fn decrypt(&self, passphrase: &[u8]) -> Result<Secret> {
        let mut kek = [0_u8; 32];
        Argon2::default()
            .hash_password_into(passphrase, &self.salt, &mut kek)
            .map_err(|e| SecretError::Argon2(e.to_string()))?;
        let plaintext = crypto::aes_cbc_decrypt(&kek, &self.iv, &self.ciphertext)?;
        kek.zeroize();
        let payload: SecretPayload = rmp_serde::from_slice(&plaintext)?;
        Ok(Secret {
            level: payload.level,
            signing_key: payload.signing_key.map(|bytes| {
                let mut arr = [0_u8; 32];
                arr.copy_from_slice(&bytes);
                SigningKeyBytes(arr)
            }),
            verifying_key: VerifyingKeyBytes(payload.verifying_key),
            encryption_key: payload.encryption_key,
            download_token: payload.download_token,
        })
    }
}
