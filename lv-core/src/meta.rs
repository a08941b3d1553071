/*!
The canonical replication unit: `Meta` and its signed envelope.

`Meta` mirrors the tagged-variant shape of `asuran-core`'s
`manifest::listing::Node`/`NodeType` (FILE/DIRECTORY/SYMLINK share a common
envelope, switching on a type tag rather than through trait objects or
inheritance), generalized to also carry the encrypted path, platform
attributes, and a revision used for last-writer-wins reconciliation.
*/
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError};
use crate::secret::{Secret, SecretError};

#[derive(Error, Debug)]
pub enum MetaError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("serialization failed")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("deserialization failed")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("signature on this Meta did not verify")]
    BadSignature,
}

type Result<T> = std::result::Result<T, MetaError>;

/// `PathId`, the stable, capability-hiding identifier of a path across revisions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathId(pub [u8; 28]);

impl PathId {
    pub fn compute(secret: &Secret, relative_path: &str) -> Result<PathId> {
        Ok(PathId(secret.path_id(relative_path)?))
    }

    /// A filesystem/log-safe hex rendering.
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Debug for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathId({})", self.to_hex())
    }
}

/// Content address of one chunk, after encryption.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CiphertextHash(pub [u8; 32]);

impl std::fmt::Debug for CiphertextHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CiphertextHash({})", self.to_hex())
    }
}

impl CiphertextHash {
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// One chunk within a `FileMap`.
///
/// `plaintext_hash` is only populated at `ReadWrite`+ (see `DESIGN.md`'s
/// Open Question 4); peers at lower capability never compute or store it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub ciphertext_hash: CiphertextHash,
    pub plaintext_hash: Option<[u8; 32]>,
    pub size: u64,
    pub iv: crypto::Iv,
}

/// The type tag of a `Meta`, and the data specific to that type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MetaType {
    File { chunks: Vec<ChunkInfo> },
    Directory,
    Symlink { enc_target: Vec<u8>, target_iv: crypto::Iv },
    Deleted,
}

/// Platform-specific attributes carried alongside a `Meta`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Attributes {
    pub mode: u32,
    pub windows_attrib: u32,
    pub mtime_ns: i64,
}

/// The canonical, signable description of one path at one revision.
///
/// Field order is fixed by declaration order and must not change: it
/// determines the bytes that get signed (SPEC_FULL §6 forbids reordering or
/// adding unknown fields before signing).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Meta {
    pub path_id: PathId,
    pub enc_path: Vec<u8>,
    pub enc_path_iv: crypto::Iv,
    pub revision: i64,
    pub attributes: Attributes,
    pub meta_type: MetaType,
}

impl Meta {
    /// Builds a new `Meta` for `relative_path`, encrypting the path under
    /// `secret`'s encryption key with a fresh random IV.
    pub fn new(
        secret: &Secret,
        relative_path: &str,
        revision: i64,
        attributes: Attributes,
        meta_type: MetaType,
    ) -> Result<Meta> {
        use rand::rngs::OsRng;
        use rand::RngCore;

        let path_id = PathId::compute(secret, relative_path)?;
        let mut enc_path_iv = [0_u8; 16];
        OsRng.fill_bytes(&mut enc_path_iv);
        let enc_path = crypto::aes_cbc_encrypt(
            secret.encryption_key()?,
            &enc_path_iv,
            relative_path.as_bytes(),
        )?;
        Ok(Meta {
            path_id,
            enc_path,
            enc_path_iv,
            revision,
            attributes,
            meta_type,
        })
    }

    /// Decrypts this Meta's path. Requires `ReadOnly`+ (the secret's
    /// encryption key).
    pub fn decrypt_path(&self, secret: &Secret) -> Result<String> {
        let bytes =
            crypto::aes_cbc_decrypt(secret.encryption_key()?, &self.enc_path_iv, &self.enc_path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Deterministically serializes this Meta (MessagePack, compact/tuple
    /// representation, fixed field order) for signing or storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Meta> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Signs this Meta, producing the wire-ready `SignedMeta`.
    pub fn sign(self, secret: &Secret) -> Result<SignedMeta> {
        let signing_key = secret.signing_key()?;
        let bytes = self.to_bytes()?;
        let signature = crypto::sign(&signing_key, &bytes);
        Ok(SignedMeta {
            meta: self,
            signature,
        })
    }
}

/// A `Meta` paired with a signature over its canonical byte encoding.
///
/// Consumers must call [`SignedMeta::verify`] before acting on the contents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedMeta {
    meta: Meta,
    signature: Vec<u8>,
}

impl SignedMeta {
    /// Verifies the signature against `secret`'s verifying key, returning
    /// the inner `Meta` on success.
    pub fn verify(self, secret: &Secret) -> Result<Meta> {
        let verifying_key = secret.verifying_key()?;
        let bytes = self.meta.to_bytes()?;
        crypto::verify(&verifying_key, &bytes, &self.signature)
            .map_err(|_| MetaError::BadSignature)?;
        Ok(self.meta)
    }

    /// The Meta without verifying the signature. Only safe to use on data
    /// this process produced itself (e.g. immediately after `Meta::sign`).
    pub fn meta_unchecked(&self) -> &Meta {
        &self.meta
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SignedMeta> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::Secret;

    #[test]
    fn sign_and_verify_round_trip() {
        let secret = Secret::generate();
        let meta = Meta::new(
            &secret,
            "hello.txt",
            1,
            Attributes::default(),
            MetaType::File { chunks: vec![] },
        )
        .unwrap();
        let path_id = meta.path_id;
        let signed = meta.sign(&secret).unwrap();
        let verified = signed.verify(&secret).unwrap();
        assert_eq!(verified.path_id, path_id);
    }

    #[test]
    fn tampered_meta_fails_verification() {
        let secret = Secret::generate();
        let meta = Meta::new(
            &secret,
            "hello.txt",
            1,
            Attributes::default(),
            MetaType::File { chunks: vec![] },
        )
        .unwrap();
        let mut signed = meta.sign(&secret).unwrap();
        // Corrupt the signature bytes directly; field is private so we
        // round-trip through the wire encoding to simulate tampering.
        let mut bytes = signed.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        signed = SignedMeta::from_bytes(&bytes).unwrap();
        assert!(signed.verify(&secret).is_err());
    }

    #[test]
    fn path_round_trips_through_encryption() {
        let secret = Secret::generate();
        let meta = Meta::new(
            &secret,
            "dir/sub/file.bin",
            1,
            Attributes::default(),
            MetaType::File { chunks: vec![] },
        )
        .unwrap();
        assert_eq!(meta.decrypt_path(&secret).unwrap(), "dir/sub/file.bin");
    }
}
