/*!
Deterministic cryptographic primitives used throughout a sync folder.

A folder fixes exactly one algorithm per purpose: AES-256-CBC for chunk and
path confidentiality, HMAC-SHA3-224 for `PathId` derivation, SHA3-256 (keyed
and unkeyed) for chunk addressing, and ECDSA over the NIST P-256 curve with a
SHA3-256 prehash for Meta signatures. Unlike `asuran-core`'s swappable
`Encryption`/`HMAC` tag enums, nothing here is chosen per-chunk.
*/
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Sha3_224, Sha3_256};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha3_224 = Hmac<Sha3_224>;
type HmacSha3_256 = Hmac<Sha3_256>;

/// An AES-CBC initialization vector. Must never be reused with the same key.
pub type Iv = [u8; 16];
/// The digest produced for `PathId`, a chunk's ciphertext address, and Meta signatures' prehash.
pub type Digest32 = [u8; 32];
/// `PathId`'s digest width (HMAC-SHA3-224).
pub type Digest28 = [u8; 28];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key material was the wrong length")]
    BadKeyLength,
    #[error("ciphertext was not a whole number of blocks, or padding was invalid")]
    BadFormat,
    #[error("signature did not verify against the supplied data")]
    BadSignature,
    #[error("signature bytes were not a valid DER/fixed-width encoding")]
    BadSignatureEncoding,
}

type Result<T> = std::result::Result<T, CryptoError>;

/// Encrypts `data` under AES-256-CBC with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &Iv, data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(CryptoError::BadKeyLength);
    }
    let encryptor =
        Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::BadKeyLength)?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(data))
}

/// Decrypts `data` produced by [`aes_cbc_encrypt`].
pub fn aes_cbc_decrypt(key: &[u8], iv: &Iv, data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(CryptoError::BadKeyLength);
    }
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(CryptoError::BadFormat);
    }
    let decryptor =
        Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::BadKeyLength)?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| CryptoError::BadFormat)
}

/// Derives a `PathId` from a relative path under the folder's path-id key.
///
/// `PathId = HMAC-SHA3-224(path_id_key, utf8_relative_path)`.
pub fn path_id(path_id_key: &[u8], relative_path: &str) -> Result<Digest28> {
    if path_id_key.is_empty() {
        return Err(CryptoError::BadKeyLength);
    }
    let mut mac = HmacSha3_224::new_from_slice(path_id_key).map_err(|_| CryptoError::BadKeyLength)?;
    mac.update(relative_path.as_bytes());
    let code = mac.finalize().into_bytes();
    let mut out = [0_u8; 28];
    out.copy_from_slice(&code);
    Ok(out)
}

/// Unkeyed SHA3-256 of ciphertext, used as the chunk content address.
///
/// Unkeyed so that any peer, including one holding only a Download token,
/// can verify a received chunk against the hash recorded in its `ChunkInfo`.
pub fn ciphertext_hash(ciphertext: &[u8]) -> Digest32 {
    let mut hasher = Sha3_256::new();
    hasher.update(ciphertext);
    hasher.finalize().into()
}

/// Keyed HMAC-SHA3-256 of plaintext, used for the optional `plaintext_hash`.
///
/// Keyed under the encryption key so that it is not computable below
/// ReadOnly, keeping a privacy margin over the unkeyed ciphertext address.
pub fn plaintext_hash(encryption_key: &[u8], plaintext: &[u8]) -> Result<Digest32> {
    let mut mac =
        HmacSha3_256::new_from_slice(encryption_key).map_err(|_| CryptoError::BadKeyLength)?;
    mac.update(plaintext);
    let code = mac.finalize().into_bytes();
    let mut out = [0_u8; 32];
    out.copy_from_slice(&code);
    Ok(out)
}

/// Signs `data` by first hashing it with SHA3-256, then signing the prehash
/// with ECDSA/P-256, matching the original implementation's `ECDSA<ECP,
/// SHA3_256>` scheme.
pub fn sign(signing_key: &SigningKey, data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    let prehash: Digest32 = hasher.finalize().into();
    let signature: Signature = signing_key
        .sign_prehash(&prehash)
        .expect("signing a fixed-length SHA3-256 prehash cannot fail");
    signature.to_der().as_bytes().to_vec()
}

/// Verifies a signature produced by [`sign`].
pub fn verify(verifying_key: &VerifyingKey, data: &[u8], signature: &[u8]) -> Result<()> {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    let prehash: Digest32 = hasher.finalize().into();
    let signature =
        Signature::from_der(signature).map_err(|_| CryptoError::BadSignatureEncoding)?;
    verifying_key
        .verify_prehash(&prehash, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn aes_cbc_round_trip() {
        let key = [7_u8; 32];
        let iv = [9_u8; 16];
        let data = b"hello world, this is a test of cbc mode";
        let ct = aes_cbc_encrypt(&key, &iv, data).unwrap();
        let pt = aes_cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, data);
    }

    #[test]
    fn aes_cbc_rejects_short_key() {
        let key = [7_u8; 16];
        let iv = [9_u8; 16];
        assert!(aes_cbc_encrypt(&key, &iv, b"x").is_err());
    }

    #[test]
    fn path_id_is_deterministic() {
        let key = b"some reasonably long key material";
        let a = path_id(key, "foo/bar.txt").unwrap();
        let b = path_id(key, "foo/bar.txt").unwrap();
        let c = path_id(key, "foo/baz.txt").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ciphertext_hash_is_content_addressed() {
        let a = ciphertext_hash(b"abc");
        let b = ciphertext_hash(b"abc");
        let c = ciphertext_hash(b"abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let data = b"a signed meta body";
        let sig = sign(&signing_key, data);
        verify(&verifying_key, data, &sig).expect("signature should verify");
    }

    #[test]
    fn tampered_data_fails_verification() {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let sig = sign(&signing_key, b"original");
        assert!(verify(&verifying_key, b"tampered", &sig).is_err());
    }
}
