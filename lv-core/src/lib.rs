//! Capability tokens, cryptographic primitives, and the signed metadata
//! format shared by every component of a sync folder.
//!
//! This crate has no notion of storage, indexing, or the filesystem: it is
//! the pure-data/pure-crypto layer that `lv-sync` builds on, mirroring the
//! role `asuran-core` plays for `asuran`.
#![warn(clippy::all)]
#![allow(clippy::must_use_candidate)]

pub mod crypto;
pub mod meta;
pub mod secret;

pub use crypto::CryptoError;
pub use meta::{Attributes, ChunkInfo, CiphertextHash, Meta, MetaError, MetaType, PathId, SignedMeta};
pub use secret::{EncryptedSecret, Secret, SecretError, SecretLevel};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
