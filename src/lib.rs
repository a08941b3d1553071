//! `lv-sync` wires together capability tokens, crypto primitives, and
//! content-defined chunking ([`lv_core`], [`lv_chunker`]) into the sync
//! core of a single Librevault-style folder: an embedded relational index,
//! a unified chunk storage address space spanning an explicit blob store
//! and the user's own working tree, an indexer that turns paths into
//! signed metadata, a debounced filesystem watcher that feeds it, and a
//! file assembler that materializes signed metadata back onto disk.
//!
//! Everything outside of one folder's sync core — peer discovery, the
//! wire protocol, the control API, daemon bootstrap — is a collaborator
//! this crate does not implement; see `SPEC_FULL.md` §1.
#![warn(clippy::all)]
#![allow(clippy::must_use_candidate)]

pub mod assembler;
pub mod autoindexer;
pub mod config;
pub mod error;
pub mod folder;
pub mod index;
pub mod indexer;
pub mod lock;
pub mod pipeline;
pub mod storage;

pub use config::FolderConfig;
pub use error::SyncError;
pub use folder::Folder;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
