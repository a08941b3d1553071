//! Content-defined chunking: splitting a byte stream into variable-sized
//! slices whose boundaries are a function of local content, not absolute
//! position, so that an edit in the middle of a file only perturbs the
//! chunks adjacent to the edit.
//!
//! This is the same `Chunker` trait shape as `asuran-chunker`, since
//! chunking a file's plaintext is not itself key-dependent: the same trait
//! and `FastCDC` implementation serve a folder sync engine exactly as well
//! as a backup archiver.

pub mod fastcdc;
pub use self::fastcdc::*;

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("provider IO error")]
    IOError(#[from] io::Error),
    #[error("internal chunker error")]
    InternalError(String),
    #[error("slicer incorrectly applied to empty data")]
    Empty,
}

use std::io::{Cursor, Read};

/// Describes something that can slice objects in a defined, repeatable manner.
///
/// Chunkers must meet three properties:
/// 1. Data must be split into one or more chunks.
/// 2. Data must be identical to the original after reconstruction by simple concatenation.
/// 3. The same data and settings must produce the same slices every time.
pub trait Chunker: Clone {
    type Chunks: Iterator<Item = Result<Vec<u8>, ChunkerError>>;
    /// Core function: takes a boxed owned `Read` and produces an iterator of `Vec<u8>` over it.
    fn chunk_boxed(&self, read: Box<dyn Read + 'static>) -> Self::Chunks;
    /// Convenience function that boxes a bare `Read` for you.
    fn chunk<R: Read + 'static>(&self, read: R) -> Self::Chunks {
        let boxed: Box<dyn Read + 'static> = Box::new(read);
        self.chunk_boxed(boxed)
    }
    /// Convenience function that boxes an `AsRef<[u8]>` wrapped in a cursor.
    fn chunk_slice<R: AsRef<[u8]> + 'static>(&self, slice: R) -> Self::Chunks {
        let cursor = Cursor::new(slice);
        let boxed: Box<dyn Read + 'static> = Box::new(cursor);
        self.chunk_boxed(boxed)
    }
}
