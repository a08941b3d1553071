use super::{Chunker, ChunkerError};
use std::io::Read;

/// Settings for a FastCDC `Chunker`.
///
/// Limited to `usize` rather than `u64` because this implementation makes
/// extensive use of in-memory buffers of size `max_size`.
#[derive(Clone, Copy)]
pub struct FastCDC {
    pub min_size: usize,
    pub max_size: usize,
    pub avg_size: usize,
}

impl Chunker for FastCDC {
    type Chunks = FastCDCChunker;
    fn chunk_boxed(&self, read: Box<dyn Read + 'static>) -> Self::Chunks {
        FastCDCChunker {
            settings: *self,
            buffer: vec![0_u8; self.max_size],
            length: 0,
            read,
            eof: false,
        }
    }
}

impl Default for FastCDC {
    fn default() -> Self {
        FastCDC {
            min_size: 32_768,
            avg_size: 65_536,
            max_size: 131_072,
        }
    }
}

pub struct FastCDCChunker {
    /// The settings used for this `Chunker`.
    settings: FastCDC,
    /// In-memory buffer, always kept at a size of `max_size`.
    buffer: Vec<u8>,
    /// Length of the data currently in the buffer.
    length: usize,
    /// The reader this `Chunker` is slicing.
    read: Box<dyn Read + 'static>,
    /// Has the reader hit EOF?
    eof: bool,
}

impl FastCDCChunker {
    /// Drains a specified number of bytes from the buffer, and refills it
    /// back up to `max_size` with zeros, updating the length accordingly.
    ///
    /// # Errors
    ///
    /// Returns `ChunkerError::InternalError` if `count` exceeds the current
    /// used length of the buffer.
    fn drain_bytes(&mut self, count: usize) -> Result<Vec<u8>, ChunkerError> {
        assert!(self.buffer.len() == self.settings.max_size);
        if count > self.length {
            Err(ChunkerError::InternalError(format!(
                "invalid count given to FastCDCChunker::drain_bytes. count: {}, length: {}",
                count, self.length
            )))
        } else {
            let output = self.buffer.drain(..count).collect::<Vec<_>>();
            self.length -= count;
            self.buffer.resize(self.settings.max_size, 0_u8);
            Ok(output)
        }
    }

    fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Attempts to fill the buffer back up with bytes from the reader.
    ///
    /// Will not attempt to read bytes if EOF has already been encountered.
    fn read_bytes(&mut self) -> Result<usize, ChunkerError> {
        assert!(self.buffer.len() == self.settings.max_size);
        if self.eof {
            Ok(0)
        } else {
            let mut total_bytes = 0;
            while !self.eof && self.length < self.settings.max_size {
                let bytes_read = self.read.read(&mut self.buffer[self.length..])?;
                self.length += bytes_read;
                if bytes_read == 0 {
                    self.eof = true;
                }
                total_bytes += bytes_read;
            }
            Ok(total_bytes)
        }
    }

    /// Uses the FastCDC algorithm to produce the next chunk of data.
    ///
    /// # Errors
    ///
    /// Returns `ChunkerError::Empty` if EOF has been hit and no data remains.
    fn next_chunk(&mut self) -> Result<Vec<u8>, ChunkerError> {
        assert_eq!(self.buffer.len(), self.settings.max_size);
        self.read_bytes()?;
        if self.is_empty() {
            Err(ChunkerError::Empty)
        } else {
            let mut slicer = fastcdc::FastCDC::new(
                &self.buffer[..self.length],
                self.settings.min_size,
                self.settings.avg_size,
                self.settings.max_size,
            );
            if let Some(chunk) = slicer.next() {
                let result = self.drain_bytes(chunk.length)?;
                Ok(result)
            } else {
                Err(ChunkerError::Empty)
            }
        }
    }
}

impl Iterator for FastCDCChunker {
    type Item = Result<Vec<u8>, ChunkerError>;

    fn next(&mut self) -> Option<Result<Vec<u8>, ChunkerError>> {
        let slice = self.next_chunk();
        if let Err(ChunkerError::Empty) = slice {
            None
        } else {
            Some(slice)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::io::Cursor;

    fn get_test_data() -> Vec<u8> {
        let size = 524_288;
        let mut vec = vec![0_u8; size];
        rand::thread_rng().fill_bytes(&mut vec);
        vec
    }

    // Data larger than max_size should be split into more than one chunk.
    #[test]
    fn one_or_more_chunks() {
        let data = get_test_data();
        let cursor = Cursor::new(data);
        let chunker = FastCDC::default();
        let chunks = chunker
            .chunk(cursor)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert!(chunks.len() > 1);
    }

    // Concatenating the chunks must reproduce the original data exactly.
    #[test]
    fn reassemble_data() {
        let data = get_test_data();
        let cursor = Cursor::new(data.clone());
        let chunks = FastCDC::default()
            .chunk(cursor)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let rebuilt: Vec<u8> = chunks.concat();
        assert_eq!(data, rebuilt);
    }

    // Running the chunker twice over the same data must produce identical chunks.
    #[test]
    fn identical_chunks() {
        let data = get_test_data();
        let cursor1 = Cursor::new(data.clone());
        let chunks1 = FastCDC::default()
            .chunk(cursor1)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let cursor2 = Cursor::new(data);
        let chunks2 = FastCDC::default()
            .chunk(cursor2)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(chunks1, chunks2);
    }

    // A localized edit in the middle of the data should leave the chunk
    // boundaries before and after the edit unchanged, since FastCDC's
    // rolling hash depends only on local content.
    #[test]
    fn edit_in_middle_reuses_surrounding_chunks() {
        let mut data = get_test_data();
        let chunks_before = FastCDC::default()
            .chunk_slice(data.clone())
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();

        let midpoint = data.len() / 2;
        data.splice(midpoint..midpoint, vec![0xAB_u8; 37]);
        let chunks_after = FastCDC::default()
            .chunk_slice(data)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();

        assert_eq!(chunks_before.first(), chunks_after.first());
        assert_eq!(chunks_before.last(), chunks_after.last());
    }
}
