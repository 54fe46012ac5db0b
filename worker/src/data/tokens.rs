use std::{fs::File, ops::Range, path::Path};

use memmap2::Mmap;

use crate::error::{Result, TrainErr};

const TOKEN_BYTES: usize = size_of::<u16>();

/// A read-only array of little-endian `u16` tokens.
pub enum TokenArray {
    /// A corpus file mapped into memory, never read in full.
    Mapped(Mmap),
    Owned(Vec<u16>),
}

impl TokenArray {
    /// Maps the token file at `path`.
    ///
    /// # Arguments
    /// * `path` - A file of packed little-endian `u16` token ids.
    ///
    /// # Returns
    /// The mapped array, or an io error if the file can't be mapped or has an odd length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::Owned(Vec::new()));
        }

        // SAFETY: the corpus is never written while training runs.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() % TOKEN_BYTES != 0 {
            let text = format!("{} has an odd amount of bytes", path.display());
            return Err(TrainErr::Io(std::io::Error::other(text)));
        }

        Ok(Self::Mapped(mmap))
    }

    /// Amount of tokens in the array.
    pub fn len(&self) -> usize {
        match self {
            TokenArray::Mapped(mmap) => mmap.len() / TOKEN_BYTES,
            TokenArray::Owned(tokens) => tokens.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the tokens in `range` into `out`, widened to `u32`.
    ///
    /// # Panics
    /// If `range` reaches past the end of the array.
    pub fn extend_window(&self, range: Range<usize>, out: &mut Vec<u32>) {
        match self {
            TokenArray::Mapped(mmap) => {
                let bytes = &mmap[range.start * TOKEN_BYTES..range.end * TOKEN_BYTES];
                out.extend(
                    bytes
                        .chunks_exact(TOKEN_BYTES)
                        .map(|b| u16::from_le_bytes([b[0], b[1]]) as u32),
                );
            }
            TokenArray::Owned(tokens) => out.extend(tokens[range].iter().map(|&t| t as u32)),
        }
    }
}

impl From<Vec<u16>> for TokenArray {
    fn from(value: Vec<u16>) -> Self {
        Self::Owned(value)
    }
}
