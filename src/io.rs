//! Lattice persistence and the cursor protocol the training loop consumes.
//!
//! Lattices are written as consecutive tagged binary records, one per
//! sequence (layout in [`crate::lattice`]); readers pair each record with
//! its in-memory sequence by content hash and treat any mismatch as a fatal
//! desynchronization.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::lattice::Lattice;
use crate::sequence::Sequence;

/// Corpus split a cursor can be pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Devel,
    Test,
}

/// Sequential source of lattices paired 1:1 with sequences, as produced by
/// the (external) corpus layer. The core only ever walks it forward.
pub trait LatticeCursor {
    /// Repositions the cursor at the start of `split`'s partition for the
    /// given cascade level.
    fn switch_to(&mut self, split: Split, partition: usize, level: usize) -> Result<()>;

    fn has_more(&mut self) -> bool;

    fn next_lattice(&mut self) -> Result<Lattice>;
}

/// Writes lattice records sequentially into a stream.
pub struct LatticeWriter<W: Write> {
    out: W,
    written: usize,
}

impl LatticeWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(LatticeWriter::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> LatticeWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn write(&mut self, lattice: &Lattice) -> Result<()> {
        lattice.write(&mut self.out)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads lattice records back in writing order.
pub struct LatticeReader<R: Read> {
    input: R,
}

impl LatticeReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(LatticeReader::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> LatticeReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    pub fn read(&mut self) -> Result<Lattice> {
        Lattice::read(&mut self.input)
    }

    /// Reads the next record and verifies it belongs to `seq`. A hash
    /// mismatch means the stored stream and the corpus have drifted apart;
    /// there is no recovery.
    pub fn read_for(&mut self, seq: &Sequence) -> Result<Lattice> {
        let lattice = self.read()?;
        let expected = seq.content_hash();
        if lattice.seq_hash != expected {
            return Err(Error::SequenceHashMismatch {
                expected,
                found: lattice.seq_hash,
            });
        }
        Ok(lattice)
    }
}

/// Opens a data file, with missing-file handling selected by `strict`: the
/// one condition the caller may treat as non-fatal. Lenient mode returns
/// `Ok(None)` and logs; every other error still propagates.
pub fn open_data_file<P: AsRef<Path>>(path: P, strict: bool) -> Result<Option<File>> {
    match File::open(path.as_ref()) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if strict {
                Err(Error::MissingDataFile(path.as_ref().to_path_buf()))
            } else {
                log::warn!("missing data file (lenient): {}", path.as_ref().display());
                Ok(None)
            }
        }
        Err(e) => Err(e.into()),
    }
}
