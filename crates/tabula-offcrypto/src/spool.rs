//! Scratch storage for the encrypted package body.
//!
//! The Agile body is written segment by segment and then re-read
//! sequentially for the HMAC pass, so the sink must be appendable and
//! rewindable without assuming the whole package fits in memory. Small
//! bodies stay in a memory buffer; once the spill threshold is crossed the
//! buffer moves to an unnamed temp file, which the OS removes when the
//! handle is dropped (on every exit path).

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

const SPILL_THRESHOLD: u64 = 4 * 1024 * 1024;

enum SpoolInner {
    Memory(Cursor<Vec<u8>>),
    Disk(File),
}

pub(crate) struct PackageSpool {
    inner: SpoolInner,
    threshold: u64,
    len: u64,
}

impl PackageSpool {
    pub(crate) fn new() -> Self {
        Self::with_threshold(SPILL_THRESHOLD)
    }

    pub(crate) fn with_threshold(threshold: u64) -> Self {
        Self {
            inner: SpoolInner::Memory(Cursor::new(Vec::new())),
            threshold,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn rewind(&mut self) -> io::Result<()> {
        match &mut self.inner {
            SpoolInner::Memory(cursor) => cursor.set_position(0),
            SpoolInner::Disk(file) => {
                file.seek(SeekFrom::Start(0))?;
            }
        }
        Ok(())
    }

    pub(crate) fn is_spilled(&self) -> bool {
        matches!(self.inner, SpoolInner::Disk(_))
    }

    fn spill(&mut self) -> io::Result<()> {
        let SpoolInner::Memory(cursor) = &mut self.inner else {
            return Ok(());
        };
        let mut file = tempfile::tempfile()?;
        file.write_all(cursor.get_ref())?;
        self.inner = SpoolInner::Disk(file);
        Ok(())
    }
}

impl Write for PackageSpool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if matches!(self.inner, SpoolInner::Memory(_))
            && self.len.saturating_add(buf.len() as u64) > self.threshold
        {
            self.spill()?;
        }
        let n = match &mut self.inner {
            SpoolInner::Memory(cursor) => cursor.write(buf)?,
            SpoolInner::Disk(file) => file.write(buf)?,
        };
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            SpoolInner::Memory(_) => Ok(()),
            SpoolInner::Disk(file) => file.flush(),
        }
    }
}

impl Read for PackageSpool {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            SpoolInner::Memory(cursor) => cursor.read(buf),
            SpoolInner::Disk(file) => file.read(buf),
        }
    }
}
