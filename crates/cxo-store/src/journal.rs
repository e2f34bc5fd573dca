use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Upper bound on a single record, to stop reading garbage lengths.
const MAX_RECORD_SIZE: u32 = 256 * 1024 * 1024;

struct JournalWriter {
    writer: BufWriter<File>,
    /// Current write offset.
    offset: u64,
}

/// Append-only, crash-recoverable record log.
///
/// On-disk format, repeated:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized record)]
/// ```
///
/// Opening a journal replays it front to back. Records failing the CRC are
/// skipped; a truncated or nonsensical header ends the replay and the file
/// is cut back to the last good record, so later appends are never hidden
/// behind a torn write.
pub struct Journal<T> {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    sync_every_write: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// Open (or create) a journal and return the records it already holds.
    pub fn open(path: &Path) -> StoreResult<(Self, Vec<T>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;

        let (records, valid_len) = replay(path)?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != valid_len {
            warn!(path = %path.display(), valid_len, "truncating torn journal tail");
            file.set_len(valid_len)?;
        }
        let file = OpenOptions::new().append(true).open(path)?;

        debug!(path = %path.display(), records = records.len(), "journal opened");
        Ok((
            Self {
                path: path.to_path_buf(),
                writer: Mutex::new(JournalWriter {
                    writer: BufWriter::new(file),
                    offset: valid_len,
                }),
                sync_every_write: false,
                _record: PhantomData,
            },
            records,
        ))
    }

    /// `fsync` after every append instead of relying on the page cache.
    pub fn with_sync_every_write(mut self, on: bool) -> Self {
        self.sync_every_write = on;
        self
    }

    /// Append one record. Returns the byte offset it was written at.
    pub fn append(&self, record: &T) -> StoreResult<u64> {
        let payload =
            bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut w = self.writer.lock().expect("journal mutex poisoned");
        let at = w.offset;
        write_frame(&mut w.writer, &payload)?;
        w.writer.flush()?;
        if self.sync_every_write {
            w.writer.get_ref().sync_all()?;
        }
        w.offset += (HEADER_SIZE + payload.len()) as u64;
        Ok(at)
    }

    /// Replace the whole journal with `records`.
    ///
    /// The new content is written to a sibling file and renamed over the
    /// old one, so a crash leaves either the old or the new journal intact.
    pub fn rewrite<'a, I>(&self, records: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        let tmp = self.path.with_extension("compact");
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut offset = 0u64;
        let mut count = 0usize;
        for record in records {
            let payload = bincode::serialize(record)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            write_frame(&mut out, &payload)?;
            offset += (HEADER_SIZE + payload.len()) as u64;
            count += 1;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = offset;
        debug!(path = %self.path.display(), records = count, "journal rewritten");
        Ok(())
    }

    /// Current size in bytes.
    pub fn offset(&self) -> u64 {
        self.writer.lock().expect("journal mutex poisoned").offset
    }

    /// Path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point the writer at a read-only handle so that appends fail.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self) -> StoreResult<()> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        w.writer = BufWriter::new(File::open(&self.path)?);
        Ok(())
    }

    /// Flush buffered writes and sync the file.
    pub fn sync(&self) -> StoreResult<()> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        w.writer.flush()?;
        w.writer.get_ref().sync_all()?;
        Ok(())
    }
}

fn write_frame(out: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let length = payload.len() as u32;
    let crc = crc32fast::hash(payload);
    out.write_all(&length.to_le_bytes())?;
    out.write_all(&crc.to_le_bytes())?;
    out.write_all(payload)
}

/// Read every intact record. Returns them with the length of the valid
/// prefix of the file.
fn replay<T: DeserializeOwned>(path: &Path) -> StoreResult<(Vec<T>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut records = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        let mut header = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0
            || length > MAX_RECORD_SIZE
            || offset + HEADER_SIZE as u64 + u64::from(length) > file_len
        {
            warn!(offset, length, file_len, "invalid journal record length; stopping replay");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated journal record; stopping replay");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        offset += HEADER_SIZE as u64 + u64::from(length);

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping journal record"
            );
            continue;
        }
        match bincode::deserialize::<T>(&payload) {
            Ok(record) => records.push(record),
            Err(e) => warn!(offset, error = %e, "undecodable journal record; skipping"),
        }
    }

    Ok((records, offset))
}
