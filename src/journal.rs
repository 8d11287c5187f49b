//! Append-only journal backing [`WriteAheadCache`](crate::cache::WriteAheadCache).
//!
//! Each frame is `[len: u32 LE][crc32c: u32 LE][payload]` with a `postcard`-encoded put or remove entry as payload.
//! Replay applies frames in order; a torn or corrupted tail is truncated so that appends continue from the last good
//! frame.

use crc32c::crc32c;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::types::Datum;
use crate::types::DatumKey;

const FRAME_HEADER_LEN: u64 = 8;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
enum JournalEntry {
    Put(Datum),
    Remove(DatumKey),
}

// Borrowing twin of JournalEntry. Variant order must match: postcard encodes variants by index.
#[derive(Serialize)]
enum JournalEntryRef<'a> {
    Put(&'a Datum),
    Remove(&'a DatumKey),
}

#[derive(Debug)]
pub struct Journal {
    path:        PathBuf,
    file:        File,
    frames:      u64,
    sync_writes: bool,
}

impl Journal {
    /// Open or create the journal at `path` and replay it. Returns the journal positioned for appending together with
    /// the live entries.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<(Self, HashMap<DatumKey, Datum>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut live = HashMap::new();
        let mut frames = 0u64;
        let mut good_end = 0u64;

        file.seek(SeekFrom::Start(0))?;
        while let Some(payload) = read_next_frame(&mut file)? {
            let entry: JournalEntry = match postcard::from_bytes(&payload) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Undecodable journal frame in {} at offset {good_end}: {err}", path.display());
                    break;
                }
            };
            match entry {
                JournalEntry::Put(datum) => {
                    live.insert(datum.key(), datum);
                }
                JournalEntry::Remove(key) => {
                    live.remove(&key);
                }
            }
            frames += 1;
            good_end += FRAME_HEADER_LEN + payload.len() as u64;
        }

        let end = file.metadata()?.len();
        if end > good_end {
            warn!(
                "Truncating torn journal tail of {}: {} byte(s) after offset {good_end}",
                path.display(),
                end - good_end
            );
            file.set_len(good_end)?;
        }
        file.seek(SeekFrom::End(0))?;

        info!(
            "Replayed journal {}: {frames} frame(s), {} live entrie(s)",
            path.display(),
            live.len()
        );

        Ok((
            Self {
                path,
                file,
                frames,
                sync_writes,
            },
            live,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of frames in the journal file, live or dead.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn append_put(&mut self, datum: &Datum) -> Result<()> {
        self.append(&JournalEntryRef::Put(datum))
    }

    pub fn append_remove(&mut self, key: &DatumKey) -> Result<()> {
        self.append(&JournalEntryRef::Remove(key))
    }

    fn append(&mut self, entry: &JournalEntryRef<'_>) -> Result<()> {
        let frame = encode_frame(entry)?;
        self.file.write_all(&frame)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        self.frames += 1;
        Ok(())
    }

    /// Rewrite the journal so it only holds `live` entries.
    pub fn compact<'a, I>(&mut self, live: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Datum>,
    {
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;

        let mut frames = 0u64;
        for datum in live {
            tmp.write_all(&encode_frame(&JournalEntryRef::Put(datum))?)?;
            frames += 1;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        let mut file = fs::OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;

        debug!(
            "Compacted journal {}: {} -> {frames} frame(s)",
            self.path.display(),
            self.frames
        );

        self.file = file;
        self.frames = frames;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}

fn encode_frame(entry: &JournalEntryRef<'_>) -> Result<Vec<u8>> {
    let payload = postcard::to_stdvec(entry)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

// Ok(None) means either a clean end of file or a torn/corrupted frame; the caller truncates everything past the last
// good frame in both cases.
fn read_next_frame(file: &mut File) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len == 0 || len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    match file.read_exact(&mut payload) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    if crc32c(&payload) != crc {
        return Ok(None);
    }

    Ok(Some(payload))
}
