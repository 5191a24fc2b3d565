use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use ledger_db::SourceCheckpoint;
use sha2::{Digest, Sha256};

/// Prefix length hashed to recognize a file across restarts. Large enough
/// to cover a full first record in practice, small enough to re-read on
/// every scan.
pub const HEAD_HASH_LEN: u64 = 4096;

/// One newline-terminated line together with the byte range it occupies.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub line: String,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Where to resume reading a source, derived from its stored checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Resume {
    pub byte_offset: u64,
    pub epoch: i64,
    pub head_len: u64,
    pub head_hash: Option<String>,
}

impl Resume {
    pub fn from_checkpoint(cp: Option<&SourceCheckpoint>) -> Self {
        match cp {
            Some(cp) => Self {
                byte_offset: cp.byte_offset,
                epoch: cp.epoch,
                head_len: cp.head_len,
                head_hash: cp.head_hash.clone(),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    Batch(ReadBatch),
    /// The file shrank below the resume offset or its head bytes changed:
    /// this is a different file wearing the same name. The caller resets
    /// to offset zero under a new epoch.
    Rotated,
}

#[derive(Debug)]
pub struct ReadBatch {
    pub records: Vec<RawRecord>,
    pub start_offset: u64,
    /// Offset just past the last complete line consumed. A trailing line
    /// with no terminator is left for a later scan.
    pub end_offset: u64,
    pub has_more: bool,
    pub head_len: u64,
    pub head_hash: Option<String>,
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn hash_head(file: &mut File, len: u64) -> io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    let mut hasher = Sha256::new();
    hasher.update(&buf);
    Ok(hex_digest(&hasher.finalize()))
}

/// Read up to `max_records` complete lines starting at the resume offset.
/// Detects rotation before reading anything so a replaced file is never
/// parsed against a stale offset.
pub fn read_batch(path: &Path, resume: &Resume, max_records: usize) -> io::Result<ReadOutcome> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    if file_len < resume.byte_offset {
        return Ok(ReadOutcome::Rotated);
    }
    if let Some(stored) = &resume.head_hash {
        if resume.head_len > 0 {
            // The hashed prefix covered the file up to head_len at
            // checkpoint time; a file now shorter than that has been
            // rewritten even if it still covers the resume offset.
            if file_len < resume.head_len {
                return Ok(ReadOutcome::Rotated);
            }
            let current = hash_head(&mut file, resume.head_len)?;
            if &current != stored {
                return Ok(ReadOutcome::Rotated);
            }
        }
    }

    let head_len = file_len.min(HEAD_HASH_LEN);
    let head_hash = if head_len > 0 {
        Some(hash_head(&mut file, head_len)?)
    } else {
        None
    };

    file.seek(SeekFrom::Start(resume.byte_offset))?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut offset = resume.byte_offset;
    let mut buf = Vec::new();

    while records.len() < max_records {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        if !buf.ends_with(b"\n") {
            // Partial write in progress; pick it up once terminated.
            break;
        }
        let start_offset = offset;
        offset += read as u64;
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if line.is_empty() {
            continue;
        }
        records.push(RawRecord {
            line,
            start_offset,
            end_offset: offset,
        });
    }

    Ok(ReadOutcome::Batch(ReadBatch {
        records,
        start_offset: resume.byte_offset,
        end_offset: offset,
        has_more: offset < file_len,
        head_len,
        head_hash,
    }))
}
