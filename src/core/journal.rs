//! Per-queue journal.
//!
//! One append-only file per queue, named after the queue, holding the full
//! operation history since the last rewrite:
//! - Fast sequential appends with per-record CRC
//! - Replay on open rebuilds the in-memory deque and open reservations
//! - Rewrite (compaction) into a `name~` temp file, renamed into place
//! - A torn or corrupt tail is truncated at the last good record
//!
//! Record framing: `[op u8][len u32 LE][crc32 u32 LE][body]`.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crc32fast::Hasher as Crc32Hasher;
use tracing::warn;

use crate::core::item::QueueItem;

const HEADER_MAGIC: &[u8; 8] = b"DRIFTJN\0";
const HEADER_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const RECORD_HEADER_LEN: usize = 1 + 4 + 4;

const OP_ADD: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_REMOVE_TENTATIVE: u8 = 3;
const OP_CONFIRM_REMOVE: u8 = 4;
const OP_UNREMOVE: u8 = 5;
const OP_FLUSH: u8 = 6;

/// A single journaled operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    Add {
        add_time: u64,
        expiry: Option<u64>,
        data: Bytes,
    },
    Remove,
    RemoveTentative(u64),
    ConfirmRemove(u64),
    Unremove(u64),
    Flush,
}

/// Queue state recovered by replaying a journal.
#[derive(Debug, Default)]
pub struct Replay {
    pub items: VecDeque<QueueItem>,
    /// Outstanding tentative removes, keyed by xid. BTreeMap so recovery
    /// can un-remove them in reservation order.
    pub open_reads: BTreeMap<u64, QueueItem>,
    /// Highest xid ever handed out.
    pub max_xid: u64,
}

/// Append side of a queue journal. All methods are synchronous; the queue
/// engine serializes access behind its own mutex.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl Journal {
    /// Opens (creating if missing) the journal at `path` and replays it.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<(Self, Replay)> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (replay, good_len) = if len == 0 {
            write_header(&mut file)?;
            file.sync_data()?;
            (Replay::default(), HEADER_LEN)
        } else {
            validate_header(&mut file)?;
            replay_records(&mut file, &path)?
        };

        if good_len < len {
            // Torn tail: drop everything past the last good record.
            warn!(
                "journal {:?}: truncating {} corrupt trailing bytes",
                path,
                len - good_len
            );
            file.set_len(good_len)?;
            file.sync_data()?;
        }

        file.seek(SeekFrom::End(0))?;
        let journal = Self {
            path,
            writer: BufWriter::new(file),
            size: good_len,
        };
        Ok((journal, replay))
    }

    /// Appends one record. Durability requires a subsequent [`sync`].
    ///
    /// [`sync`]: Journal::sync
    pub fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        self.size += write_record(&mut self.writer, record)?;
        Ok(())
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    /// Current on-disk size in bytes (including buffered appends).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the journal so it contains exactly the live state: an ADD
    /// plus REMOVE_TENTATIVE pair per open reservation (in xid order),
    /// then an ADD per queued item. Written to a `name~` temp file and
    /// renamed over the original.
    pub fn rewrite(
        &mut self,
        open_reads: &BTreeMap<u64, QueueItem>,
        items: &VecDeque<QueueItem>,
    ) -> io::Result<()> {
        let temp_path = temp_rewrite_path(&self.path);
        {
            let mut temp = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&temp_path)?;
            write_header(&mut temp)?;

            let mut writer = BufWriter::new(temp);
            let mut size = HEADER_LEN;

            for (xid, item) in open_reads {
                size += write_record(&mut writer, &add_record(item))?;
                size += write_record(&mut writer, &JournalRecord::RemoveTentative(*xid))?;
            }
            for item in items {
                size += write_record(&mut writer, &add_record(item))?;
            }

            writer.flush()?;
            writer.get_ref().sync_data()?;
            self.size = size;
        }

        fs::rename(&temp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Syncs and removes the on-disk file. The journal is unusable after.
    pub fn erase(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let _ = fs::remove_file(temp_rewrite_path(&self.path));
        fs::remove_file(&self.path)
    }
}

fn temp_rewrite_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push("~");
    PathBuf::from(os)
}

fn add_record(item: &QueueItem) -> JournalRecord {
    JournalRecord::Add {
        add_time: item.add_time,
        expiry: item.expiry,
        data: item.data.clone(),
    }
}

/// Writes one framed record, returning the number of bytes written.
fn write_record<W: Write>(writer: &mut W, record: &JournalRecord) -> io::Result<u64> {
    let body = encode_body(record);
    let mut hasher = Crc32Hasher::new();
    hasher.update(&body);

    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0] = opcode(record);
    header[1..5].copy_from_slice(&(body.len() as u32).to_le_bytes());
    header[5..9].copy_from_slice(&hasher.finalize().to_le_bytes());

    writer.write_all(&header)?;
    writer.write_all(&body)?;
    Ok((RECORD_HEADER_LEN + body.len()) as u64)
}

fn opcode(record: &JournalRecord) -> u8 {
    match record {
        JournalRecord::Add { .. } => OP_ADD,
        JournalRecord::Remove => OP_REMOVE,
        JournalRecord::RemoveTentative(_) => OP_REMOVE_TENTATIVE,
        JournalRecord::ConfirmRemove(_) => OP_CONFIRM_REMOVE,
        JournalRecord::Unremove(_) => OP_UNREMOVE,
        JournalRecord::Flush => OP_FLUSH,
    }
}

fn encode_body(record: &JournalRecord) -> Vec<u8> {
    match record {
        JournalRecord::Add {
            add_time,
            expiry,
            data,
        } => {
            let mut body = Vec::with_capacity(16 + data.len());
            body.extend_from_slice(&add_time.to_le_bytes());
            body.extend_from_slice(&expiry.unwrap_or(0).to_le_bytes());
            body.extend_from_slice(data);
            body
        }
        JournalRecord::Remove | JournalRecord::Flush => Vec::new(),
        JournalRecord::RemoveTentative(xid)
        | JournalRecord::ConfirmRemove(xid)
        | JournalRecord::Unremove(xid) => xid.to_le_bytes().to_vec(),
    }
}

fn write_header(file: &mut File) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; HEADER_LEN as usize];
    header[..8].copy_from_slice(HEADER_MAGIC);
    header[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    file.write_all(&header)
}

fn validate_header(file: &mut File) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)
        .map_err(|_| corruption("file too small to contain header"))?;
    if &header[..8] != HEADER_MAGIC {
        return Err(corruption("bad magic"));
    }
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if version != HEADER_VERSION {
        return Err(corruption("unsupported journal version"));
    }
    Ok(())
}

fn corruption(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("journal corruption: {msg}"))
}

/// Replays every record after the header, stopping at EOF or the first
/// corrupt record. Returns the rebuilt state and the offset of the last
/// good record (so the caller can truncate a torn tail).
fn replay_records(file: &mut File, path: &Path) -> io::Result<(Replay, u64)> {
    file.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut reader = BufReader::new(file);
    let mut replay = Replay::default();
    let mut offset = HEADER_LEN;

    loop {
        let mut header = [0u8; RECORD_HEADER_LEN];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let op = header[0];
        let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
        let expected_crc = u32::from_le_bytes(header[5..9].try_into().unwrap());

        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).is_err() {
            break; // torn write mid-body
        }
        let mut hasher = Crc32Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != expected_crc {
            warn!("journal {:?}: CRC mismatch at offset {}", path, offset);
            break;
        }

        if !apply_record(op, &body, &mut replay) {
            warn!("journal {:?}: unknown opcode {} at offset {}", path, op, offset);
            break;
        }
        offset += (RECORD_HEADER_LEN + len) as u64;
    }

    Ok((replay, offset))
}

fn apply_record(op: u8, body: &[u8], replay: &mut Replay) -> bool {
    let read_xid = |body: &[u8]| -> Option<u64> {
        body.get(..8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    };

    match op {
        OP_ADD => {
            if body.len() < 16 {
                return false;
            }
            let add_time = u64::from_le_bytes(body[..8].try_into().unwrap());
            let expiry = u64::from_le_bytes(body[8..16].try_into().unwrap());
            let expiry = (expiry != 0).then_some(expiry);
            replay.items.push_back(QueueItem::new(
                Bytes::copy_from_slice(&body[16..]),
                expiry,
                add_time,
            ));
        }
        OP_REMOVE => {
            replay.items.pop_front();
        }
        OP_REMOVE_TENTATIVE => {
            let Some(xid) = read_xid(body) else { return false };
            if let Some(mut item) = replay.items.pop_front() {
                item.xid = xid;
                replay.open_reads.insert(xid, item);
            }
            replay.max_xid = replay.max_xid.max(xid);
        }
        OP_CONFIRM_REMOVE => {
            let Some(xid) = read_xid(body) else { return false };
            replay.open_reads.remove(&xid);
        }
        OP_UNREMOVE => {
            let Some(xid) = read_xid(body) else { return false };
            if let Some(mut item) = replay.open_reads.remove(&xid) {
                item.xid = 0;
                replay.items.push_front(item);
            }
        }
        OP_FLUSH => {
            replay.items.clear();
        }
        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("driftmq_journal_test_{}_{name}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn add(data: &'static [u8]) -> JournalRecord {
        JournalRecord::Add {
            add_time: 1,
            expiry: None,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn append_and_replay_roundtrip() {
        let path = journal_path("roundtrip");
        {
            let (mut journal, replay) = Journal::open(&path).unwrap();
            assert!(replay.items.is_empty());
            journal.append(&add(b"first")).unwrap();
            journal.append(&add(b"second")).unwrap();
            journal.append(&JournalRecord::Remove).unwrap();
            journal.sync().unwrap();
        }

        let (_, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.items.len(), 1);
        assert_eq!(replay.items[0].data, Bytes::from_static(b"second"));
    }

    #[test]
    fn tentative_remove_survives_replay() {
        let path = journal_path("tentative");
        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal.append(&add(b"held")).unwrap();
            journal.append(&add(b"queued")).unwrap();
            journal.append(&JournalRecord::RemoveTentative(7)).unwrap();
            journal.sync().unwrap();
        }

        let (_, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.max_xid, 7);
        assert_eq!(replay.open_reads.len(), 1);
        assert_eq!(replay.open_reads[&7].data, Bytes::from_static(b"held"));
        assert_eq!(replay.items.len(), 1);
        assert_eq!(replay.items[0].data, Bytes::from_static(b"queued"));
    }

    #[test]
    fn corrupt_tail_is_truncated() {
        let path = journal_path("corrupt_tail");
        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal.append(&add(b"good")).unwrap();
            journal.append(&add(b"doomed")).unwrap();
            journal.sync().unwrap();
        }

        // Flip a byte in the last record's payload.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::End(-1)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            byte[0] ^= 0xFF;
            file.seek(SeekFrom::End(-1)).unwrap();
            file.write_all(&byte).unwrap();
        }

        let (journal, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.items.len(), 1);
        assert_eq!(replay.items[0].data, Bytes::from_static(b"good"));

        // The torn record is gone from disk as well.
        let expected = journal.size();
        drop(journal);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn rewrite_compacts_to_live_state() {
        let path = journal_path("rewrite");
        let (mut journal, _) = Journal::open(&path).unwrap();
        for _ in 0..100 {
            journal.append(&add(b"churn")).unwrap();
            journal.append(&JournalRecord::Remove).unwrap();
        }
        journal.append(&add(b"keep")).unwrap();
        journal.sync().unwrap();
        let bloated = journal.size();

        let mut items = VecDeque::new();
        items.push_back(QueueItem::new(Bytes::from_static(b"keep"), None, 1));
        let mut open = BTreeMap::new();
        let mut held = QueueItem::new(Bytes::from_static(b"held"), None, 1);
        held.xid = 3;
        open.insert(3, held);
        journal.rewrite(&open, &items).unwrap();
        assert!(journal.size() < bloated);
        drop(journal);

        let (_, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.items.len(), 1);
        assert_eq!(replay.items[0].data, Bytes::from_static(b"keep"));
        assert_eq!(replay.open_reads[&3].data, Bytes::from_static(b"held"));
        assert_eq!(replay.max_xid, 3);
    }
}
