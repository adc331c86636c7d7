use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: u32 length + u32 crc.
const FRAME_OVERHEAD: u64 = 8;

/// Encode one commit as `[len][bincode][crc32]`.
fn encode_commit(writer: &mut impl Write, commit: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read a fixed-size chunk; `Ok(false)` on a clean or torn end of file.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Everything recovered from disk on startup.
#[derive(Debug, Default)]
pub struct Replay {
    /// Commits in append order; each one is applied all-or-nothing.
    pub commits: Vec<Vec<Event>>,
    /// Byte length of the valid prefix. Anything after it is a torn write.
    pub valid_len: u64,
}

impl Replay {
    pub fn event_count(&self) -> usize {
        self.commits.iter().map(Vec::len).sum()
    }
}

/// Append-only write-ahead log of booking commits.
///
/// Frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`. A commit that was
/// only partly written when the process died fails the length or CRC check,
/// is discarded on replay and cut off before new frames are appended, so a
/// half-written cancellation can never resurface without its promotion.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, truncating any torn tail first.
    pub fn open(path: &Path) -> io::Result<(Self, Replay)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        if file.metadata()?.len() > replay.valid_len {
            tracing::warn!(
                "truncating torn WAL tail at byte {} in {}",
                replay.valid_len,
                path.display()
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: replay.commits.len() as u64,
        };
        Ok((wal, replay))
    }

    /// Append one commit and fsync. Tests only; the writer task batches.
    #[cfg(test)]
    pub fn append(&mut self, commit: &[Event]) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer one commit without syncing. `flush_sync` makes the batch durable.
    pub fn append_buffered(&mut self, commit: &[Event]) -> io::Result<()> {
        encode_commit(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a compacted log to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, commits: &[Vec<Event>]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact commit from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            if !read_chunk(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if !read_chunk(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_chunk(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            let Ok(commit) = bincode::deserialize::<Vec<Event>>(&payload) else {
                break;
            };
            replay.commits.push(commit);
            replay.valid_len += len as u64 + FRAME_OVERHEAD;
        }

        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StatusReason;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("classbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn scheduled(capacity: u32) -> Event {
        Event::ClassScheduled {
            id: Ulid::new(),
            site_id: 1,
            name: Some("Spinning".into()),
            starts_at: 1_000,
            ends_at: 2_000,
            capacity,
        }
    }

    #[test]
    fn append_and_replay_commits() {
        let path = tmp_path("append_replay.wal");
        let class_id = Ulid::new();
        let booking_id = Ulid::new();
        let commits = vec![
            vec![scheduled(5)],
            vec![
                Event::BookingCancelled {
                    id: booking_id,
                    class_id,
                    at: 500,
                    reason: StatusReason::Cancelled,
                },
                Event::WaitlistPromoted { id: Ulid::new(), class_id, at: 500 },
            ],
        ];

        {
            let (mut wal, replay) = Wal::open(&path).unwrap();
            assert!(replay.commits.is_empty());
            for c in &commits {
                wal.append(c).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, commits);
        assert_eq!(replay.event_count(), 3);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn torn_tail_is_dropped_and_truncated() {
        let path = tmp_path("torn_tail.wal");
        let first = vec![scheduled(1)];
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[42u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let second = vec![scheduled(2)];
        {
            let (mut wal, replay) = Wal::open(&path).unwrap();
            assert_eq!(replay.commits, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            wal.append(&second).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, vec![first, second]);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt_crc.wal");
        let commit = vec![Event::ClassRemoved { id: Ulid::new() }];
        {
            let payload = bincode::serialize(&commit).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.commits.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.commits.is_empty());
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let class = scheduled(3);
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&[class.clone()]).unwrap();
            for _ in 0..20 {
                let id = Ulid::new();
                wal.append(&[Event::CapacityChanged { id, capacity: 4 }]).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();

            Wal::write_compact_file(&path, &[vec![class.clone()]]).unwrap();
            wal.swap_compact_file().unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);

            wal.append(&[Event::ClassRemoved { id: Ulid::new() }]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits.len(), 2);
        assert_eq!(replay.commits[0], vec![class]);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let commits: Vec<Vec<Event>> = (0..4).map(|i| vec![scheduled(i + 1)]).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 4);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().commits, commits);
    }
}
