use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Encode a single commit to [len][bincode][crc32] format.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Decode the frame at the start of `buf`, returning the commit and the
/// frame's length. `None` for a short, corrupt or undecodable frame.
fn decode_frame(buf: &[u8]) -> Option<(Commit, usize)> {
    let len = u32::from_le_bytes(buf.get(..4)?.try_into().ok()?) as usize;
    let payload = buf.get(4..4 + len)?;
    let crc = u32::from_le_bytes(buf.get(4 + len..8 + len)?.try_into().ok()?);
    if crc != crc32fast::hash(payload) {
        return None;
    }
    let commit = bincode::deserialize(payload).ok()?;
    Some((commit, 8 + len))
}

/// What replay found on disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub commits: Vec<Commit>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    /// Bytes after the intact prefix: a torn or corrupt tail.
    pub discarded: u64,
}

/// Append-only Write-Ahead Log of committed transactions.
///
/// Format per entry: `[u32: len][bincode: Commit][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Replay stops at the first frame that fails the length or CRC check.
///   Opening the log cuts that tail off, so a torn transaction is dropped
///   whole and later commits never land behind it.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// End of the last durable frame.
    len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL at `path`, truncating anything past
    /// `valid_len` as reported by [`Wal::replay`].
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: on_disk.min(valid_len),
            appends_since_compact: 0,
        })
    }

    /// Write one commit as a single frame and fsync it. On failure the file
    /// is cut back to the previous frame boundary.
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        let mut frame = Vec::new();
        encode_commit(&mut frame, commit)?;
        let written = self
            .file
            .write_all(&frame)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            let _ = self.file.set_len(self.len);
            return Err(e);
        }
        self.len += frame.len() as u64;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot to a temp file and fsync.
    pub fn write_compact_file(path: &Path, snapshot: &Commit) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut file = File::create(&tmp_path)?;
        let mut frame = Vec::new();
        encode_commit(&mut frame, snapshot)?;
        file.write_all(&frame)?;
        file.sync_all()
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.len = self.file.metadata()?.len();
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &Commit) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact commit from the start of the log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut commits = Vec::new();
        let mut offset = 0;
        while let Some((commit, frame_len)) = decode_frame(&bytes[offset..]) {
            commits.push(commit);
            offset += frame_len;
        }
        Ok(Replay {
            commits,
            valid_len: offset as u64,
            discarded: (bytes.len() - offset) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mutation, Reservation, Resource};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("printbay_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn printer(id: u32, busy: bool) -> Resource {
        Resource {
            id,
            name: format!("P{id}"),
            group: "main".into(),
            busy,
            last_holder: None,
            privileged: false,
        }
    }

    fn reserve_commit(id: u64) -> Commit {
        Commit {
            mutations: vec![
                Mutation::ResourcePut(printer(1, true)),
                Mutation::ReservationPut(Reservation {
                    id,
                    resource_id: 1,
                    user_id: 7,
                    reserved_at: 0,
                    complete_at: 60_000,
                    active: true,
                    scope: "main".into(),
                }),
            ],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let commits = vec![
            Commit { mutations: vec![Mutation::ResourcePut(printer(1, false))] },
            reserve_commit(1),
        ];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap().commits, commits);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_transaction_is_dropped_whole() {
        let path = tmp_path("torn.wal");
        let _ = fs::remove_file(&path);

        let first = Commit { mutations: vec![Mutation::QuotaLimitSet { limit: 2 }] };
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
        }

        // Second multi-row commit cut off halfway through its payload
        {
            let payload = bincode::serialize(&reserve_commit(1)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload[..payload.len() / 2]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, vec![first]);
        assert!(replay.discarded > 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_cuts_torn_tail_before_appending() {
        let path = tmp_path("torn_then_append.wal");
        let _ = fs::remove_file(&path);

        let first = Commit { mutations: vec![Mutation::QuotaLimitSet { limit: 2 }] };
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFF, 0x00, 0x00]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.valid_len, intact);
        assert_eq!(replay.discarded, 3);

        // A commit written after restart must not sit behind the garbage.
        let second = reserve_commit(1);
        {
            let mut wal = Wal::open(&path, replay.valid_len).unwrap();
            wal.append(&second).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, vec![first, second]);
        assert_eq!(replay.discarded, 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().commits.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&reserve_commit(3)).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().commits.is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let snapshot = Commit {
            mutations: vec![
                Mutation::ResourcePut(printer(1, false)),
                Mutation::ReservationIdFloor { next: 5 },
            ],
        };
        let next = reserve_commit(5);

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for id in 1..5 {
                wal.append(&reserve_commit(id)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            wal.append(&next).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().commits, vec![snapshot, next]);
        let _ = fs::remove_file(&path);
    }
}
