//! The append-only journal recording identity store mutations.
//!
//! One record per line: `<uid> <op> <timestamp-hex16>`. In steady state the
//! file only ever grows; the single operation that rewrites it, `put_diff`,
//! builds the new content in a sibling lock file and renames it over the
//! live one, so readers never observe a partial file.

use crate::error::{Error, Result};
use log::{debug, info, warn};
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    unistd::fdatasync,
};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// The operation a journal record describes.
pub enum Op {
    Added,
    Removed,
    Unchanged,
    Failed,
}

impl Op {
    /// The single character encoding of the operation.
    pub fn as_char(self) -> char {
        match self {
            Op::Added => '+',
            Op::Removed => '-',
            Op::Unchanged => '=',
            Op::Failed => '!',
        }
    }

    /// Decode an operation character.
    pub fn from_char(c: char) -> Result<Op> {
        match c {
            '+' => Ok(Op::Added),
            '-' => Ok(Op::Removed),
            '=' => Ok(Op::Unchanged),
            '!' => Ok(Op::Failed),
            _ => Err(Error::Failed(format!("invalid journal operation: {}", c))),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// One parsed journal record.
pub struct Entry {
    pub uid: String,
    pub op: Op,
    pub ts: u64,
}

/// The journal over one log file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    fresh: bool,
    last_ts: u64,
}

impl Journal {
    /// Open (or create) the journal file `name` below `root`.
    pub fn open<P: AsRef<Path>>(root: P, name: &str) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| Error::io(format!("create journal root {}", root.display()), e))?;

        let path = root.join(name);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .mode(0o666)
            .custom_flags(o_cloexec())
            .open(&path)
            .map_err(|e| Error::io(format!("open journal {}", path.display()), e))?;

        let size = file
            .metadata()
            .map_err(|e| Error::io("could not read from journal", e))?
            .len();

        info!("Journal '{}' loaded; size: {} bytes", name, size);

        Ok(Self {
            path,
            file,
            fresh: size == 0,
            last_ts: 0,
        })
    }

    /// True iff the file was empty at open time and no record has been
    /// written since.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Append one record and flush it to disk. A failing flush is warned
    /// about but does not fail the call.
    pub fn put(&mut self, uid: &str, op: Op) -> Result<()> {
        let line = self.format_entry(uid, op);
        Self::write_entry(&mut self.file, &line)?;

        if let Err(e) = fdatasync(self.file.as_raw_fd()) {
            warn!("Could not flush (fdatasync) journal: {}", e);
        }

        self.fresh = false;
        Ok(())
    }

    /// Atomically append all records of `diff` by rewriting the journal:
    /// the previous contents plus one record per diff entry land in a lock
    /// file which then replaces the live file via rename. Only `Added` and
    /// `Removed` are valid diff operations; anything else aborts with the
    /// live journal untouched.
    pub fn put_diff(&mut self, diff: &BTreeMap<String, Op>) -> Result<()> {
        let mut lock_path = self.path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .custom_flags(o_cloexec())
            .open(&lock_path)
            .map_err(|e| Error::io(format!("open lock file {}", lock_path.display()), e))?;

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io("could not query journal", e))?;
        std::io::copy(&mut self.file, &mut lock)
            .map_err(|e| Error::io("copy journal to lock file", e))?;

        for (uid, op) in diff {
            match op {
                Op::Added | Op::Removed => (),
                _ => {
                    return Err(Error::Failed(format!(
                        "unsupported op-code in diff: {}",
                        op.as_char()
                    )))
                }
            }

            let line = self.format_entry(uid, *op);
            Self::write_entry(&mut lock, &line)?;
        }

        fdatasync(lock.as_raw_fd())
            .map_err(|e| Error::from_nix("flush lock file", e))?;

        fcntl(lock.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_APPEND))
            .map_err(|e| Error::from_nix("set append mode on lock file", e))?;

        std::fs::rename(&lock_path, &self.path)
            .map_err(|e| Error::io("rename lock file over journal", e))?;

        self.file = lock;
        self.fresh = false;
        Ok(())
    }

    /// Read all records in file order. Malformed lines are skipped with a
    /// warning and do not fail the listing.
    pub fn list(&mut self) -> Result<Vec<Entry>> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io("could not read from journal", e))?;

        let mut buf = String::new();
        self.file
            .read_to_string(&mut buf)
            .map_err(|e| Error::io("could not read from journal", e))?;

        let mut res = Vec::new();
        for line in buf.lines().filter(|l| !l.is_empty()) {
            match Self::parse_entry(line) {
                Some(entry) => res.push(entry),
                None => warn!("Invalid journal entry: '{}'", line),
            }
        }

        Ok(res)
    }

    /// Truncate the journal to zero length and mark it fresh.
    pub fn reset(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| Error::io("truncate journal", e))?;

        self.fresh = true;
        Ok(())
    }

    fn format_entry(&mut self, uid: &str, op: Op) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        // Clamp so records never go backwards on clock adjustments.
        self.last_ts = now.max(self.last_ts);

        format!("{} {} {:016X}\n", uid, op.as_char(), self.last_ts)
    }

    fn write_entry(file: &mut File, line: &str) -> Result<()> {
        file.write_all(line.as_bytes())
            .map_err(|e| Error::io("could not add journal entry", e))?;

        debug!("Wrote journal entry '{}'", line.trim_end());
        Ok(())
    }

    fn parse_entry(line: &str) -> Option<Entry> {
        let mut parts = line.split_whitespace();
        let uid = parts.next()?;
        let opstr = parts.next()?;
        let ts = parts.next()?;

        if parts.next().is_some() || opstr.chars().count() != 1 || ts.len() != 16 {
            return None;
        }

        let op = Op::from_char(opstr.chars().next()?).ok()?;
        let ts = u64::from_str_radix(ts, 16).ok()?;

        Some(Entry {
            uid: uid.to_string(),
            op,
            ts,
        })
    }
}

fn o_cloexec() -> i32 {
    OFlag::O_CLOEXEC.bits()
}
