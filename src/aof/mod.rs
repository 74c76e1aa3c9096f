//! The append-only command log. A single file handle backs both the
//! buffered append writer and replay reads; commits append whole frames
//! through the buffer and flush at commit boundaries, so a well-formed log
//! only ever grows by complete frames.

pub(crate) mod format;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errinvalid;
use crate::error::{Error, Result};
use format::{Command, FrameError};

pub(crate) struct Aof {
    file: File,
    writer: std::io::BufWriter<File>,
    path: PathBuf,
}

impl Aof {
    /// Opens or creates the log at `path`. The caller replays before
    /// appending; see [`Aof::replay`] and [`Aof::seek_to_end`].
    pub fn open(path: &Path) -> Result<Self> {
        if let Ok(meta) = std::fs::metadata(path) {
            if !meta.is_file() {
                return errinvalid!("{:?} is not a regular file", path);
            }
        }
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let writer = std::io::BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            path: path.to_path_buf(),
        })
    }

    /// Opens the log for appending only, trusting its contents. Used when
    /// swapping in a freshly shrunk file.
    pub fn open_at_end(path: &Path) -> Result<Self> {
        let mut aof = Self::open(path)?;
        aof.seek_to_end()?;
        Ok(aof)
    }

    /// Opens a handle whose descriptor cannot be written, so buffered
    /// appends fail at flush time. Lets tests drive the commit failure
    /// path.
    #[cfg(test)]
    pub(crate) fn open_read_only(path: &Path) -> Result<Self> {
        let file = File::options().read(true).open(path)?;
        let writer = std::io::BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterates every frame from the start of the file. A structurally
    /// malformed frame surfaces as `Error::Invalid` and condemns the log;
    /// a frame cut short by the end of the file is a torn tail left by an
    /// interrupted append, so the file is truncated back to the last
    /// complete frame and iteration ends with the valid prefix intact.
    pub fn replay(&mut self) -> Result<Replay> {
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Replay {
            reader: CountingReader {
                inner: BufReader::new(reader),
                count: 0,
            },
            file: self.file.try_clone()?,
            good_offset: 0,
            done: false,
        })
    }

    /// Positions the shared file cursor at the end for appending. Must run
    /// after replay and before the first append.
    pub fn seek_to_end(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    /// Encodes the commands into the append buffer.
    pub fn append(&mut self, commands: &[Command]) -> Result<()> {
        let mut buf = Vec::new();
        for command in commands {
            command.encode_into(&mut buf);
        }
        self.writer.write_all(&buf)?;
        Ok(())
    }

    /// Flushes buffered frames to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// The flushed size of the log in bytes.
    pub fn size(&mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.file.metadata()?.len())
    }

    /// The on-disk size without flushing, for background bookkeeping.
    pub fn disk_size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }
}

/// Counts consumed bytes so the replay knows where each complete frame
/// ends.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

pub(crate) struct Replay {
    reader: CountingReader<BufReader<File>>,
    file: File,
    /// Offset just past the last complete frame.
    good_offset: u64,
    done: bool,
}

impl Iterator for Replay {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match format::read_command(&mut self.reader) {
            Ok(Some(command)) => {
                self.good_offset = self.reader.count;
                Some(Ok(command))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(FrameError::Truncated) => {
                // An interrupted append left a half-written frame at the
                // end; cut the file back to the last complete frame and
                // keep the valid prefix.
                self.done = true;
                tracing::warn!(offset = self.good_offset, "truncating torn log tail");
                match self.file.set_len(self.good_offset) {
                    Ok(()) => None,
                    Err(e) => Some(Err(e.into())),
                }
            }
            Err(FrameError::Failed(e)) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// The temp file a shrink of `path` writes into before the atomic swap.
pub(crate) fn snapshot_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Writes one frame per command to `tmp_path`. Runs without the database
/// lock; the live log keeps taking commits meanwhile.
pub(crate) fn write_snapshot(tmp_path: &Path, commands: &[Command]) -> Result<()> {
    let mut writer = std::io::BufWriter::new(File::create(tmp_path)?);
    let mut buf = Vec::new();
    for command in commands {
        buf.clear();
        command.encode_into(&mut buf);
        writer.write_all(&buf)?;
    }
    writer.flush()?;
    Ok(())
}

/// Completes a shrink: copies everything the live log gained past `offset`
/// verbatim after the snapshot frames, fsyncs, atomically replaces the
/// live file, and reopens the append handle. Runs under the database
/// write lock so no commit can slip between the copy and the swap.
pub(crate) fn finish_rewrite(path: &Path, tmp_path: &Path, offset: u64) -> Result<Aof> {
    let mut tmp = File::options().append(true).open(tmp_path)?;
    let mut live = File::open(path)?;
    live.seek(SeekFrom::Start(offset))?;
    std::io::copy(&mut live, &mut tmp).map_err(Error::from)?;
    tmp.sync_all()?;
    std::fs::rename(tmp_path, path)?;
    Aof::open_at_end(path)
}
