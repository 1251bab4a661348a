//! Append-only command log.
//!
//! Commands are newline-framed RESP-like arrays: `*N\r\n` followed by N bulk
//! strings, each `$len\r\n<bytes>\r\n`. The log carries `SET key value`,
//! `SET key value EX <unix-epoch-nanos>`, `DEL key`, and `FLUSHDB`.
//! Replaying the log from the start reconstructs the primary tree and
//! expiration state; a trailing partial command is discarded by truncating
//! the file back to the last complete command.

use crate::config::SyncMode;
use crate::error::{AtollError, Result};
use crate::item::Item;
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SCRATCH_INITIAL_CAPACITY: usize = 8 * 1024;
const SCRATCH_SHRINK_THRESHOLD: usize = 1 << 20;

/// A replayed log command.
#[derive(Debug)]
pub(crate) enum Command {
    Set {
        key: Bytes,
        value: Bytes,
        deadline: Option<SystemTime>,
    },
    Del {
        key: Bytes,
    },
    FlushDb,
}

/// The append-only log file: buffered writer over one handle, direct handle
/// kept for replay, sync, and truncation.
#[derive(Debug)]
pub(crate) struct LogFile {
    file: File,
    writer: std::io::BufWriter<File>,
    path: PathBuf,
    size: u64,
    scratch: BytesMut,
}

impl LogFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        let writer = std::io::BufWriter::new(file.try_clone()?);

        Ok(LogFile {
            file,
            writer,
            path,
            size,
            scratch: BytesMut::with_capacity(SCRATCH_INITIAL_CAPACITY),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage a SET command into the pending batch.
    pub fn push_set(&mut self, item: &Item) {
        encode_set(&mut self.scratch, item);
    }

    /// Stage a DEL command into the pending batch.
    pub fn push_del(&mut self, key: &[u8]) {
        encode_del(&mut self.scratch, key);
    }

    /// Stage a FLUSHDB command into the pending batch.
    pub fn push_flushdb(&mut self) {
        encode_flushdb(&mut self.scratch);
    }

    /// Append the staged batch. On any write failure the file is cut back
    /// to its pre-batch length so a partial append never survives, and the
    /// error is surfaced for the caller to roll back.
    pub fn write_batch(&mut self) -> Result<()> {
        let prior = self.size;
        let staged = self.scratch.len();
        let result = (|| -> std::io::Result<()> {
            self.writer.write_all(&self.scratch)?;
            self.writer.flush()?;
            Ok(())
        })();
        self.scratch.clear();
        if self.scratch.capacity() > SCRATCH_SHRINK_THRESHOLD && staged <= SCRATCH_INITIAL_CAPACITY
        {
            self.scratch = BytesMut::with_capacity(SCRATCH_INITIAL_CAPACITY);
        }

        match result {
            Ok(()) => {
                self.size = prior + staged as u64;
                Ok(())
            }
            Err(err) => {
                self.rewind(prior);
                Err(err.into())
            }
        }
    }

    /// Append the staged batch and optionally sync it. A failed sync also
    /// cuts the file back, so the batch is all-or-nothing on disk.
    pub fn commit_batch(&mut self, sync: Option<SyncMode>) -> Result<()> {
        let prior = self.size;
        self.write_batch()?;
        if let Some(mode) = sync
            && let Err(err) = self.sync(mode)
        {
            self.rewind(prior);
            return Err(err);
        }
        Ok(())
    }

    fn rewind(&mut self, prior: u64) {
        // drop whatever the buffered writer still holds, then cut the file
        if let Ok(clone) = self.file.try_clone() {
            self.writer = std::io::BufWriter::new(clone);
        }
        let _ = self.file.set_len(prior);
        self.size = prior;
    }

    /// Flush buffered writes to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and sync to disk using the provided mode.
    pub fn sync(&mut self, mode: SyncMode) -> Result<()> {
        self.writer.flush()?;
        match mode {
            SyncMode::All => self.file.sync_all()?,
            SyncMode::Data => self.file.sync_data()?,
        }
        Ok(())
    }

    /// Read every command from the start of the file. A clean EOF ends the
    /// replay; EOF inside a command truncates the file back to the last
    /// complete command; malformed framing is unrecoverable.
    pub fn replay(&mut self) -> Result<Vec<Command>> {
        self.writer.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut commands = Vec::new();
        let mut valid = 0u64;
        let mut truncated = false;

        {
            let mut reader = BufReader::new(&mut self.file);
            loop {
                match read_command(&mut reader) {
                    Ok(Some((command, consumed))) => {
                        valid += consumed;
                        commands.push(command);
                    }
                    Ok(None) => break,
                    Err(AtollError::Io(err))
                        if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        truncated = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if truncated {
            self.file.set_len(valid)?;
            self.size = valid;
        }
        self.file.seek(SeekFrom::End(0))?;
        Ok(commands)
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        // best effort flush on drop, ignore errors
        let _ = self.writer.flush();
    }
}

pub(crate) fn encode_set(buf: &mut BytesMut, item: &Item) {
    match item.deadline {
        Some(deadline) => {
            let nanos = deadline
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_nanos() as u64;
            append_array(buf, 5);
            append_bulk(buf, b"SET");
            append_bulk(buf, &item.key);
            append_bulk(buf, &item.value);
            append_bulk(buf, b"EX");
            append_bulk(buf, nanos.to_string().as_bytes());
        }
        None => {
            append_array(buf, 3);
            append_bulk(buf, b"SET");
            append_bulk(buf, &item.key);
            append_bulk(buf, &item.value);
        }
    }
}

pub(crate) fn encode_del(buf: &mut BytesMut, key: &[u8]) {
    append_array(buf, 2);
    append_bulk(buf, b"DEL");
    append_bulk(buf, key);
}

pub(crate) fn encode_flushdb(buf: &mut BytesMut) {
    append_array(buf, 1);
    append_bulk(buf, b"FLUSHDB");
}

fn append_array(buf: &mut BytesMut, n: usize) {
    buf.put_u8(b'*');
    buf.extend_from_slice(n.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn append_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

/// Parse one command, returning it with the number of bytes consumed, or
/// `None` on a clean end of file.
fn read_command(reader: &mut impl BufRead) -> Result<Option<(Command, u64)>> {
    let mut line = Vec::new();
    let n = read_crlf_line(reader, &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    let mut consumed = n;

    if line.first() != Some(&b'*') {
        return Err(AtollError::InvalidDatabase);
    }
    let count = parse_decimal(&line[1..])?;
    // no known command carries more than five tokens
    if count == 0 || count > 5 {
        return Err(AtollError::InvalidDatabase);
    }

    let mut tokens = Vec::with_capacity(count);
    for _ in 0..count {
        let (token, n) = read_bulk(reader)?;
        consumed += n;
        tokens.push(token);
    }

    let command = decode_tokens(tokens)?;
    Ok(Some((command, consumed as u64)))
}

fn decode_tokens(tokens: Vec<Bytes>) -> Result<Command> {
    let name = tokens[0].to_ascii_uppercase();
    match (name.as_slice(), tokens.len()) {
        (b"SET", 3) => Ok(Command::Set {
            key: tokens[1].clone(),
            value: tokens[2].clone(),
            deadline: None,
        }),
        (b"SET", 5) if tokens[3].eq_ignore_ascii_case(b"EX") => {
            let nanos = parse_decimal_u64(&tokens[4])?;
            Ok(Command::Set {
                key: tokens[1].clone(),
                value: tokens[2].clone(),
                deadline: Some(UNIX_EPOCH + Duration::from_nanos(nanos)),
            })
        }
        (b"DEL", 2) => Ok(Command::Del {
            key: tokens[1].clone(),
        }),
        (b"FLUSHDB", 1) => Ok(Command::FlushDb),
        _ => Err(AtollError::InvalidDatabase),
    }
}

/// Read a `\r\n`-terminated line, excluding the terminator from `line` but
/// counting it in the returned byte count. Zero means clean EOF.
fn read_crlf_line(reader: &mut impl BufRead, line: &mut Vec<u8>) -> Result<usize> {
    line.clear();
    let n = reader.read_until(b'\n', line)?;
    if n == 0 {
        return Ok(0);
    }
    if line.len() < 2 || line[line.len() - 1] != b'\n' || line[line.len() - 2] != b'\r' {
        // a line that never saw its terminator is a truncated tail
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    line.truncate(line.len() - 2);
    Ok(n)
}

fn read_bulk(reader: &mut impl BufRead) -> Result<(Bytes, usize)> {
    let mut line = Vec::new();
    let n = read_crlf_line(reader, &mut line)?;
    if n == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    if line.first() != Some(&b'$') {
        return Err(AtollError::InvalidDatabase);
    }
    let len = parse_decimal(&line[1..])?;

    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data)?;
    if data[len] != b'\r' || data[len + 1] != b'\n' {
        return Err(AtollError::InvalidDatabase);
    }
    data.truncate(len);
    Ok((Bytes::from(data), n + len + 2))
}

fn parse_decimal(digits: &[u8]) -> Result<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(AtollError::InvalidDatabase);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(AtollError::InvalidDatabase)
}

fn parse_decimal_u64(digits: &[u8]) -> Result<u64> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(AtollError::InvalidDatabase);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(AtollError::InvalidDatabase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn set_item(key: &str, value: &str) -> Item {
        Item::new(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    #[test]
    fn test_log_creation() {
        let temp = NamedTempFile::new().unwrap();
        let log = LogFile::open(temp.path()).unwrap();
        assert_eq!(log.size(), 0);
    }

    #[test]
    fn test_set_framing() {
        let mut buf = BytesMut::new();
        encode_set(&mut buf, &set_item("k", "v"));
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn test_del_and_flushdb_framing() {
        let mut buf = BytesMut::new();
        encode_del(&mut buf, b"gone");
        assert_eq!(&buf[..], b"*2\r\n$3\r\nDEL\r\n$4\r\ngone\r\n");

        buf.clear();
        encode_flushdb(&mut buf);
        assert_eq!(&buf[..], b"*1\r\n$7\r\nFLUSHDB\r\n");
    }

    #[test]
    fn test_write_and_replay() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = LogFile::open(temp.path()).unwrap();

        log.push_set(&set_item("a", "1"));
        log.push_del(b"b");
        log.write_batch().unwrap();

        let commands = log.replay().unwrap();
        assert_eq!(commands.len(), 2);
        match &commands[0] {
            Command::Set {
                key,
                value,
                deadline,
            } => {
                assert_eq!(key.as_ref(), b"a");
                assert_eq!(value.as_ref(), b"1");
                assert!(deadline.is_none());
            }
            other => panic!("expected SET, got {other:?}"),
        }
        match &commands[1] {
            Command::Del { key } => assert_eq!(key.as_ref(), b"b"),
            other => panic!("expected DEL, got {other:?}"),
        }
    }

    #[test]
    fn test_deadline_round_trip() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = LogFile::open(temp.path()).unwrap();

        let deadline = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
        let mut item = set_item("k", "v");
        item.deadline = Some(deadline);
        log.push_set(&item);
        log.write_batch().unwrap();

        let commands = log.replay().unwrap();
        match &commands[0] {
            Command::Set { deadline: d, .. } => assert_eq!(*d, Some(deadline)),
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_safe_values() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = LogFile::open(temp.path()).unwrap();

        let item = Item::new(
            Bytes::copy_from_slice(b"bin\r\nkey"),
            Bytes::copy_from_slice(b"va\x00lue\r\n"),
        );
        log.push_set(&item);
        log.write_batch().unwrap();

        let commands = log.replay().unwrap();
        match &commands[0] {
            Command::Set { key, value, .. } => {
                assert_eq!(key.as_ref(), b"bin\r\nkey");
                assert_eq!(value.as_ref(), b"va\x00lue\r\n");
            }
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_tail_is_discarded() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = LogFile::open(temp.path()).unwrap();
        log.push_set(&set_item("a", "1"));
        log.write_batch().unwrap();
        let good_size = log.size();
        drop(log);

        // simulate a crash mid-append
        let mut file = OpenOptions::new().append(true).open(temp.path()).unwrap();
        file.write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nhal").unwrap();
        drop(file);

        let mut log = LogFile::open(temp.path()).unwrap();
        let commands = log.replay().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(log.size(), good_size);
        assert_eq!(
            std::fs::metadata(temp.path()).unwrap().len(),
            good_size
        );
    }

    #[test]
    fn test_garbage_is_invalid_database() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"hello world\r\n").unwrap();
        let mut log = LogFile::open(temp.path()).unwrap();
        assert!(matches!(log.replay(), Err(AtollError::InvalidDatabase)));
    }

    #[test]
    fn test_replay_accepts_lowercase_tokens() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n").unwrap();
        let mut log = LogFile::open(temp.path()).unwrap();
        let commands = log.replay().unwrap();
        assert!(matches!(commands[0], Command::Set { .. }));
    }

    #[test]
    fn test_append_resumes_after_replay() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = LogFile::open(temp.path()).unwrap();
        log.push_set(&set_item("a", "1"));
        log.write_batch().unwrap();

        log.replay().unwrap();
        log.push_set(&set_item("b", "2"));
        log.write_batch().unwrap();

        let commands = log.replay().unwrap();
        assert_eq!(commands.len(), 2);
    }
}
