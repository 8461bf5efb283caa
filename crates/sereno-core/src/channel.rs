//! Notification channel between the supervisor and its workers.
//!
//! The channel is a named pipe under the run directory. Workers write short
//! status reports; the supervisor is the only reader and blocks on it with a
//! timeout instead of polling process state in a tight loop.
//!
//! # Framing
//!
//! ```text
//! <decimal length>\n<JSON payload of that many bytes>
//! 0\n                                  wake-up ping, no payload
//! 14\n{"ping":31337}                   worker "ping" is alive as pid 31337
//! 13\n{"ping":null}                    worker finished normally
//! 15\n{"ping":"down"}                  worker asks not to be respawned
//! ```
//!
//! Every frame is written with a single `write(2)` and stays far below
//! `PIPE_BUF`, so concurrent writers never interleave.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::stat::Mode;
use serde_json::{Map, Value};

use crate::error::{Result, SupervisorError};
use crate::types::WorkerName;

/// Encoded wake-up ping. Safe to write from a signal handler.
pub const WAKE_FRAME: &[u8] = b"0\n";

/// Largest payload accepted by the reader.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const WRITE_RETRIES: u32 = 50;

/// What a worker reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Worker started and runs as this pid.
    Alive(i32),
    /// Task returned normally; the worker is about to exit.
    Finished,
    /// Task asked to be taken down and not respawned.
    Down,
    /// Value the supervisor does not understand.
    Unknown(String),
}

impl Report {
    fn to_value(&self) -> Value {
        match self {
            Self::Alive(pid) => Value::from(*pid),
            Self::Finished => Value::Null,
            Self::Down => Value::from("down"),
            Self::Unknown(text) => Value::from(text.as_str()),
        }
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::Finished,
            Value::String(s) if s == "down" => Self::Down,
            Value::Number(n) => n
                .as_i64()
                .and_then(|pid| i32::try_from(pid).ok())
                .map_or_else(|| Self::Unknown(n.to_string()), Self::Alive),
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length ping; only wakes the reader.
    Wake,
    /// Name to report mapping.
    Reports(Vec<(WorkerName, Report)>),
}

impl Message {
    /// Single report message.
    #[must_use]
    pub fn report(name: WorkerName, report: Report) -> Self {
        Self::Reports(vec![(name, report)])
    }

    /// Encodes the message into one frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Wake => WAKE_FRAME.to_vec(),
            Self::Reports(reports) => {
                let payload: Map<String, Value> = reports
                    .iter()
                    .map(|(name, report)| (name.as_str().to_string(), report.to_value()))
                    .collect();
                let payload = Value::Object(payload).to_string();
                let mut frame = format!("{}\n", payload.len()).into_bytes();
                frame.extend_from_slice(payload.as_bytes());
                frame
            }
        }
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| SupervisorError::protocol(format!("bad payload: {e}")))?;
        let Value::Object(map) = value else {
            return Err(SupervisorError::protocol("payload is not a mapping"));
        };
        Ok(Self::Reports(
            map.into_iter()
                .map(|(name, value)| (WorkerName::new(name), Report::from_value(value)))
                .collect(),
        ))
    }
}

/// Incremental frame decoder for a non-blocking byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered, undecoded bytes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next complete frame, if one is buffered.
    ///
    /// # Errors
    /// Returns a protocol error on a malformed frame. Only the offending
    /// header line is dropped, so frames queued behind it still decode.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > 20 {
                self.buffer.clear();
                return Err(SupervisorError::protocol("frame header too long"));
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&self.buffer[..newline])
            .ok()
            .and_then(|h| h.trim().parse::<usize>().ok());
        let Some(len) = header else {
            self.buffer.drain(..=newline);
            return Err(SupervisorError::protocol("frame header is not a length"));
        };
        if len > MAX_FRAME_LEN {
            self.buffer.drain(..=newline);
            return Err(SupervisorError::protocol(format!(
                "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
            )));
        }

        let start = newline + 1;
        if self.buffer.len() < start + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(..start + len).collect();
        if len == 0 {
            return Ok(Some(Message::Wake));
        }
        Message::decode_payload(&frame[start..]).map(Some)
    }
}

/// Creates the FIFO at `path`, replacing any leftover file.
///
/// # Errors
/// `FilePermission` if the stale file cannot be removed or the FIFO cannot be
/// created.
pub fn create_fifo(path: &Path) -> Result<()> {
    remove_fifo(path)?;
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|errno| SupervisorError::file_permission(path, format!("mkfifo: {errno}")))
}

/// Removes the FIFO; a missing file is not an error.
///
/// # Errors
/// `FilePermission` if the file exists and cannot be removed.
pub fn remove_fifo(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SupervisorError::file_permission(path, e)),
    }
}

/// Supervisor side of the channel.
///
/// Opened read-write so the pipe never reports end-of-file while no worker
/// holds it open.
#[derive(Debug)]
pub struct ChannelReader {
    file: File,
    path: PathBuf,
    decoder: FrameDecoder,
}

impl ChannelReader {
    /// Creates a fresh FIFO at `path` and opens it for reading.
    ///
    /// # Errors
    /// `FilePermission` if the FIFO cannot be created or opened.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        create_fifo(&path)?;
        Self::open(path)
    }

    /// Opens an existing FIFO for reading.
    ///
    /// # Errors
    /// `FilePermission` if the FIFO cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| SupervisorError::file_permission(&path, e))?;
        Ok(Self {
            file,
            path,
            decoder: FrameDecoder::new(),
        })
    }

    /// Path of the FIFO.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw descriptor, used to install the wake-up ping target.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Waits up to `timeout` for one complete message.
    ///
    /// Returns `Ok(None)` on timeout or when a signal interrupts the wait.
    ///
    /// # Errors
    /// I/O errors from the pipe, or a protocol error for a malformed frame.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.wait_readable(remaining)? {
                return Ok(None);
            }
            if self.fill()? == 0 && remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, millis) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(SupervisorError::Io(errno.into())),
        }
    }

    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 4096];
        match (&self.file).read(&mut chunk) {
            Ok(n) => {
                self.decoder.push(&chunk[..n]);
                Ok(n)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Closes the reader and deletes the FIFO.
    ///
    /// # Errors
    /// `FilePermission` if the FIFO cannot be removed.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        remove_fifo(&path)
    }
}

/// Worker (or administrative command) side of the channel.
#[derive(Debug)]
pub struct ChannelWriter {
    file: File,
}

impl ChannelWriter {
    /// Opens the FIFO for writing without blocking.
    ///
    /// # Errors
    /// Fails with `FilePermission` when the FIFO is missing or nobody is
    /// reading it.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| SupervisorError::file_permission(path, e))?;
        Ok(Self { file })
    }

    /// Raw descriptor, used to install the wake-up ping target.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Writes one framed message.
    ///
    /// # Errors
    /// I/O errors other than a briefly full pipe.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let frame = message.encode();
        let mut attempts = 0;
        loop {
            match (&self.file).write_all(&frame) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < WRITE_RETRIES => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sends a wake-up ping.
    ///
    /// # Errors
    /// See [`ChannelWriter::send`].
    pub fn wake(&mut self) -> Result<()> {
        self.send(&Message::Wake)
    }
}

/// Best-effort wake-up of a running supervisor listening on `path`.
///
/// Returns false when nobody is listening.
#[must_use]
pub fn wake_supervisor(path: &Path) -> bool {
    ChannelWriter::open(path)
        .and_then(|mut writer| writer.wake())
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(bytes: &[u8]) -> Vec<Message> {
        let mut decoder = FrameDecoder::new();
        decoder.push(bytes);
        let mut out = vec![];
        while let Some(message) = decoder.next_message().unwrap() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_wake_frame() {
        assert_eq!(Message::Wake.encode(), b"0\n");
        assert_eq!(decode_all(b"0\n"), vec![Message::Wake]);
    }

    #[test]
    fn test_report_frames() {
        let frame = Message::report(WorkerName::new("ping"), Report::Alive(31337)).encode();
        assert_eq!(frame, b"14\n{\"ping\":31337}");

        let frame = Message::report(WorkerName::new("ping"), Report::Finished).encode();
        assert_eq!(frame, b"13\n{\"ping\":null}");

        let frame = Message::report(WorkerName::new("ping"), Report::Down).encode();
        assert_eq!(frame, b"15\n{\"ping\":\"down\"}");
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut bytes = Message::Wake.encode();
        bytes.extend(Message::report(WorkerName::new("a^0"), Report::Down).encode());
        bytes.extend(Message::Wake.encode());
        assert_eq!(
            decode_all(&bytes),
            vec![
                Message::Wake,
                Message::report(WorkerName::new("a^0"), Report::Down),
                Message::Wake,
            ]
        );
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = Message::report(WorkerName::new("ping"), Report::Finished).encode();
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..5]);
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.push(&frame[5..]);
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::report(WorkerName::new("ping"), Report::Finished))
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_unknown_value() {
        assert_eq!(
            decode_all(b"15\n{\"ping\":\"what\"}"),
            vec![Message::report(
                WorkerName::new("ping"),
                Report::Unknown("\"what\"".to_string())
            )]
        );
    }

    #[test]
    fn test_garbage_header_is_protocol_error() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"xyz\n{}");
        assert!(matches!(
            decoder.next_message(),
            Err(SupervisorError::Protocol(_))
        ));
        assert_eq!(decoder.pending(), 2);
    }

    #[test]
    fn test_garbage_header_keeps_queued_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"xyz\n");
        decoder.push(&Message::report(WorkerName::new("quitter"), Report::Down).encode());
        decoder.push(&Message::Wake.encode());

        assert!(matches!(
            decoder.next_message(),
            Err(SupervisorError::Protocol(_))
        ));
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::report(WorkerName::new("quitter"), Report::Down))
        );
        assert_eq!(decoder.next_message().unwrap(), Some(Message::Wake));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(format!("{}\n", MAX_FRAME_LEN + 1).as_bytes());
        assert!(decoder.next_message().is_err());
    }

    #[test]
    fn test_fifo_send_and_receive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon-controller");
        let mut reader = ChannelReader::create(&path).unwrap();

        let mut writer = ChannelWriter::open(&path).unwrap();
        writer
            .send(&Message::report(WorkerName::new("ping"), Report::Alive(42)))
            .unwrap();
        writer.wake().unwrap();

        assert_eq!(
            reader.receive(Duration::from_secs(1)).unwrap(),
            Some(Message::report(WorkerName::new("ping"), Report::Alive(42)))
        );
        assert_eq!(
            reader.receive(Duration::ZERO).unwrap(),
            Some(Message::Wake)
        );
        assert_eq!(reader.receive(Duration::from_millis(20)).unwrap(), None);

        reader.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_receive_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = ChannelReader::create(dir.path().join("fifo")).unwrap();
        let start = Instant::now();
        assert_eq!(reader.receive(Duration::from_millis(50)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_create_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        std::fs::write(&path, b"leftover").unwrap();
        let reader = ChannelReader::create(&path).unwrap();
        assert!(wake_supervisor(&path));
        reader.remove().unwrap();
    }

    #[test]
    fn test_writer_without_reader_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        create_fifo(&path).unwrap();
        assert!(ChannelWriter::open(&path).is_err());
        assert!(!wake_supervisor(&dir.path().join("missing")));
    }

    proptest! {
        #[test]
        fn prop_decoder_survives_arbitrary_chunking(
            pids in proptest::collection::vec(1i32..1_000_000, 1..8),
            split in 0usize..200,
        ) {
            let messages: Vec<Message> = pids
                .iter()
                .enumerate()
                .map(|(i, pid)| Message::report(WorkerName::replica("w", i as u32), Report::Alive(*pid)))
                .collect();
            let bytes: Vec<u8> = messages.iter().flat_map(Message::encode).collect();
            let split = split.min(bytes.len());

            let mut decoder = FrameDecoder::new();
            let mut decoded = vec![];
            decoder.push(&bytes[..split]);
            while let Some(m) = decoder.next_message().unwrap() {
                decoded.push(m);
            }
            decoder.push(&bytes[split..]);
            while let Some(m) = decoder.next_message().unwrap() {
                decoded.push(m);
            }
            prop_assert_eq!(decoded, messages);
        }
    }
}
