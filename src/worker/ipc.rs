//! Buffered line-based IPC over pipes.
//!
//! The dispatcher talks to each worker through the worker's stdin/stdout.
//! Both ends use the same newline-delimited framing; the reader side can also
//! be drained by a background thread into a channel so that the consumer can
//! wait with a timeout.

use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::thread::{self, JoinHandle};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered line reader.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line_buffer: String,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer)? {
            0 => Ok(None),
            _ => {
                if self.line_buffer.ends_with('\n') {
                    self.line_buffer.pop();
                }
                if self.line_buffer.ends_with('\r') {
                    self.line_buffer.pop();
                }
                Ok(Some(&self.line_buffer))
            }
        }
    }
}

/// Buffered line writer.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

/// Something read off a pipe by [`spawn_pump`].
#[derive(Debug)]
pub enum Inbound<T> {
    /// A parsed message.
    Message(T),
    /// A line that did not parse.
    Malformed(String),
    /// The writer closed its end (or the read failed).
    Closed,
}

/// Read lines from `reader` on a background thread, parse each into `T`
/// and forward it to `tx`. Sends [`Inbound::Closed`] once on EOF or read
/// error and then exits.
pub fn spawn_pump<R, T>(name: String, reader: R, tx: Sender<Inbound<T>>) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    thread::Builder::new().name(name).spawn(move || {
        let mut reader = LineReader::new(reader);
        loop {
            let inbound = match reader.read_line() {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<T>(line.trim()) {
                    Ok(msg) => Inbound::Message(msg),
                    Err(e) => Inbound::Malformed(format!("{}: {}", e, line)),
                },
                Ok(None) | Err(_) => {
                    let _ = tx.send(Inbound::Closed);
                    return;
                }
            };
            if tx.send(inbound).is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn test_line_reader_writer_roundtrip() {
        let mut writer = LineWriter::new(Vec::new());
        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap(); // Already has newline
        writer.write_line("").unwrap();
        let bytes = writer.writer.into_inner().unwrap();

        let mut reader = LineReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_line().unwrap(), Some("hello"));
        assert_eq!(reader.read_line().unwrap(), Some("world"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_crlf_handling() {
        let mut reader = LineReader::new(Cursor::new(b"line1\r\nline2\n".to_vec()));
        assert_eq!(reader.read_line().unwrap(), Some("line1"));
        assert_eq!(reader.read_line().unwrap(), Some("line2"));
    }

    #[test]
    fn test_pump_parses_and_reports_close() {
        let input = b"{\"n\":1}\n\nnot json\n{\"n\":2}\n".to_vec();
        let (tx, rx) = crossbeam_channel::unbounded::<Inbound<serde_json::Value>>();
        let handle = spawn_pump("test-pump".into(), Cursor::new(input), tx).unwrap();

        let timeout = Duration::from_secs(5);
        match rx.recv_timeout(timeout).unwrap() {
            Inbound::Message(v) => assert_eq!(v["n"], 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), Inbound::Malformed(_)));
        match rx.recv_timeout(timeout).unwrap() {
            Inbound::Message(v) => assert_eq!(v["n"], 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), Inbound::Closed));
        handle.join().unwrap();
    }

    #[test]
    fn test_pump_over_real_pipe() {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        let (tx, rx) = crossbeam_channel::unbounded::<Inbound<serde_json::Value>>();
        let handle = spawn_pump("pipe-pump".into(), std::fs::File::from(read_fd), tx).unwrap();

        let mut writer = LineWriter::new(std::fs::File::from(write_fd));
        writer.write_line("[1,2,3]").unwrap();
        drop(writer);

        let timeout = Duration::from_secs(5);
        match rx.recv_timeout(timeout).unwrap() {
            Inbound::Message(v) => assert_eq!(v, serde_json::json!([1, 2, 3])),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), Inbound::Closed));
        handle.join().unwrap();
    }
}
