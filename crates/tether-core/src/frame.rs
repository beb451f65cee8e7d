//! Frame encoding and decoding for the Tether wire protocol.
//!
//! Frames are line based:
//!
//! ```text
//! COMMAND arg1 arg2 ...\r\n
//! Key: value\r\n
//! Key: value\r\n
//! \r\n
//! [exactly <size> raw bytes, for D and M frames only]
//! ```
//!
//! The reader can run unbuffered, pulling one byte per read from the
//! underlying stream. The handshake relies on this: when the stream cipher is
//! swapped, or when a socket is handed to the rendezvous splice, no bytes may
//! have been read ahead under the old state.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Header block / parameter map
pub type Parameters = BTreeMap<String, String>;

/// Longest accepted line, terminator excluded
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Most header lines accepted in one frame
pub const MAX_HEADERS: usize = 1024;

/// Largest raw payload accepted after a `D` or `M` frame
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `H`: handshake hello
    Hello,
    /// `A`: handshake authentication
    Auth,
    /// `I`: invoke
    Invoke,
    /// `G`: get (invoke with data intent)
    Get,
    /// `R`: response header
    Response,
    /// `D`: data chunk
    Data,
    /// `E`: channel error
    Error,
    /// `C`: stop a channel
    Cancel,
    /// `M`: one-way message
    Message,
}

impl Command {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Hello => "H",
            Command::Auth => "A",
            Command::Invoke => "I",
            Command::Get => "G",
            Command::Response => "R",
            Command::Data => "D",
            Command::Error => "E",
            Command::Cancel => "C",
            Command::Message => "M",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "H" => Ok(Command::Hello),
            "A" => Ok(Command::Auth),
            "I" => Ok(Command::Invoke),
            "G" => Ok(Command::Get),
            "R" => Ok(Command::Response),
            "D" => Ok(Command::Data),
            "E" => Ok(Command::Error),
            "C" => Ok(Command::Cancel),
            "M" => Ok(Command::Message),
            _ => Err(Error::Protocol(format!("unknown command {s:?}").into())),
        }
    }
}

/// One decoded frame: command, arguments and header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    args: Vec<String>,
    /// Argument text exactly as it appears after the command letter
    line: String,
    headers: Parameters,
}

impl Frame {
    /// Create a frame with no arguments and no headers
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            args: Vec::new(),
            line: String::new(),
            headers: Parameters::new(),
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl fmt::Display) -> Self {
        let arg = sanitize(&arg.to_string());
        if !self.args.is_empty() {
            self.line.push(' ');
        }
        self.line.push_str(&arg);
        self.args.push(arg);
        self
    }

    /// Add a header line
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add every entry of `headers`
    #[must_use]
    pub fn headers_from(mut self, headers: &Parameters) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Frame command
    #[must_use]
    pub fn command(&self) -> Command {
        self.command
    }

    /// Frame arguments
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Header block
    #[must_use]
    pub fn headers(&self) -> &Parameters {
        &self.headers
    }

    /// Consume the frame, keeping its header block
    #[must_use]
    pub fn into_headers(self) -> Parameters {
        self.headers
    }

    /// Look up a header
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Look up a header that must be present
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the header is missing.
    pub fn require_header(&self, name: &str) -> Result<&str> {
        self.header_value(name)
            .ok_or_else(|| Error::Protocol(format!("{} frame lacks {name:?}", self.command).into()))
    }

    /// Argument at `index` as a string
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the argument is missing.
    pub fn arg_str(&self, index: usize) -> Result<&str> {
        self.args.get(index).map(String::as_str).ok_or_else(|| {
            Error::Protocol(format!("{} frame lacks argument {index}", self.command).into())
        })
    }

    /// Argument at `index`, parsed
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the argument is missing or does not parse.
    pub fn parse_arg<T: FromStr>(&self, index: usize) -> Result<T> {
        let raw = self.arg_str(index)?;
        raw.parse().map_err(|_| {
            Error::Protocol(format!("{} frame has invalid argument {raw:?}", self.command).into())
        })
    }

    /// Verbatim remainder of the command line after `index` arguments
    ///
    /// Positional arguments are separated by single spaces; whatever
    /// follows them, inner and trailing spaces included, is returned as is.
    #[must_use]
    pub fn rest_from(&self, index: usize) -> String {
        self.line
            .splitn(index + 1, ' ')
            .nth(index)
            .unwrap_or_default()
            .to_owned()
    }

    /// Serialize the command line and header block
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(64);
        out.push_str(self.command.as_str());
        if !self.args.is_empty() {
            out.push(' ');
            out.push_str(&self.line);
        }
        out.push_str("\r\n");

        for (name, value) in &self.headers {
            out.push_str(&sanitize(name).replace(':', ""));
            out.push_str(": ");
            out.push_str(&sanitize(value));
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn sanitize(field: &str) -> String {
    field.replace(['\r', '\n'], " ")
}

fn parse_command_line(line: &str) -> Result<Frame> {
    let line = line.trim_start();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    if word.is_empty() {
        return Err(Error::protocol("empty command line"));
    }
    let command: Command = word.parse()?;

    Ok(Frame {
        command,
        args: rest.split_whitespace().map(str::to_owned).collect(),
        line: rest.to_owned(),
        headers: Parameters::new(),
    })
}

/// Frame decoder over a byte stream
pub struct FrameReader<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
    buffered: bool,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader; unbuffered readers never read past the current frame
    pub fn new(inner: R, buffered: bool) -> Self {
        Self {
            inner,
            buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            len: 0,
            buffered,
        }
    }

    /// Switch read-ahead on or off
    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    /// True if no read-ahead bytes are pending
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pos == self.len
    }

    /// Borrow the underlying stream
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the underlying stream
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    fn fill(&mut self) -> io::Result<usize> {
        if self.pos < self.len {
            return Ok(self.len - self.pos);
        }

        let want = if self.buffered { self.buf.len() } else { 1 };
        loop {
            match self.inner.read(&mut self.buf[..want]) {
                Ok(n) => {
                    self.pos = 0;
                    self.len = n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = Vec::new();
        loop {
            if self.fill()? == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }

            let available = &self.buf[self.pos..self.len];
            match available.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    line.extend_from_slice(&available[..end]);
                    self.pos += end + 1;
                    break;
                }
                None => {
                    line.extend_from_slice(available);
                    self.pos = self.len;
                }
            }

            if line.len() > MAX_LINE_LEN {
                return Err(Error::protocol("line too long"));
            }
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > MAX_LINE_LEN {
            return Err(Error::protocol("line too long"));
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| Error::protocol("line is not UTF-8"))
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed frames and a network error for
    /// I/O failures, including a stream that ends inside a frame.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        let line = loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
            }
        };

        let mut frame = parse_command_line(&line)?;
        loop {
            let header = self
                .read_line()?
                .ok_or_else(|| Error::from(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
            if header.is_empty() {
                break;
            }
            if frame.headers.len() >= MAX_HEADERS {
                return Err(Error::protocol("too many header lines"));
            }

            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| Error::protocol("header line without separator"))?;
            // Only the separator's own space is dropped from the value
            let value = value.strip_prefix(' ').unwrap_or(value);
            frame
                .headers
                .insert(name.trim().to_owned(), value.to_owned());
        }

        Ok(Some(frame))
    }

    /// Read exactly `buf.len()` raw bytes
    ///
    /// # Errors
    ///
    /// Returns a network error if the stream ends first.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos == self.len && !self.buffered {
                self.inner.read_exact(&mut buf[filled..])?;
                return Ok(());
            }
            if self.fill()? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let n = (self.len - self.pos).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    /// Read a raw payload of declared `size`
    ///
    /// # Errors
    ///
    /// Returns a protocol error if `size` exceeds [`MAX_PAYLOAD`].
    pub fn read_payload(&mut self, size: usize) -> Result<Vec<u8>> {
        if size > MAX_PAYLOAD {
            return Err(Error::protocol("payload too large"));
        }
        let mut payload = vec![0u8; size];
        self.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read and drop a raw payload of declared `size`
    ///
    /// # Errors
    ///
    /// Returns a protocol error if `size` exceeds [`MAX_PAYLOAD`].
    pub fn discard(&mut self, size: usize) -> Result<()> {
        if size > MAX_PAYLOAD {
            return Err(Error::protocol("payload too large"));
        }
        let mut scratch = [0u8; 4096];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(scratch.len());
            self.read_exact(&mut scratch[..n])?;
            remaining -= n;
        }
        Ok(())
    }
}

/// Frame encoder over a byte stream
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a stream
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Mutably borrow the underlying stream
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the writer
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write one frame and flush
    ///
    /// # Errors
    ///
    /// Returns a network error if the write fails.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.inner.write_all(&frame.encode())?;
        self.inner.flush()?;
        Ok(())
    }

    /// Write one frame immediately followed by its raw payload, and flush
    ///
    /// # Errors
    ///
    /// Returns a network error if the write fails.
    pub fn write_frame_with_payload(&mut self, frame: &Frame, payload: &[u8]) -> Result<()> {
        let mut out = frame.encode();
        out.extend_from_slice(payload);
        self.inner.write_all(&out)?;
        self.inner.flush()?;
        Ok(())
    }
}
