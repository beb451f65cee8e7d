//! Cipher-wrapped connection stream halves.
//!
//! Every connection starts out under the obfuscation cipher, which is keyed
//! from a public passphrase and only hides the handshake from trivial
//! fingerprinting. After authentication each half swaps to its session
//! cipher. The read half can also capture the raw bytes it receives so a
//! relay can replay them to another socket.

use crate::error::Result;
use crate::frame::{FrameReader, FrameWriter};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tether_crypto::{CipherKey, Digest, KEY_SIZE, KeyStream, Sha512};

const OBFUSCATION_PASSPHRASE: &[u8] = b"tether obfuscation layer";

/// Key of the obfuscation cipher, identical for every node
#[must_use]
pub fn obfuscation_key() -> CipherKey {
    let material = Sha512::digest(OBFUSCATION_PASSPHRASE);
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&material[..KEY_SIZE]);
    CipherKey::zero_iv(key)
}

/// Read half that decrypts everything it reads
pub struct CipherReader<R> {
    inner: R,
    cipher: Option<Box<dyn KeyStream>>,
    capture: Option<Vec<u8>>,
}

impl<R: Read> CipherReader<R> {
    /// Wrap a stream without any cipher
    pub fn plain(inner: R) -> Self {
        Self {
            inner,
            cipher: None,
            capture: None,
        }
    }

    /// Wrap a stream under `key`
    pub fn new(inner: R, key: &CipherKey) -> Self {
        let mut reader = Self::plain(inner);
        reader.set_cipher(key);
        reader
    }

    /// Replace the cipher; bytes read from now on use a fresh keystream
    pub fn set_cipher(&mut self, key: &CipherKey) {
        self.cipher = Some(Box::new(key.keystream()));
    }

    /// Start recording raw (still encrypted) bytes as they are read
    pub fn start_capture(&mut self) {
        self.capture = Some(Vec::new());
    }

    /// Stop recording and return what was captured
    pub fn take_capture(&mut self) -> Vec<u8> {
        self.capture.take().unwrap_or_default()
    }

    /// Borrow the underlying stream
    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(capture) = &mut self.capture {
            capture.extend_from_slice(&buf[..n]);
        }
        if let Some(cipher) = &mut self.cipher {
            cipher.apply_keystream(&mut buf[..n]);
        }
        Ok(n)
    }
}

/// Write half that encrypts everything it writes
pub struct CipherWriter<W> {
    inner: W,
    cipher: Option<Box<dyn KeyStream>>,
    scratch: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    /// Wrap a stream without any cipher
    pub fn plain(inner: W) -> Self {
        Self {
            inner,
            cipher: None,
            scratch: Vec::new(),
        }
    }

    /// Wrap a stream under `key`
    pub fn new(inner: W, key: &CipherKey) -> Self {
        let mut writer = Self::plain(inner);
        writer.set_cipher(key);
        writer
    }

    /// Replace the cipher; bytes written from now on use a fresh keystream
    pub fn set_cipher(&mut self, key: &CipherKey) {
        self.cipher = Some(Box::new(key.keystream()));
    }

    /// Borrow the underlying stream
    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    // The keystream advances as soon as bytes are encrypted, so a partial
    // write would desynchronize the stream: always write everything.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.cipher {
            Some(cipher) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(buf);
                cipher.apply_keystream(&mut self.scratch);
                self.inner.write_all(&self.scratch)?;
            }
            None => self.inner.write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Frame reader over a cipher-wrapped socket
pub type WireReader = FrameReader<CipherReader<TcpStream>>;

/// Frame writer over a cipher-wrapped socket
pub type WireWriter = FrameWriter<CipherWriter<TcpStream>>;

/// Both halves of one connection plus a control handle on the socket
pub struct Transport {
    /// Read half
    pub reader: WireReader,
    /// Write half
    pub writer: WireWriter,
    control: TcpStream,
    remote_addr: SocketAddr,
}

impl Transport {
    /// Split `stream` into obfuscated halves
    ///
    /// The read half starts unbuffered and captures its raw input, as
    /// required until the handshake decides the connection's fate.
    ///
    /// # Errors
    ///
    /// Returns a network error if the socket cannot be cloned.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let key = obfuscation_key();

        let mut read_half = CipherReader::new(stream.try_clone()?, &key);
        read_half.start_capture();
        let write_half = CipherWriter::new(stream.try_clone()?, &key);

        Ok(Self {
            reader: FrameReader::new(read_half, false),
            writer: FrameWriter::new(write_half),
            control: stream,
            remote_addr,
        })
    }

    /// Address of the remote end
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Clone of the underlying socket
    ///
    /// # Errors
    ///
    /// Returns a network error if the socket cannot be cloned.
    pub fn socket(&self) -> Result<TcpStream> {
        Ok(self.control.try_clone()?)
    }

    /// Bound (or unbound, with `None`) every blocking read
    ///
    /// # Errors
    ///
    /// Returns a network error if the option cannot be set.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.control.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Install the session ciphers and leave handshake mode
    pub fn install_session(&mut self, send: &CipherKey, receive: &CipherKey) {
        self.reader.get_mut().take_capture();
        self.reader.get_mut().set_cipher(receive);
        self.reader.set_buffered(true);
        self.writer.get_mut().set_cipher(send);
    }

    /// Shut the socket down in both directions
    pub fn shutdown(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }

    /// Split into read half, write half and control socket
    #[must_use]
    pub fn into_parts(self) -> (WireReader, WireWriter, TcpStream) {
        (self.reader, self.writer, self.control)
    }
}
