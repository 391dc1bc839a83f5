//! Frame codec
//!
//! Turns the raw byte stream of a connection into NUL-delimited command
//! frames and serializes outgoing commands, including the write-lock shadow
//! buffer used while a connection authenticates.
//!
//! Wire format: `verb:field1:field2...` followed by a terminator. The first
//! command on a fresh connection ends with a bare NUL; every later command
//! ends with CR LF NUL.

use tracing::trace;

/// Frame delimiter
const NUL: u8 = 0;

/// Terminator of the first command on a connection
const FIRST_TERMINATOR: &[u8] = b"\x00";

/// Terminator of every later command
const TERMINATOR: &[u8] = b"\r\n\x00";

/// Reassembles frames from arbitrarily chunked input
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every frame completed by them
    ///
    /// Trailing CR/LF is stripped from each frame. A partial frame stays
    /// buffered until a later feed completes it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == NUL) {
            let end = start + offset;
            let text = String::from_utf8_lossy(&self.buf[start..end]);
            frames.push(text.trim_end_matches(['\r', '\n']).to_string());
            start = end + 1;
        }
        self.buf.drain(..start);

        if !frames.is_empty() {
            trace!(frames = frames.len(), residual = self.buf.len(), "Decoded frames");
        }
        frames
    }

    /// Bytes of an incomplete frame still waiting for their delimiter
    pub fn residual(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// A decoded command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub verb: String,
    pub args: Vec<String>,
}

impl Frame {
    /// Split a frame on colons: text before the first colon is the verb
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split(':');
        let verb = parts.next().unwrap_or_default().to_string();
        let args = parts.map(str::to_string).collect();
        Self { verb, args }
    }

    /// Argument at `index`, or an empty string when the frame is short
    pub fn arg(&self, index: usize) -> &str {
        self.args.get(index).map(String::as_str).unwrap_or("")
    }

    /// Re-join the arguments from `from` onwards
    ///
    /// Message bodies may contain colons, so consumers take the trailing
    /// slice instead of trusting the split.
    pub fn rest(&self, from: usize) -> String {
        self.args.get(from..).map(|s| s.join(":")).unwrap_or_default()
    }

    /// Verb followed by the arguments
    pub fn fields(&self) -> Vec<String> {
        std::iter::once(self.verb.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Serialize one command
pub fn encode_command<S: AsRef<str>>(fields: &[S], first: bool) -> Vec<u8> {
    let body = fields
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(":");
    let terminator = if first { FIRST_TERMINATOR } else { TERMINATOR };
    let mut out = Vec::with_capacity(body.len() + terminator.len());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(terminator);
    out
}

/// Outbound half of a connection
///
/// While locked, encoded commands accumulate in a shadow buffer; unlocking
/// appends the shadow buffer to the socket buffer in order.
#[derive(Debug)]
pub struct Wire {
    write_buf: Vec<u8>,
    lock_buf: Vec<u8>,
    locked: bool,
    first_command: bool,
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

impl Wire {
    pub fn new() -> Self {
        Self {
            write_buf: Vec::new(),
            lock_buf: Vec::new(),
            locked: false,
            first_command: true,
        }
    }

    /// Forget everything queued for the previous socket
    pub fn reset(&mut self) {
        self.write_buf.clear();
        self.lock_buf.clear();
        self.locked = false;
        self.first_command = true;
    }

    /// Encode and queue a command
    pub fn send_command<S: AsRef<str>>(&mut self, fields: &[S]) {
        let bytes = encode_command(fields, self.first_command);
        self.first_command = false;
        self.write(&bytes);
    }

    fn write(&mut self, bytes: &[u8]) {
        if self.locked {
            self.lock_buf.extend_from_slice(bytes);
        } else {
            self.write_buf.extend_from_slice(bytes);
        }
    }

    pub fn set_write_lock(&mut self, lock: bool) {
        self.locked = lock;
        if !lock {
            let shadow = std::mem::take(&mut self.lock_buf);
            self.write_buf.extend_from_slice(&shadow);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Bytes ready for the socket
    pub fn outgoing(&self) -> &[u8] {
        &self.write_buf
    }

    /// Drop `n` bytes the socket accepted; the remainder stays queued
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.write_buf.len());
        self.write_buf.drain(..n);
    }

    /// Bytes held back by the write lock
    pub fn shadowed(&self) -> &[u8] {
        &self.lock_buf
    }
}
