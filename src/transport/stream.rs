//! Length-prefixed JSON over a byte stream.
//!
//! Each frame is a **4-byte length prefix** (`u32`, native endianness)
//! followed by that many bytes of UTF-8 JSON. This lets an embedded tool run
//! as a child process and talk to its host over stdin/stdout.
//!
//! Never log to stdout in a tool using [`stdio`]: stdout carries the frames.

use std::io::{self, Read, Write};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Incoming, Transport};
use crate::envelope::ProtocolViolation;
use crate::error::TransportError;

/// Read the 4-byte length prefix, or `None` on EOF before the first byte.
fn read_len_prefix<R: Read>(r: &mut R) -> io::Result<Option<u32>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match r.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a length prefix",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(u32::from_ne_bytes(len_buf)))
}

/// Encode a JSON value into one frame: 4-byte native-endian length + JSON bytes.
pub fn encode_frame(message: &Value, max_len: usize) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(message)?;
    if json.len() > max_len || json.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            len: json.len(),
            max: max_len,
        });
    }
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&(json.len() as u32).to_ne_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decode a single frame body. A clean EOF at a frame boundary yields `None`.
pub fn decode_frame<R: Read>(reader: &mut R, max_len: usize) -> io::Result<Option<String>> {
    let len = match read_len_prefix(&mut *reader)? {
        Some(len) => len as usize,
        None => return Ok(None),
    };
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("incoming frame of {len} bytes exceeds limit of {max_len} bytes"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Outbound half of a stream transport. Frames are queued to a blocking
/// writer so `send` never waits on the pipe.
pub struct StreamSender {
    queue: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    max_len: usize,
}

impl Transport for StreamSender {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        let frame = encode_frame(&message, self.max_len)?;
        match self.queue.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.queue.lock().take();
    }
}

pub struct StreamTransport;

impl StreamTransport {
    /// Start a blocking reader and a blocking writer on tokio's blocking pool.
    ///
    /// The returned [`Incoming`] ends when the reader hits EOF or an I/O
    /// error. Frames whose body is not JSON are logged and skipped.
    pub fn spawn<R, W>(reader: R, writer: W, max_len: usize) -> (StreamSender, Incoming)
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::task::spawn_blocking(move || read_loop(reader, in_tx, max_len));
        tokio::task::spawn_blocking(move || write_loop(writer, out_rx));

        let sender = StreamSender {
            queue: Mutex::new(Some(out_tx)),
            max_len,
        };
        (sender, in_rx)
    }
}

/// Stream transport over this process's stdin/stdout.
pub fn stdio(max_len: usize) -> (StreamSender, Incoming) {
    StreamTransport::spawn(io::stdin(), io::stdout(), max_len)
}

fn read_loop<R: Read>(mut reader: R, tx: mpsc::UnboundedSender<Value>, max_len: usize) {
    loop {
        let body = match decode_frame(&mut reader, max_len) {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!("stream transport reached EOF");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "stream transport read failed");
                return;
            }
        };
        let value: Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(e) => {
                let violation = ProtocolViolation {
                    reason: format!("invalid JSON frame: {e}"),
                };
                tracing::warn!(%violation, "dropping frame");
                continue;
            }
        };
        if tx.send(value).is_err() {
            return;
        }
    }
}

fn write_loop<W: Write>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&frame).and_then(|()| writer.flush()) {
            tracing::warn!(error = %e, "stream transport write failed");
            return;
        }
    }
}
