//! Length-framed message transport over one socket.
//!
//! `SocketStream` loops the short-read/short-write semantics of the
//! underlying socket until exactly the requested byte count moved,
//! using the byte buffer's scatter/gather views. `Session` layers the
//! 11-byte frame protocol on top; sends are serialized by a session
//! mutex, receives by the single receiver task per session.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;
use weft::Socket;
use weft::sync::TaskMutex;
use weft_codec::{ByteBuffer, Frame, FrameHeader, HEADER_LEN};

pub struct SocketStream {
    socket: Arc<Socket>,
}

impl SocketStream {
    pub fn new(socket: Arc<Socket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Read exactly `n` bytes into `buf` at its cursor.
    pub fn read_fixed(&self, buf: &mut ByteBuffer, n: u64) -> io::Result<()> {
        let mut remaining = n;
        while remaining > 0 {
            let iovs = buf.write_iovecs(remaining);
            let got = self.socket.recv_vectored(&iovs)?;
            if got == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
            }
            buf.advance(got as u64);
            remaining -= got as u64;
        }
        Ok(())
    }

    /// Write exactly `n` readable bytes from `buf` at its cursor.
    pub fn write_fixed(&self, buf: &mut ByteBuffer, n: u64) -> io::Result<()> {
        let mut remaining = n;
        while remaining > 0 {
            let iovs = buf.read_iovecs(remaining);
            let sent = self.socket.send_vectored(&iovs)?;
            if sent == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed"));
            }
            buf.advance(sent as u64);
            remaining -= sent as u64;
        }
        Ok(())
    }
}

/// A framed-message transport over one connection.
pub struct Session {
    stream: SocketStream,
    send_mutex: TaskMutex,
    connected: AtomicBool,
}

impl Session {
    pub fn new(socket: Arc<Socket>) -> Self {
        Self {
            stream: SocketStream::new(socket),
            send_mutex: TaskMutex::new(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        self.stream.socket()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.stream.socket().is_closed()
    }

    /// Read one frame: fixed header, magic check, fixed body.
    pub fn recv_frame(&self) -> io::Result<Frame> {
        let mut head_buf = ByteBuffer::new();
        self.stream.read_fixed(&mut head_buf, HEADER_LEN as u64)?;
        head_buf.set_position(0).expect("rewind header");
        let mut raw = [0u8; HEADER_LEN];
        head_buf.read(&mut raw).expect("header bytes committed");
        let header = FrameHeader::decode(&raw).map_err(io::Error::other)?;

        let mut body = Vec::new();
        if header.body_len > 0 {
            let mut body_buf = ByteBuffer::new();
            self.stream.read_fixed(&mut body_buf, u64::from(header.body_len))?;
            body_buf.set_position(0).expect("rewind body");
            body = body_buf.to_vec();
        }
        Ok(Frame::from_parts(header, body))
    }

    /// Serialize and write one frame; concurrent senders do not
    /// interleave.
    pub fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        let _guard = self.send_mutex.lock();
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session closed"));
        }
        let wire = frame.encode();
        let mut buf = ByteBuffer::from_bytes(&wire);
        self.stream.write_fixed(&mut buf, wire.len() as u64)
    }

    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("session close");
            self.stream.socket().close();
        }
    }
}
