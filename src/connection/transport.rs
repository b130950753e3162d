//! The duplex channel underneath a connection.

use crate::error::ConnectionError;
use crate::wire::{self, Frame};
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// A bidirectional frame channel to a broker.
///
/// `recv` is only ever called from the connection's delivery loop; `send`
/// may be called from any thread.
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to the broker.
    fn send(&self, frame: &Frame) -> Result<(), ConnectionError>;

    /// Block until the next frame arrives. `Ok(None)` means the peer hung up
    /// or the transport was shut down.
    fn recv(&self) -> Result<Option<Frame>, ConnectionError>;

    /// Tear the channel down, unblocking a pending `recv`.
    fn shutdown(&self) -> Result<(), ConnectionError>;
}

/// Frames arriving on a transport, as a lazy sequence.
///
/// Ends at the first clean hang-up or transport fault and stays ended. The
/// fault, if any, is kept for [`Incoming::fault`].
pub struct Incoming {
    transport: Arc<dyn Transport>,
    fault: Option<ConnectionError>,
    done: bool,
}

impl Incoming {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            fault: None,
            done: false,
        }
    }

    /// The error that ended the sequence, if it did not end cleanly.
    pub fn fault(&self) -> Option<&ConnectionError> {
        self.fault.as_ref()
    }

    pub fn into_fault(self) -> Option<ConnectionError> {
        self.fault
    }
}

impl Iterator for Incoming {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        match self.transport.recv() {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.fault = Some(e);
                None
            }
        }
    }
}

impl std::iter::FusedIterator for Incoming {}

/// Framed transport over a TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    max_frame_bytes: usize,
}

impl TcpTransport {
    /// Resolve `endpoint` (`host:port`) and connect to the first address
    /// that accepts within `timeout`.
    pub fn connect(
        endpoint: &str,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, ConnectionError> {
        let addrs = endpoint
            .to_socket_addrs()
            .map_err(|e| ConnectionError::Resolve(format!("{}: {}", endpoint, e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream, max_frame_bytes),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => ConnectionError::Io(e),
            None => ConnectionError::Resolve(format!("{}: no addresses", endpoint)),
        })
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, max_frame_bytes: usize) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);

        Ok(Self {
            stream,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_bytes,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: &Frame) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock();
        wire::write_frame(&mut *writer, frame, self.max_frame_bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn recv(&self) -> Result<Option<Frame>, ConnectionError> {
        let mut reader = self.reader.lock();
        wire::read_frame(&mut *reader, self.max_frame_bytes)
    }

    fn shutdown(&self) -> Result<(), ConnectionError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
