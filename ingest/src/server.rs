//! Single-client ingest session over TCP.
//!
//! The listener accepts one shipper at a time. The session pulls frames
//! with a bounded idle timeout (non-fatal, surfaces as an empty batch),
//! acknowledges every completed window or compressed batch with the
//! highest consumed sequence number, and reports a clean EOF so the
//! orchestrator can leave its loop.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::event::LogEvent;
use crate::frame::{decode_batch, encode_ack, Frame, FrameError, FrameReader};

/// How long a read may sit idle before yielding an empty batch.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("frame decode: {0}")]
    Frame(FrameError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for IngestError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => IngestError::Io(io),
            other => IngestError::Frame(other),
        }
    }
}

/// One pull from the session.
#[derive(Debug)]
pub enum Batch {
    Events(Vec<LogEvent>),
    /// Idle timeout; nothing arrived. Not fatal.
    Timeout,
    /// The client closed the stream.
    Eof,
}

pub struct IngestListener {
    listener: TcpListener,
}

impl IngestListener {
    pub fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("ingest listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Block until a client connects, polling the shutdown flag. `None`
    /// when shutdown was requested before anyone connected.
    pub fn accept(&self, shutdown: &AtomicBool) -> std::io::Result<Option<Session>> {
        self.listener.set_nonblocking(true)?;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("ingest client connected from {peer}");
                    return Ok(Some(Session::new(stream, peer, IDLE_TIMEOUT)?));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct Session {
    reader: FrameReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
    window_size: u32,
    unacked: u32,
    last_seq: u32,
    eof: bool,
}

impl Session {
    pub fn new(stream: TcpStream, peer: SocketAddr, idle_timeout: Duration) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(idle_timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: FrameReader::new(stream),
            writer,
            peer,
            window_size: 1,
            unacked: 0,
            last_seq: 0,
            eof: false,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Pull the next batch. Returns when a window fills, a compressed
    /// batch completes, the stream goes idle, or the client hangs up.
    pub fn next_batch(&mut self) -> Result<Batch, IngestError> {
        if self.eof {
            return Ok(Batch::Eof);
        }
        let mut events = Vec::new();
        loop {
            match self.reader.read_frame() {
                Ok(None) => {
                    self.eof = true;
                    if events.is_empty() {
                        debug!("ingest client {} closed the stream", self.peer);
                        return Ok(Batch::Eof);
                    }
                    // Tail events before the close still count.
                    return Ok(Batch::Events(events));
                }
                Err(FrameError::IdleTimeout) => {
                    if events.is_empty() {
                        return Ok(Batch::Timeout);
                    }
                    // Flush a partial window on idle, acking what was
                    // actually observed.
                    self.send_ack()?;
                    return Ok(Batch::Events(events));
                }
                Ok(Some(frame)) => {
                    if self.consume(frame, &mut events)? {
                        return Ok(Batch::Events(events));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Apply one frame; `true` means the batch is complete.
    fn consume(&mut self, frame: Frame, events: &mut Vec<LogEvent>) -> Result<bool, IngestError> {
        match frame {
            Frame::WindowSize(size) => {
                self.window_size = size.max(1);
                debug!("ingest window size set to {}", self.window_size);
                Ok(false)
            }
            Frame::Data { seq, fields } => {
                self.note_event(seq);
                events.push(LogEvent::from_pairs(seq, fields));
                self.window_boundary()
            }
            Frame::Json { seq, value } => {
                self.note_event(seq);
                events.push(LogEvent::from_json(seq, value));
                self.window_boundary()
            }
            Frame::Compressed(payload) => {
                for inner in decode_batch(&payload)? {
                    match inner {
                        Frame::WindowSize(size) => self.window_size = size.max(1),
                        Frame::Data { seq, fields } => {
                            self.note_event(seq);
                            events.push(LogEvent::from_pairs(seq, fields));
                        }
                        Frame::Json { seq, value } => {
                            self.note_event(seq);
                            events.push(LogEvent::from_json(seq, value));
                        }
                        Frame::Ack(_) | Frame::Compressed(_) => {}
                    }
                }
                // A compressed payload is one shipper batch; ack it whole.
                self.send_ack()?;
                Ok(true)
            }
            Frame::Ack(seq) => {
                warn!("ingest client {} sent an unexpected ack ({seq})", self.peer);
                Ok(false)
            }
        }
    }

    fn note_event(&mut self, seq: u32) {
        self.last_seq = seq;
        self.unacked += 1;
    }

    fn window_boundary(&mut self) -> Result<bool, IngestError> {
        if self.unacked >= self.window_size {
            self.send_ack()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn send_ack(&mut self) -> Result<(), IngestError> {
        if self.unacked == 0 {
            return Ok(());
        }
        self.writer.write_all(&encode_ack(self.last_seq))?;
        debug!("acked sequence {}", self.last_seq);
        self.unacked = 0;
        Ok(())
    }

    /// Orderly shutdown of the transport.
    pub fn close(&mut self) {
        let _ = self.writer.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_compressed, encode_data, encode_window_size, PROTOCOL_VERSION};
    use std::io::Read;

    fn pair() -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let session = Session::new(server, peer, Duration::from_millis(200)).unwrap();
        (session, client)
    }

    fn read_ack(client: &mut TcpStream) -> u32 {
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], PROTOCOL_VERSION);
        assert_eq!(buf[1], b'A');
        u32::from_be_bytes(buf[2..6].try_into().unwrap())
    }

    #[test]
    fn window_of_events_is_acked_and_batched() {
        let (mut session, mut client) = pair();
        client.write_all(&encode_window_size(2)).unwrap();
        client
            .write_all(&encode_data(1, &[("ip", "10.0.0.1")]))
            .unwrap();
        client
            .write_all(&encode_data(2, &[("ip", "10.0.0.2")]))
            .unwrap();

        let Batch::Events(events) = session.next_batch().unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].fields["ip"], "10.0.0.2");
        assert_eq!(read_ack(&mut client), 2);
    }

    #[test]
    fn compressed_batch_is_acked_whole() {
        let (mut session, mut client) = pair();
        let mut inner = encode_data(10, &[("ip", "10.0.0.1")]);
        inner.extend_from_slice(&encode_data(11, &[("ip", "10.0.0.2")]));
        inner.extend_from_slice(&encode_data(12, &[("ip", "10.0.0.3")]));
        client.write_all(&encode_compressed(&inner)).unwrap();

        let Batch::Events(events) = session.next_batch().unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 3);
        assert_eq!(read_ack(&mut client), 12);
    }

    #[test]
    fn idle_stream_yields_timeout_not_error() {
        let (mut session, _client) = pair();
        assert!(matches!(session.next_batch().unwrap(), Batch::Timeout));
        // The session stays usable afterwards.
        assert!(matches!(session.next_batch().unwrap(), Batch::Timeout));
    }

    #[test]
    fn partial_window_is_flushed_on_idle_with_ack() {
        let (mut session, mut client) = pair();
        client.write_all(&encode_window_size(10)).unwrap();
        client
            .write_all(&encode_data(5, &[("ip", "10.0.0.5")]))
            .unwrap();

        let Batch::Events(events) = session.next_batch().unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(read_ack(&mut client), 5);
    }

    #[test]
    fn closed_connection_is_eof() {
        let (mut session, client) = pair();
        drop(client);
        assert!(matches!(session.next_batch().unwrap(), Batch::Eof));
        assert!(matches!(session.next_batch().unwrap(), Batch::Eof));
    }

    #[test]
    fn tail_events_before_close_are_delivered() {
        let (mut session, mut client) = pair();
        client.write_all(&encode_window_size(10)).unwrap();
        client
            .write_all(&encode_data(3, &[("ip", "10.0.0.3")]))
            .unwrap();
        client.flush().unwrap();
        drop(client);

        let Batch::Events(events) = session.next_batch().unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 1);
        assert!(matches!(session.next_batch().unwrap(), Batch::Eof));
    }

    #[test]
    fn listener_accept_honours_shutdown() {
        let listener = IngestListener::bind("127.0.0.1:0").unwrap();
        let shutdown = AtomicBool::new(true);
        assert!(listener.accept(&shutdown).unwrap().is_none());
    }
}
