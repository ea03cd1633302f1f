use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("link to peer is closed")]
    Disconnected,
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Reliable, ordered byte channel to a single peer. Connection setup and
/// retransmission live below this trait.
pub trait PacketLink: Send {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
    fn is_connected(&self) -> bool;
}

#[derive(Default)]
struct LoopbackQueue {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
    total_bytes: usize,
}

/// One end of an in-process link pair. Frames arrive in send order.
pub struct LoopbackLink {
    outgoing: Arc<Mutex<LoopbackQueue>>,
    incoming: Arc<Mutex<LoopbackQueue>>,
}

impl LoopbackLink {
    pub fn pair() -> (LoopbackLink, LoopbackLink) {
        let a_to_b = Arc::new(Mutex::new(LoopbackQueue::default()));
        let b_to_a = Arc::new(Mutex::new(LoopbackQueue::default()));
        (
            LoopbackLink {
                outgoing: Arc::clone(&a_to_b),
                incoming: Arc::clone(&b_to_a),
            },
            LoopbackLink {
                outgoing: b_to_a,
                incoming: a_to_b,
            },
        )
    }

    /// Closes both directions. The peer drains what was already sent, then
    /// sees [`TransportError::Disconnected`].
    pub fn close(&self) {
        self.outgoing.lock().closed = true;
        self.incoming.lock().closed = true;
    }

    pub fn pending_depth(&self) -> usize {
        self.incoming.lock().frames.len()
    }

    pub fn bytes_sent(&self) -> usize {
        self.outgoing.lock().total_bytes
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl PacketLink for LoopbackLink {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut queue = self.outgoing.lock();
        if queue.closed {
            return Err(TransportError::Disconnected);
        }
        queue.total_bytes += bytes.len();
        queue.frames.push_back(bytes);
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut queue = self.incoming.lock();
        match queue.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if queue.closed => Err(TransportError::Disconnected),
            None => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        !self.outgoing.lock().closed
    }
}
