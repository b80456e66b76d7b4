//! Bounded single-producer/single-consumer queue between two processes
//!
//! A queue is a Unix stream socket pair. The producer end writes frames
//! (see [`crate::daemon::protocol`]) and reads acknowledgement bytes; the
//! consumer end reads frames and writes one acknowledgement byte per item it
//! takes out. The producer starts with `capacity` credits, spends one per
//! frame and blocks for an acknowledgement when it has none left, so the
//! queue never holds more than `capacity` items.
//!
//! Acknowledgements must never block either side. The producer collects
//! whatever has arrived before every `put`, and the consumer sends them
//! non-blocking, carrying any it could not send over to its next attempt.
//!
//! Both endpoints survive `fork`, which is how a stage process inherits them.

use crate::daemon::protocol::{split_frame, write_frame, FrameId};
use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use thiserror::Error;

/// Byte written by the consumer for every item it takes out
const ACK: u8 = 0x06;

/// Most acknowledgements moved by one socket call
const ACK_BATCH: usize = 256;

/// Read chunk size for the consumer's frame buffer
const READ_CHUNK: usize = 64 * 1024;

/// Shortest read timeout the socket accepts
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Errors raised by queue endpoints
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("queue peer disconnected")]
    Disconnected,

    #[error("queue stream corrupted: {0}")]
    Corrupt(String),

    #[error("queue I/O error: {0}")]
    Io(#[from] io::Error),
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Create a queue holding at most `capacity` items
pub fn bounded<T>(capacity: usize) -> Result<(QueueProducer<T>, QueueConsumer<T>), QueueError> {
    if capacity == 0 {
        return Err(QueueError::ZeroCapacity);
    }

    let (producer_stream, consumer_stream) = UnixStream::pair()?;

    let producer = QueueProducer {
        stream: producer_stream,
        capacity,
        credits: capacity,
        next_seq: 0,
        _item: PhantomData,
    };
    let consumer = QueueConsumer {
        stream: consumer_stream,
        buf: Vec::new(),
        expected_seq: 0,
        read_timeout: None,
        unsent_acks: 0,
        _item: PhantomData,
    };

    Ok((producer, consumer))
}

/// Writing end of a queue
pub struct QueueProducer<T> {
    stream: UnixStream,
    capacity: usize,
    /// Free slots known to the producer
    credits: usize,
    next_seq: FrameId,
    _item: PhantomData<fn(T)>,
}

impl<T: Serialize> QueueProducer<T> {
    /// Append an item, blocking while the queue is full
    ///
    /// Never drops an item: it either lands in the queue or an error is
    /// returned because the consumer is gone.
    pub fn put(&mut self, item: &T) -> Result<(), QueueError> {
        self.reclaim_credits()?;
        while self.credits == 0 {
            self.wait_for_ack()?;
        }

        write_frame(&mut self.stream, item, self.next_seq).map_err(|e| {
            if is_disconnect(&e) {
                QueueError::Disconnected
            } else {
                QueueError::Io(e)
            }
        })?;

        self.credits -= 1;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(())
    }

    /// Take every acknowledgement already received, without blocking
    fn reclaim_credits(&mut self) -> Result<(), QueueError> {
        let mut acks = [0u8; ACK_BATCH];
        loop {
            match recv(self.stream.as_raw_fd(), &mut acks, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => return Err(QueueError::Disconnected),
                Ok(n) => self.absorb_acks(&acks[..n])?,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => return Err(QueueError::Disconnected),
                Err(e) => return Err(QueueError::Io(e.into())),
            }
        }
    }

    fn absorb_acks(&mut self, acks: &[u8]) -> Result<(), QueueError> {
        if acks.iter().any(|&b| b != ACK) {
            return Err(QueueError::Corrupt("unexpected acknowledgement byte".into()));
        }
        self.credits = (self.credits + acks.len()).min(self.capacity);
        Ok(())
    }

    fn wait_for_ack(&mut self) -> Result<(), QueueError> {
        let mut acks = [0u8; ACK_BATCH];
        loop {
            match self.stream.read(&mut acks) {
                Ok(0) => return Err(QueueError::Disconnected),
                Ok(n) => return self.absorb_acks(&acks[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => return Err(QueueError::Disconnected),
                Err(e) => return Err(QueueError::Io(e)),
            }
        }
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Upper bound on items not yet acknowledged by the consumer
    pub fn in_flight(&self) -> usize {
        self.capacity - self.credits
    }
}

impl<T> AsRawFd for QueueProducer<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Reading end of a queue
pub struct QueueConsumer<T> {
    stream: UnixStream,
    /// Bytes received but not yet decoded into a whole frame
    buf: Vec<u8>,
    expected_seq: FrameId,
    read_timeout: Option<Duration>,
    /// Items taken whose acknowledgement has not reached the socket yet
    unsent_acks: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> QueueConsumer<T> {
    /// Take the oldest item, blocking until one exists
    pub fn get(&mut self) -> Result<T, QueueError> {
        loop {
            if let Some(item) = self.next(None)? {
                return Ok(item);
            }
        }
    }

    /// Take the oldest item, waiting roughly `timeout` for one to arrive
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub fn get_timeout(&mut self, timeout: Duration) -> Result<Option<T>, QueueError> {
        self.next(Some(timeout.max(MIN_WAIT)))
    }

    fn next(&mut self, timeout: Option<Duration>) -> Result<Option<T>, QueueError> {
        loop {
            if let Some(item) = self.take_buffered()? {
                return Ok(Some(item));
            }
            // The producer may be waiting on exactly these
            self.send_acks();

            if self.read_timeout != timeout {
                self.stream.set_read_timeout(timeout)?;
                self.read_timeout = timeout;
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(QueueError::Disconnected),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    if timeout.is_some() {
                        return Ok(None);
                    }
                }
                Err(e) if is_disconnect(&e) => return Err(QueueError::Disconnected),
                Err(e) => return Err(QueueError::Io(e)),
            }
        }
    }

    fn take_buffered(&mut self) -> Result<Option<T>, QueueError> {
        let Some((item, seq)) = split_frame::<T>(&mut self.buf)
            .map_err(|e| QueueError::Corrupt(e.to_string()))?
        else {
            return Ok(None);
        };

        if seq != self.expected_seq {
            return Err(QueueError::Corrupt(format!(
                "expected frame {} but received {}",
                self.expected_seq, seq
            )));
        }
        self.expected_seq = self.expected_seq.wrapping_add(1);

        self.unsent_acks += 1;
        self.send_acks();

        Ok(Some(item))
    }

    /// Free taken slots without ever blocking
    ///
    /// Whatever does not fit in the socket now stays counted and goes out on
    /// a later call. A vanished producer cannot use the slots, so its
    /// acknowledgements are dropped.
    fn send_acks(&mut self) {
        let acks = [ACK; ACK_BATCH];
        let flags = MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL;
        while self.unsent_acks > 0 {
            let n = self.unsent_acks.min(ACK_BATCH);
            match send(self.stream.as_raw_fd(), &acks[..n], flags) {
                Ok(0) => return,
                Ok(sent) => self.unsent_acks -= sent,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return,
                Err(_) => {
                    self.unsent_acks = 0;
                    return;
                }
            }
        }
    }
}

impl<T> AsRawFd for QueueConsumer<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(bounded::<u32>(0), Err(QueueError::ZeroCapacity)));
    }

    #[test]
    fn test_fifo_within_capacity() {
        let (mut tx, mut rx) = bounded::<String>(4).unwrap();
        for word in ["a", "b", "c"] {
            tx.put(&word.to_string()).unwrap();
        }
        assert_eq!(tx.in_flight(), 3);

        assert_eq!(rx.get().unwrap(), "a");
        assert_eq!(rx.get().unwrap(), "b");
        assert_eq!(rx.get().unwrap(), "c");
    }

    #[test]
    fn test_more_items_than_capacity() {
        let (mut tx, mut rx) = bounded::<u64>(3).unwrap();
        let producer = thread::spawn(move || {
            for i in 0..500u64 {
                tx.put(&i).unwrap();
            }
        });

        let received: Vec<u64> = (0..500).map(|_| rx.get().unwrap()).collect();
        producer.join().unwrap();

        assert_eq!(received, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let capacity = 2;
        let (mut tx, mut rx) = bounded::<u32>(capacity).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let producer = thread::spawn(move || {
            for i in 0..20u32 {
                tx.put(&i).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                assert!(tx.in_flight() <= capacity);
            }
        });

        for taken in 0..20usize {
            thread::sleep(Duration::from_millis(5));
            assert!(accepted.load(Ordering::SeqCst) <= taken + capacity);
            rx.get().unwrap();
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_get_timeout_when_empty() {
        let (_tx, mut rx) = bounded::<u32>(1).unwrap();
        let start = Instant::now();
        assert!(rx.get_timeout(Duration::from_millis(50)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_consumer_sees_remaining_items_then_disconnect() {
        let (mut tx, mut rx) = bounded::<u32>(4).unwrap();
        tx.put(&1).unwrap();
        tx.put(&2).unwrap();
        drop(tx);

        assert_eq!(rx.get().unwrap(), 1);
        assert_eq!(rx.get().unwrap(), 2);
        assert!(matches!(rx.get(), Err(QueueError::Disconnected)));
    }

    #[test]
    fn test_producer_unblocks_when_consumer_dropped() {
        let (mut tx, rx) = bounded::<u32>(1).unwrap();
        tx.put(&1).unwrap();

        let dropper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(rx);
        });

        assert!(matches!(tx.put(&2), Err(QueueError::Disconnected)));
        dropper.join().unwrap();
    }
}
