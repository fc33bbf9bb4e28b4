//! Inter-process telegram queues
//!
//! The bus driver and the protocol engine exchange whole telegrams through
//! two named, bounded message queues: `/ems_bus_rx` (driver to engine) and
//! `/ems_bus_tx` (engine to driver). The queues are created by the driver;
//! the engine only opens them.
//!
//! All queue operations are blocking. The transport runs them on the
//! runtime's blocking pool.
//!
//! ## Backends
//!
//! - [`posix`]: POSIX message queues (Linux), used against a real driver
//! - [`memory`]: in-process queues, used by tests and by embedders running
//!   the driver inside the same process

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EmsResult;

/// Default inbound queue name
pub const RX_QUEUE_NAME: &str = "/ems_bus_rx";

/// Default outbound queue name
pub const TX_QUEUE_NAME: &str = "/ems_bus_tx";

/// Default queue capacity in messages
pub const QUEUE_CAPACITY: usize = 10;

/// Which end of a queue is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    /// Engine reads (inbound)
    Receive,
    /// Engine writes (outbound)
    Send,
}

/// One opened message queue
pub trait MessageQueue: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Wait up to `timeout` for a message
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn receive(&self, timeout: Duration) -> EmsResult<Option<Vec<u8>>>;

    /// Take a message if one is queued
    fn try_receive(&self) -> EmsResult<Option<Vec<u8>>>;

    /// Queue a message, blocking while the queue is full
    fn send(&self, frame: &[u8]) -> EmsResult<()>;

    /// Number of queued messages
    fn len(&self) -> EmsResult<usize>;

    /// Maximum number of queued messages
    fn capacity(&self) -> usize;

    fn is_empty(&self) -> EmsResult<bool> {
        Ok(self.len()? == 0)
    }

    fn is_full(&self) -> EmsResult<bool> {
        Ok(self.len()? >= self.capacity())
    }
}

/// Opens queues by name
pub trait QueueConnector: Send + Sync + fmt::Debug {
    /// Open an existing queue
    ///
    /// Fails with `EmsError::Connection` while the queue does not exist yet.
    fn open(
        &self,
        name: &str,
        direction: QueueDirection,
        capacity: usize,
        max_size: usize,
    ) -> EmsResult<Arc<dyn MessageQueue>>;
}

/// POSIX message queue backend
#[cfg(target_os = "linux")]
pub mod posix {
    use std::fmt;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    use posixmq::{OpenOptions, PosixMq};
    use tracing::debug;

    use super::{MessageQueue, QueueConnector, QueueDirection};
    use crate::error::{EmsError, EmsResult};

    /// Connector for queues created by an external bus driver
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PosixConnector;

    impl QueueConnector for PosixConnector {
        fn open(
            &self,
            name: &str,
            direction: QueueDirection,
            capacity: usize,
            max_size: usize,
        ) -> EmsResult<Arc<dyn MessageQueue>> {
            Ok(Arc::new(PosixQueue::open(name, direction, capacity, max_size)?))
        }
    }

    /// Opened POSIX message queue
    ///
    /// The descriptor is closed when the queue is dropped.
    pub struct PosixQueue {
        mq: PosixMq,
        name: String,
        capacity: usize,
        message_size: usize,
    }

    impl fmt::Debug for PosixQueue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("PosixQueue")
                .field("name", &self.name)
                .field("capacity", &self.capacity)
                .field("message_size", &self.message_size)
                .finish()
        }
    }

    impl PosixQueue {
        /// Open an existing queue without creating it
        pub fn open(
            name: &str,
            direction: QueueDirection,
            capacity: usize,
            max_size: usize,
        ) -> EmsResult<Self> {
            if name.contains('\0') {
                return Err(EmsError::configuration(format!("Invalid queue name {:?}", name)));
            }
            let options = match direction {
                QueueDirection::Receive => OpenOptions::readonly(),
                QueueDirection::Send => OpenOptions::writeonly(),
            };
            let mq = options
                .open(name)
                .map_err(|e| EmsError::connection(format!("Cannot open queue {}: {}", name, e)))?;

            let attributes = mq
                .attributes()
                .map_err(|e| EmsError::io(format!("Cannot query queue {}: {}", name, e)))?;
            if attributes.capacity != capacity || attributes.max_msg_len != max_size {
                debug!(
                    "Queue {} has {} x {} bytes, expected {} x {} bytes",
                    name, attributes.capacity, attributes.max_msg_len, capacity, max_size
                );
            }
            Ok(Self {
                mq,
                name: name.to_string(),
                capacity: attributes.capacity,
                message_size: attributes.max_msg_len,
            })
        }

        fn timed_receive(&self, timeout: Duration) -> EmsResult<Option<Vec<u8>>> {
            let mut buf = vec![0u8; self.message_size.max(1)];
            match self.mq.recv_timeout(&mut buf, timeout) {
                Ok((_priority, received)) => {
                    buf.truncate(received);
                    Ok(Some(buf))
                }
                Err(e) => match e.kind() {
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                    _ => Err(EmsError::io(format!("Receive on {} failed: {}", self.name, e))),
                },
            }
        }
    }

    impl MessageQueue for PosixQueue {
        fn name(&self) -> &str {
            &self.name
        }

        fn receive(&self, timeout: Duration) -> EmsResult<Option<Vec<u8>>> {
            self.timed_receive(timeout)
        }

        fn try_receive(&self) -> EmsResult<Option<Vec<u8>>> {
            if self.len()? == 0 {
                return Ok(None);
            }
            self.timed_receive(Duration::ZERO)
        }

        fn send(&self, frame: &[u8]) -> EmsResult<()> {
            if frame.len() > self.message_size {
                return Err(EmsError::frame(format!(
                    "Frame of {} bytes exceeds queue message size {}",
                    frame.len(),
                    self.message_size
                )));
            }
            self.mq
                .send(0, frame)
                .map_err(|e| EmsError::io(format!("Send on {} failed: {}", self.name, e)))
        }

        fn len(&self) -> EmsResult<usize> {
            let attributes = self
                .mq
                .attributes()
                .map_err(|e| EmsError::io(format!("Cannot query queue {}: {}", self.name, e)))?;
            Ok(attributes.current_messages)
        }

        fn capacity(&self) -> usize {
            self.capacity
        }
    }

}

/// In-process queue backend
pub mod memory {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::{Condvar, Mutex};

    use super::{MessageQueue, QueueConnector, QueueDirection};
    use crate::error::{EmsError, EmsResult};

    /// Bounded in-process queue
    ///
    /// Once closed, every operation fails and blocked callers wake up.
    #[derive(Debug)]
    pub struct MemoryQueue {
        name: String,
        capacity: usize,
        max_size: usize,
        frames: Mutex<VecDeque<Vec<u8>>>,
        not_empty: Condvar,
        not_full: Condvar,
        closed: AtomicBool,
    }

    impl MemoryQueue {
        pub fn new(name: &str, capacity: usize, max_size: usize) -> Self {
            Self {
                name: name.to_string(),
                capacity: capacity.max(1),
                max_size,
                frames: Mutex::new(VecDeque::with_capacity(capacity)),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                closed: AtomicBool::new(false),
            }
        }

        /// Close the queue, as a restarting driver does
        pub fn close(&self) {
            let _frames = self.frames.lock();
            self.closed.store(true, Ordering::SeqCst);
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn check_open(&self) -> EmsResult<()> {
            if self.is_closed() {
                return Err(EmsError::io(format!("Queue {} is closed", self.name)));
            }
            Ok(())
        }

        /// Queued frames, oldest first, without removing them
        pub fn snapshot(&self) -> Vec<Vec<u8>> {
            self.frames.lock().iter().cloned().collect()
        }
    }

    impl MessageQueue for MemoryQueue {
        fn name(&self) -> &str {
            &self.name
        }

        fn receive(&self, timeout: Duration) -> EmsResult<Option<Vec<u8>>> {
            let deadline = Instant::now() + timeout;
            let mut frames = self.frames.lock();
            self.check_open()?;
            while frames.is_empty() {
                if self.not_empty.wait_until(&mut frames, deadline).timed_out() {
                    break;
                }
                self.check_open()?;
            }
            let frame = frames.pop_front();
            if frame.is_some() {
                self.not_full.notify_one();
            }
            Ok(frame)
        }

        fn try_receive(&self) -> EmsResult<Option<Vec<u8>>> {
            let mut frames = self.frames.lock();
            self.check_open()?;
            let frame = frames.pop_front();
            if frame.is_some() {
                self.not_full.notify_one();
            }
            Ok(frame)
        }

        fn send(&self, frame: &[u8]) -> EmsResult<()> {
            if frame.len() > self.max_size {
                return Err(EmsError::frame(format!(
                    "Frame of {} bytes exceeds queue message size {}",
                    frame.len(),
                    self.max_size
                )));
            }
            let mut frames = self.frames.lock();
            self.check_open()?;
            while frames.len() >= self.capacity {
                self.not_full.wait(&mut frames);
                self.check_open()?;
            }
            frames.push_back(frame.to_vec());
            self.not_empty.notify_one();
            Ok(())
        }

        fn len(&self) -> EmsResult<usize> {
            let frames = self.frames.lock();
            self.check_open()?;
            Ok(frames.len())
        }

        fn capacity(&self) -> usize {
            self.capacity
        }
    }

    /// Named in-process queues
    ///
    /// Plays the part of the operating system's queue namespace: the driver
    /// side creates queues, the engine opens them through
    /// [`QueueConnector`].
    #[derive(Debug, Default)]
    pub struct MemoryBroker {
        queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
        failing_opens: AtomicUsize,
        open_attempts: AtomicUsize,
    }

    impl MemoryBroker {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create (or return the existing) queue of this name
        pub fn create(&self, name: &str, capacity: usize, max_size: usize) -> Arc<MemoryQueue> {
            self.queues
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryQueue::new(name, capacity, max_size)))
                .clone()
        }

        pub fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
            self.queues.lock().get(name).cloned()
        }

        /// Remove a queue from the namespace
        pub fn unlink(&self, name: &str) -> bool {
            self.queues.lock().remove(name).is_some()
        }

        /// Unlink and close a queue; its openers see I/O errors from now on
        pub fn close(&self, name: &str) -> bool {
            match self.queues.lock().remove(name) {
                Some(queue) => {
                    queue.close();
                    true
                }
                None => false,
            }
        }

        /// Let the next `count` opens fail as if the queue did not exist
        pub fn fail_next_opens(&self, count: usize) {
            self.failing_opens.store(count, Ordering::SeqCst);
        }

        /// Number of open calls so far
        pub fn open_attempts(&self) -> usize {
            self.open_attempts.load(Ordering::SeqCst)
        }
    }

    impl QueueConnector for MemoryBroker {
        fn open(
            &self,
            name: &str,
            _direction: QueueDirection,
            _capacity: usize,
            _max_size: usize,
        ) -> EmsResult<Arc<dyn MessageQueue>> {
            self.open_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failing_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(EmsError::connection(format!("Queue {} not available", name)));
            }
            match self.queue(name) {
                Some(queue) => Ok(queue),
                None => Err(EmsError::connection(format!("Queue {} does not exist", name))),
            }
        }
    }

}
