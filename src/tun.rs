//! The TUN adapter capability (§4.1).
//!
//! The manager never assumes a specific OS device; anything implementing [`TunDevice`] can back
//! the packet forwarder. Production code wires up [`TunRsDevice`]; tests use [`ChannelTun`], which
//! never touches the OS.

use async_trait::async_trait;
use std::io;

/// A packet-oriented device capable of batched reads and writes of whole L3 frames.
///
/// Every buffer handed to [`TunDevice::read_batch`] or [`TunDevice::write_batch`] carries a frame
/// starting at `HEADER_RESERVE` bytes into the buffer, to make room for any device-specific prefix
/// (see [`crate::constants::HEADER_RESERVE`]).
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Reads up to `bufs.len()` frames. Returns the number of buffers populated; `lens[i]` holds
    /// the length of the frame written into `bufs[i]` starting at `offset`.
    async fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        lens: &mut [usize],
        offset: usize,
    ) -> io::Result<usize>;

    /// Writes each of `bufs[i][offsets[i]..offsets[i] + lens[i]]` as a whole frame.
    /// Returns the number of frames written.
    async fn write_batch(&self, bufs: &[(Vec<u8>, usize, usize)]) -> io::Result<usize>;

    /// Preferred number of frames to request per [`TunDevice::read_batch`] call.
    fn batch_size(&self) -> usize;

    /// Idempotently releases OS resources. Any read or write in progress must unblock with an
    /// error once this returns.
    async fn close(&self);
}

/// A [`TunDevice`] backed by an OS TUN character device via `tun-rs`.
///
/// Opening, naming, and addressing the interface is out of scope for this crate (§1); callers
/// construct the underlying `tun_rs::AsyncDevice` themselves (e.g. via `tun_rs::DeviceBuilder`)
/// and hand it to [`TunRsDevice::new`].
pub struct TunRsDevice {
    inner: std::sync::Arc<tun_rs::AsyncDevice>,
    batch_size: usize,
    closed: std::sync::atomic::AtomicBool,
}

impl TunRsDevice {
    pub fn new(inner: std::sync::Arc<tun_rs::AsyncDevice>, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TunDevice for TunRsDevice {
    async fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        lens: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun device closed"));
        }

        let mut count = 0;
        for (buf, len) in bufs.iter_mut().zip(lens.iter_mut()) {
            match self.inner.recv(&mut buf[offset..]).await {
                Ok(n) => {
                    *len = n;
                    count += 1;
                }
                Err(e) => {
                    if count > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    async fn write_batch(&self, bufs: &[(Vec<u8>, usize, usize)]) -> io::Result<usize> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun device closed"));
        }

        let mut count = 0;
        for (buf, offset, len) in bufs {
            self.inner.send(&buf[*offset..*offset + *len]).await?;
            count += 1;
        }
        Ok(count)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        // tun_rs::AsyncDevice has no explicit close; dropping the last Arc releases the fd.
        // Marking `closed` makes in-flight reads/writes observe an error on their next poll.
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use tokio::sync::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// An in-memory [`TunDevice`] driven by two queues, for tests that never touch the OS.
    pub struct ChannelTun {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        outbound: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
        notify: tokio::sync::Notify,
        closed: AtomicBool,
        batch_size: usize,
    }

    impl ChannelTun {
        pub fn new(batch_size: usize) -> (Self, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            (
                Self {
                    inbound: Mutex::new(VecDeque::new()),
                    outbound: tx,
                    notify: tokio::sync::Notify::new(),
                    closed: AtomicBool::new(false),
                    batch_size,
                },
                rx,
            )
        }

        /// Queue a raw L3 frame (no header reserve) to be delivered on the next read.
        pub async fn inject(&self, frame: Vec<u8>) {
            self.inbound.lock().await.push_back(frame);
            self.notify.notify_one();
        }
    }

    #[async_trait]
    impl TunDevice for ChannelTun {
        async fn read_batch(
            &self,
            bufs: &mut [Vec<u8>],
            lens: &mut [usize],
            offset: usize,
        ) -> io::Result<usize> {
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"));
                }

                let mut queue = self.inbound.lock().await;
                if queue.is_empty() {
                    drop(queue);
                    self.notify.notified().await;
                    continue;
                }

                let mut count = 0;
                for (buf, len) in bufs.iter_mut().zip(lens.iter_mut()) {
                    let Some(frame) = queue.pop_front() else {
                        break;
                    };
                    buf[offset..offset + frame.len()].copy_from_slice(&frame);
                    *len = frame.len();
                    count += 1;
                }
                return Ok(count);
            }
        }

        async fn write_batch(&self, bufs: &[(Vec<u8>, usize, usize)]) -> io::Result<usize> {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"));
            }
            let mut count = 0;
            for (buf, offset, len) in bufs {
                let frame = buf[*offset..*offset + *len].to_vec();
                if self.outbound.send(frame).is_err() {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"));
                }
                count += 1;
            }
            Ok(count)
        }

        fn batch_size(&self) -> usize {
            self.batch_size
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
            self.notify.notify_waiters();
        }
    }
}
