//! The in-process `smoltcp::phy::Device` bridging the stack façade to the packet forwarder (§4.3).
//!
//! Frames arrive via [`LinkDevice::enqueue`] (pushed by the forwarder, or re-injected by the
//! acceptor after a handler decision) and leave via `tx_queue`, a bounded channel the forwarder
//! drains to write back through the TUN. No shared buffer crosses the async/sans-IO boundary;
//! everything is a whole owned frame, matching the teacher's own device adapter.

use crate::constants::{TX_ARENA_SIZE, TX_POOL_CAPACITY, TX_POOL_MAX_SIZE, TX_POOL_RECYCLE_THRESHOLD};
use bytes::{Bytes, BytesMut};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::warn;

/// A channel-backed [`Device`]: inbound frames are pulled from an internal queue the forwarder
/// feeds; outbound frames are handed to `tx_queue` for the forwarder to write to the TUN.
pub struct LinkDevice {
    pending: VecDeque<BytesMut>,
    tx_queue: mpsc::Sender<Bytes>,
    mtu: usize,
    medium: Medium,
    tx_pool: Vec<BytesMut>,
}

impl LinkDevice {
    pub fn new(tx_queue: mpsc::Sender<Bytes>, mtu: usize, medium: Medium) -> Self {
        Self {
            pending: VecDeque::new(),
            tx_queue,
            mtu,
            medium,
            tx_pool: Vec::with_capacity(TX_POOL_CAPACITY),
        }
    }

    /// Queues a frame for smoltcp to consume on its next `poll`. Used both for frames freshly
    /// read off the TUN and for SYNs the acceptor is re-injecting after a handler decision.
    pub fn enqueue(&mut self, frame: BytesMut) {
        self.pending.push_back(frame);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queues a frame directly onto the outbound channel the forwarder drains, bypassing
    /// smoltcp entirely. Used for the TCP resets the acceptor synthesizes (§4.5 step 3/5): there
    /// is no socket to transmit through since the SYN was intercepted before smoltcp ever saw it.
    pub fn queue_direct(&self, frame: Bytes) {
        if let Err(e) = self.tx_queue.try_send(frame) {
            warn!("link device transmit queue full or closed: {e}");
        }
    }
}

impl Device for LinkDevice {
    type RxToken<'a> = RxTokenImpl;
    type TxToken<'a> = TxTokenImpl<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buffer = self.pending.pop_front()?;
        Some((RxTokenImpl(buffer), TxTokenImpl(self)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxTokenImpl(self))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = self.medium;
        caps
    }
}

pub struct RxTokenImpl(BytesMut);

impl RxToken for RxTokenImpl {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

pub struct TxTokenImpl<'a>(&'a mut LinkDevice);

impl<'a> TxToken for TxTokenImpl<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self
            .0
            .tx_pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(TX_ARENA_SIZE));
        if buffer.capacity() < len {
            buffer = BytesMut::with_capacity(len);
        }

        // Safety: `f` fully initializes the first `len` bytes before returning.
        unsafe { buffer.set_len(len) };
        let result = f(&mut buffer);

        let packet = buffer.split_to(len).freeze();
        if buffer.capacity() > TX_POOL_RECYCLE_THRESHOLD && self.0.tx_pool.len() < TX_POOL_MAX_SIZE
        {
            self.0.tx_pool.push(buffer);
        }

        if let Err(e) = self.0.tx_queue.try_send(packet) {
            warn!("link device transmit queue full or closed: {e}");
        }

        result
    }
}
