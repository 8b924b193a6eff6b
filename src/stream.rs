//! The byte stream handed to handlers, and the one-shot producer that creates it (§4.5 step 6).

use crate::error::{Result, VNetError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;

struct NotifierInner {
    notify: tokio::sync::Notify,
    closed: AtomicBool,
}

/// Shared close state for one accepted connection.
///
/// Fires exactly once, whichever side closes first: the handler (via [`VNetStream::close`] /
/// drop) or the supervisor (via [`CloseNotifier::force_close`], on peer hang-up, transport error,
/// or shutdown). Both sides observe the same `closed` latch, so a stream read/write after either
/// side has closed fails rather than blocking forever.
#[derive(Clone)]
pub struct CloseNotifier(Arc<NotifierInner>);

impl CloseNotifier {
    pub(crate) fn new() -> Self {
        Self(Arc::new(NotifierInner {
            notify: tokio::sync::Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Resolves once this connection has closed, from either side.
    pub async fn notified(&self) {
        if self.is_closed() {
            return;
        }
        self.0.notify.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Marks the connection closed and wakes every waiter. Idempotent.
    pub fn force_close(&self) {
        if !self.0.closed.swap(true, Ordering::SeqCst) {
            self.0.notify.notify_waiters();
        }
    }
}

/// A full-duplex byte stream for one accepted TCP connection, wrapping a channel bridge to the
/// network stack façade's socket. Read/write go through bounded channels rather than a shared
/// buffer, mirroring how the teacher's own device adapter crosses the async/sans-IO boundary.
pub struct VNetStream {
    local: SocketAddr,
    peer: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    tx: PollSender<Bytes>,
    read_buf: Bytes,
    close_notifier: CloseNotifier,
}

impl VNetStream {
    pub(crate) fn new(
        local: SocketAddr,
        peer: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        close_notifier: CloseNotifier,
    ) -> Self {
        Self {
            local,
            peer,
            rx,
            tx: PollSender::new(tx),
            read_buf: Bytes::new(),
            close_notifier,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Idempotent close: fires the close-notifier exactly once, even across repeated calls or
    /// calls from the supervisor racing a handler-initiated close.
    pub fn close(&self) {
        self.close_notifier.force_close();
    }
}

impl Drop for VNetStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for VNetStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            let chunk = self.read_buf.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        if self.close_notifier.is_closed() {
            return Poll::Ready(Ok(())); // EOF
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // peer closed: EOF
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VNetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.close_notifier.is_closed() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        }

        // `poll_reserve` only wakes this task once the channel genuinely has capacity, unlike a
        // raw `try_send` loop that would have to re-wake itself on every `Full` and spin.
        let this = self.get_mut();
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let data = Bytes::copy_from_slice(buf);
                let len = data.len();
                match this.tx.send_item(data) {
                    Ok(()) => Poll::Ready(Ok(len)),
                    Err(_) => Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "connection closed",
                    ))),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

/// What a handler decided to do with an attempt, reported back to the acceptor.
pub(crate) enum Decision {
    /// The producer was called: finish the handshake and bridge data through these channels.
    Accept {
        /// Network (peer) -> handler.
        to_handler: mpsc::Sender<Bytes>,
        /// Handler -> network (peer).
        from_handler: mpsc::Receiver<Bytes>,
        close_notifier: CloseNotifier,
    },
    /// The handler returned without calling the producer, or the attempt guard fired: reset.
    Reject,
}

/// Enforces the "every attempt completes exactly once" contract (§4.5, Design Notes).
///
/// Owns the one-shot channel back to the acceptor. [`AttemptGuard::complete`] sends a decision at
/// most once; if the guard is dropped without ever completing (handler returned without producing,
/// handler panicked, or the attempt was cancelled mid-flight), its `Drop` impl sends [`Decision::Reject`]
/// so the in-flight budget never leaks a slot.
pub(crate) struct AttemptGuard {
    decision_tx: Option<oneshot::Sender<Decision>>,
}

impl AttemptGuard {
    pub(crate) fn new(decision_tx: oneshot::Sender<Decision>) -> Self {
        Self {
            decision_tx: Some(decision_tx),
        }
    }

    /// Sends `decision` if this guard has not already completed. Returns whether it did.
    pub(crate) fn complete(&mut self, decision: Decision) -> bool {
        match self.decision_tx.take() {
            Some(tx) => {
                let _ = tx.send(decision);
                true
            }
            None => false,
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.complete(Decision::Reject);
    }
}

/// A one-shot capability: calling it finalizes the TCP handshake and returns a stream. Calling it
/// twice fails; not calling it at all (handler returns, or is dropped) is a refusal, enforced by the
/// shared [`AttemptGuard`] this producer completes through.
pub struct StreamProducer {
    local: SocketAddr,
    peer: SocketAddr,
    guard: Arc<std::sync::Mutex<AttemptGuard>>,
}

impl StreamProducer {
    pub(crate) fn new(
        local: SocketAddr,
        peer: SocketAddr,
        guard: Arc<std::sync::Mutex<AttemptGuard>>,
    ) -> Self {
        Self { local, peer, guard }
    }

    /// Invokes the producer. Fails with [`VNetError::BadParameter`] if already called.
    pub async fn produce(&self) -> Result<(VNetStream, CloseNotifier)> {
        let (to_handler_tx, to_handler_rx) = mpsc::channel(256);
        let (from_handler_tx, from_handler_rx) = mpsc::channel(256);
        let close_notifier = CloseNotifier::new();

        let decision = Decision::Accept {
            to_handler: to_handler_tx,
            from_handler: from_handler_rx,
            close_notifier: close_notifier.clone(),
        };

        let sent = {
            // Never held across an await point: plain std mutex, briefly locked.
            let mut guard = self.guard.lock().unwrap();
            guard.complete(decision)
        };
        if !sent {
            return Err(VNetError::BadParameter(
                "stream producer already invoked".into(),
            ));
        }

        let stream = VNetStream::new(
            self.local,
            self.peer,
            to_handler_rx,
            from_handler_tx,
            close_notifier.clone(),
        );
        Ok((stream, close_notifier))
    }
}
