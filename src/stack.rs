//! Network stack façade (§4.3) and the TCP forwarder/acceptor orchestration (§4.5-4.6) built on
//! top of it.
//!
//! One task owns the smoltcp `Interface`/`SocketSet`/[`LinkDevice`] exclusively and drives them
//! from a single `tokio::select!` loop, mirroring the teacher's own event-driven stack runner.
//! Intercepted SYNs are handed off to the acceptor (§4.5) as independent tasks so a slow handler
//! never blocks the poll loop; their decision comes back over a channel and is applied on the
//! next loop iteration.

use crate::acceptor::run_attempt;
use crate::addr::{address_of, AddressAllocator};
use crate::constants::{
    KEEP_ALIVE_SECS, LINK_QUEUE_DEPTH, MAX_IN_FLIGHT_ATTEMPTS, MTU, NIC_ID, PACKET_CHANNEL_SIZE,
    STREAM_BUFFER_SIZE,
};
use crate::device::LinkDevice;
use crate::error::{Result, VNetError};
use crate::stream::{CloseNotifier, Decision};
use crate::supervisor::run_supervisor;
use crate::trap;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, SelectAll, StreamExt};
use rand::Rng;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::Medium;
use smoltcp::socket::tcp;
use smoltcp::time::{Duration as SmolDuration, Instant};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address};
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{self, Duration};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// A request to register a protocol address (§4.3), sent by [`AddressAllocator::bind_handler`]'s
/// callback into the running stack task, which alone owns the `Interface`.
type RegisterRequest = ([u8; 16], u8, oneshot::Sender<Result<()>>);

/// Handle used by callers outside the stack task — chiefly the address allocator — to ask the
/// live stack to register a new protocol address without taking ownership of the `Interface`.
#[derive(Clone)]
pub(crate) struct StackHandle {
    register_tx: mpsc::Sender<RegisterRequest>,
}

impl StackHandle {
    pub(crate) async fn register(&self, addr: Ipv6Addr) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.register_tx
            .send((addr.octets(), 128, tx))
            .await
            .map_err(|_| VNetError::Stack("stack task is no longer running".into()))?;
        rx.await
            .map_err(|_| VNetError::Stack("stack task dropped the register response".into()))?
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AttemptKey {
    pub(crate) local: SocketAddr,
    pub(crate) peer: SocketAddr,
}

/// A SYN held back while its handler lookup/invocation runs asynchronously (§4.5 steps 3-5).
struct PendingAttempt {
    frame: Bytes,
    attempt_token: CancellationToken,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Bookkeeping for one accepted connection, kept alongside its smoltcp socket (§4.5 step 6, §4.6).
struct ActiveConn {
    to_handler: mpsc::Sender<Bytes>,
    attempt_token: CancellationToken,
    close_notifier: CloseNotifier,
    hangup_tx: Option<oneshot::Sender<()>>,
    closing: bool,
}

/// Owns the in-process network stack: a single software link endpoint (§4.3), the TCP
/// forwarder/acceptor orchestration (§4.5), and the per-connection data pump feeding accepted
/// streams (§4.6).
pub(crate) struct NetworkStack {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: LinkDevice,
    inbound_rx: mpsc::Receiver<BytesMut>,
    inbound_tx: mpsc::Sender<BytesMut>,
    outbound_rx: Option<mpsc::Receiver<Bytes>>,
    register_rx: mpsc::Receiver<RegisterRequest>,
    allocator: Arc<AddressAllocator>,
    tracker: TaskTracker,
    attempts: Arc<Semaphore>,
    pending: HashMap<AttemptKey, PendingAttempt>,
    decision_tx: mpsc::Sender<(AttemptKey, Decision)>,
    decision_rx: mpsc::Receiver<(AttemptKey, Decision)>,
    active: HashMap<SocketHandle, ActiveConn>,
    ingress: SelectAll<BoxStream<'static, (SocketHandle, Bytes)>>,
    shutdown: CancellationToken,
}

impl NetworkStack {
    /// Constructs the stack façade (§4.3): a software link endpoint with a 512-packet internal
    /// queue depth in each direction, attached to NIC id 1, with a default IPv6 route installed
    /// and the NIC's own address (prefix suffix 1) registered.
    pub(crate) fn new(allocator: Arc<AddressAllocator>, tracker: TaskTracker) -> (Self, StackHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(LINK_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<BytesMut>(PACKET_CHANNEL_SIZE);
        let (register_tx, register_rx) = mpsc::channel::<RegisterRequest>(16);
        let (decision_tx, decision_rx) = mpsc::channel(MAX_IN_FLIGHT_ATTEMPTS);

        let mut device = LinkDevice::new(outbound_tx, MTU, Medium::Ip);

        let mut iface_config = Config::new(HardwareAddress::Ip);
        iface_config.random_seed = rand::thread_rng().gen();
        let mut iface = Interface::new(iface_config, &mut device, Instant::now());

        let nic = allocator.prefix().nic_address();
        iface.update_ip_addrs(|ip_addrs| {
            let _ = ip_addrs.push(IpCidr::new(
                IpAddress::Ipv6(Ipv6Address::from_bytes(&nic.octets())),
                128,
            ));
        });
        iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Address::from_bytes(&nic.octets()))
            .expect("installing the default ipv6 route never fails on a fresh route table");

        debug!(nic_id = NIC_ID, %nic, "network stack façade constructed");

        let stack = Self {
            iface,
            sockets: SocketSet::new(vec![]),
            device,
            inbound_rx,
            inbound_tx,
            outbound_rx: Some(outbound_rx),
            register_rx,
            allocator,
            tracker,
            attempts: Arc::new(Semaphore::new(MAX_IN_FLIGHT_ATTEMPTS)),
            pending: HashMap::new(),
            decision_tx,
            decision_rx,
            active: HashMap::new(),
            ingress: SelectAll::new(),
            shutdown: CancellationToken::new(),
        };
        (stack, StackHandle { register_tx })
    }

    /// Takes the outbound-frame receiver the stack→TUN forwarder task drains. Panics if called
    /// twice; the manager calls it exactly once while wiring up `Run`.
    pub(crate) fn take_outbound(&mut self) -> mpsc::Receiver<Bytes> {
        self.outbound_rx
            .take()
            .expect("stack outbound receiver already taken")
    }

    /// A sender the TUN→stack forwarder task uses to deliver classified frames.
    pub(crate) fn inbound_sender(&self) -> mpsc::Sender<BytesMut> {
        self.inbound_tx.clone()
    }

    /// Drives the stack until `shutdown` is cancelled, at which point the link endpoint is
    /// considered closed and this returns [`VNetError::Canceled`] (§4.7 step 4).
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.shutdown = shutdown.clone();

        loop {
            let now = Instant::now();
            let poll_delay = self.iface.poll_delay(now, &self.sockets).map(Duration::from);

            tokio::select! {
                _ = shutdown.cancelled() => return Err(VNetError::Canceled),

                frame = self.inbound_rx.recv() => {
                    match frame {
                        Some(frame) => self.handle_inbound(frame),
                        None => return Err(VNetError::Canceled),
                    }
                }

                Some((key, decision)) = self.decision_rx.recv() => {
                    self.handle_decision(key, decision);
                }

                Some((addr, prefix_len, reply)) = self.register_rx.recv() => {
                    let result = register_address(&mut self.iface, addr, prefix_len);
                    let _ = reply.send(result);
                }

                Some((handle, data)) = self.ingress.next() => {
                    self.handle_egress(handle, data);
                }

                _ = sleep_or_pending(poll_delay) => {}
            }

            let poll_now = Instant::now();
            self.iface.poll(poll_now, &mut self.device, &mut self.sockets);
            self.pump_active_connections();
        }
    }

    /// Classifies an inbound frame: IPv6 SYNs enter the acceptor pipeline (§4.5 steps 1-3);
    /// everything else is handed straight to smoltcp.
    fn handle_inbound(&mut self, frame: BytesMut) {
        if let Some(syn) = trap::inspect_packet(&frame) {
            if address_of(syn.local).is_some() {
                self.begin_attempt(syn.local, syn.peer, frame.freeze());
                return;
            }
        }
        self.device.enqueue(frame);
    }

    /// Step 1-3: derives a cancellation scope, acquires an in-flight slot, and spawns the lookup
    /// + handler invocation (§4.5) as an independent task so the poll loop is never blocked on it.
    fn begin_attempt(&mut self, local: SocketAddr, peer: SocketAddr, frame: Bytes) {
        let key = AttemptKey { local, peer };
        let Ok(permit) = self.attempts.clone().try_acquire_owned() else {
            debug!(%local, %peer, "in-flight attempt budget exhausted, dropping SYN");
            return;
        };

        let local_ip = match address_of(local) {
            Some(ip) => ip,
            None => return,
        };

        let attempt_token = self.shutdown.child_token();
        self.pending.insert(
            key,
            PendingAttempt {
                frame,
                attempt_token: attempt_token.clone(),
                _permit: permit,
            },
        );

        let allocator = self.allocator.clone();
        let decision_tx = self.decision_tx.clone();
        self.tracker.spawn(async move {
            match allocator.lookup(&local_ip).await {
                Some(handler) => {
                    run_attempt(handler, local, peer, attempt_token, key, decision_tx).await
                }
                None => {
                    debug!(%local_ip, "no handler bound, completing attempt with reset");
                    let _ = decision_tx.send((key, Decision::Reject)).await;
                }
            }
        });
    }

    /// Applies a handler's decision (§4.5 steps 3, 5, 6): either a synthesized reset or a
    /// freshly listening socket fed by the buffered SYN.
    fn handle_decision(&mut self, key: AttemptKey, decision: Decision) {
        let Some(pending) = self.pending.remove(&key) else {
            return;
        };

        match decision {
            Decision::Reject => {
                debug!(local = %key.local, peer = %key.peer, "attempt rejected");
                if let Some(reset) = trap::build_reset(&pending.frame) {
                    self.device.queue_direct(reset);
                } else {
                    warn!(local = %key.local, "failed to build reset for rejected attempt");
                }
            }
            Decision::Accept {
                to_handler,
                from_handler,
                close_notifier,
            } => self.accept_connection(key, pending, to_handler, from_handler, close_notifier),
        }
    }

    fn accept_connection(
        &mut self,
        key: AttemptKey,
        pending: PendingAttempt,
        to_handler: mpsc::Sender<Bytes>,
        from_handler: mpsc::Receiver<Bytes>,
        close_notifier: CloseNotifier,
    ) {
        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; STREAM_BUFFER_SIZE]),
            tcp::SocketBuffer::new(vec![0u8; STREAM_BUFFER_SIZE]),
        );
        socket.set_keep_alive(Some(SmolDuration::from_secs(KEEP_ALIVE_SECS)));

        let endpoint = IpEndpoint::new(to_ip_address(key.local), key.local.port());
        if let Err(e) = socket.listen(endpoint) {
            warn!(local = %key.local, "failed to listen for accepted attempt: {e}");
            close_notifier.force_close();
            return;
        }

        let handle = self.sockets.add(socket);
        self.device.enqueue(BytesMut::from(&pending.frame[..]));

        let (hangup_tx, hangup_rx) = oneshot::channel();
        self.active.insert(
            handle,
            ActiveConn {
                to_handler,
                attempt_token: pending.attempt_token.clone(),
                close_notifier: close_notifier.clone(),
                hangup_tx: Some(hangup_tx),
                closing: false,
            },
        );
        self.ingress
            .push(ReceiverStream::new(from_handler).map(move |b| (handle, b)).boxed());

        self.tracker.spawn(run_supervisor(
            pending.attempt_token,
            close_notifier,
            hangup_rx,
            self.shutdown.clone(),
        ));
    }

    /// Handler → peer: data the handler wrote, routed into the matching socket's send buffer.
    /// `handle` may already have been torn down (connection closed mid-flight); stale data is
    /// simply dropped, matching normal TCP teardown races.
    fn handle_egress(&mut self, handle: SocketHandle, data: Bytes) {
        if !self.active.contains_key(&handle) {
            return;
        }
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        if socket.can_send() {
            let sent = socket.send_slice(&data).unwrap_or(0);
            if sent < data.len() {
                warn!(dropped = data.len() - sent, "socket send buffer full");
            }
        }
    }

    /// Peer → handler, plus hangup detection (§4.6): drains each active socket's receive buffer
    /// into its stream, and tears down connections the peer has closed or that transport-errored.
    fn pump_active_connections(&mut self) {
        let mut to_remove = Vec::new();

        for (handle, conn) in self.active.iter_mut() {
            let socket = self.sockets.get_mut::<tcp::Socket>(*handle);

            if matches!(socket.state(), tcp::State::Closed | tcp::State::TimeWait) {
                to_remove.push(*handle);
                continue;
            }

            // CloseWait/Closing means the peer's FIN has already been seen, even though our own
            // side hasn't closed yet (§4.6: the supervisor's hang-up fires on the peer's FIN, not
            // on full teardown). Fired at most once per connection.
            if matches!(socket.state(), tcp::State::CloseWait | tcp::State::Closing) {
                if let Some(tx) = conn.hangup_tx.take() {
                    let _ = tx.send(());
                }
            }

            if conn.close_notifier.is_closed() && !conn.closing {
                socket.close();
                conn.closing = true;
            }

            if socket.can_recv() {
                loop {
                    let chunk = socket.recv(|buf| (buf.len(), Bytes::copy_from_slice(buf)));
                    match chunk {
                        Ok(chunk) if !chunk.is_empty() => {
                            if conn.to_handler.try_send(chunk).is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            }
        }

        for handle in to_remove {
            if let Some(mut conn) = self.active.remove(&handle) {
                conn.attempt_token.cancel();
                conn.close_notifier.force_close();
                if let Some(tx) = conn.hangup_tx.take() {
                    let _ = tx.send(());
                }
            }
            self.sockets.remove(handle);
        }
    }
}

/// Registers a protocol address on the interface (§4.3): prefix length 32 selects IPv4, 128
/// selects IPv6; anything else is a [`VNetError::BadParameter`]. Only the IPv6 path is exercised
/// by this core's own allocator, but the IPv4 branch is retained deliberately — see the Design
/// Notes on the open question about future IPv4 handler support.
fn register_address(iface: &mut Interface, addr: [u8; 16], prefix_len: u8) -> Result<()> {
    let cidr = match prefix_len {
        32 => {
            let v4 = Ipv4Address::new(addr[0], addr[1], addr[2], addr[3]);
            IpCidr::new(IpAddress::Ipv4(v4), 32)
        }
        128 => {
            let v6 = Ipv6Address::from_bytes(&addr);
            IpCidr::new(IpAddress::Ipv6(v6), 128)
        }
        other => {
            return Err(VNetError::BadParameter(format!(
                "unsupported protocol address prefix length {other}"
            )))
        }
    };

    iface.update_ip_addrs(|ip_addrs| {
        if !ip_addrs.contains(&cidr) {
            let _ = ip_addrs.push(cidr);
        }
    });
    Ok(())
}

fn to_ip_address(addr: SocketAddr) -> IpAddress {
    match addr {
        SocketAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.ip().octets())),
        SocketAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.ip().octets())),
    }
}

async fn sleep_or_pending(delay: Option<Duration>) {
    match delay {
        Some(d) => time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}
