//! Manager lifecycle (§4.7): composes the TUN adapter, packet forwarder, network stack façade,
//! and address allocator into a single `run`, with ordered teardown on cancellation.

use crate::addr::{AddressAllocator, HandlerRef, Ipv6Prefix};
use crate::error::{Result, VNetError};
use crate::forwarder::{run_stack_to_tun, run_tun_to_stack};
use crate::stack::{NetworkStack, StackHandle};
use crate::tun::TunDevice;
use bytes::{Bytes, BytesMut};
use std::net::Ipv6Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Construction record for a [`VNetManager`] (§6). Both fields are required; validation happens
/// in [`VNetManager::new`].
#[derive(Clone)]
pub struct VNetConfig {
    /// The TUN adapter this manager owns for its lifetime, closed exactly once at teardown.
    pub tun_device: Arc<dyn TunDevice>,
    /// A 16-byte IPv6 ULA prefix; must start with `0xfd` and have its low 4 bytes zero.
    pub ipv6_prefix: [u8; 16],
}

impl std::fmt::Debug for VNetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VNetConfig")
            .field("ipv6_prefix", &self.ipv6_prefix)
            .finish_non_exhaustive()
    }
}

/// Owns one userspace VNet instance: the TUN adapter, the in-process network stack, the address
/// allocator, and every task the two spawn. [`VNetManager::run`] drives it to completion.
///
/// The stack task is spawned at construction time, not in [`VNetManager::run`]: its `select!`
/// loop is the only thing servicing protocol-address registration requests
/// ([`StackHandle::register`]), and [`VNetManager::bind_handler`] is meant to work before `run`
/// is ever called. Spawning it lazily in `run` would deadlock any pre-run binding, since the
/// `register` round-trip would be awaiting a loop nothing has started yet.
pub struct VNetManager {
    tun: Arc<dyn TunDevice>,
    allocator: Arc<AddressAllocator>,
    stack_handle: StackHandle,
    outbound_rx: mpsc::Receiver<Bytes>,
    inbound_tx: mpsc::Sender<BytesMut>,
    stack_task: JoinHandle<Result<()>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl VNetManager {
    /// Validates `config`, constructs the manager, and starts the stack task so
    /// [`VNetManager::bind_handler`] works immediately — before or during [`VNetManager::run`].
    pub fn new(config: VNetConfig) -> Result<Self> {
        let prefix = Ipv6Prefix::new(config.ipv6_prefix)?;
        let allocator = Arc::new(AddressAllocator::new(prefix));
        let tracker = TaskTracker::new();
        let (mut stack, stack_handle) = NetworkStack::new(allocator.clone(), tracker.clone());

        let outbound_rx = stack.take_outbound();
        let inbound_tx = stack.inbound_sender();

        let shutdown = CancellationToken::new();
        let stack_task = tokio::spawn(stack.run(shutdown.clone()));

        Ok(Self {
            tun: config.tun_device,
            allocator,
            stack_handle,
            outbound_rx,
            inbound_tx,
            stack_task,
            shutdown,
            tracker,
        })
    }

    /// The prefix this manager allocates addresses within (§3).
    pub fn prefix(&self) -> Ipv6Prefix {
        self.allocator.prefix()
    }

    /// Binds `handler` to a freshly allocated address (§4.4), registering it with the stack.
    /// Safe to call before [`VNetManager::run`] — the stack task that services the registration
    /// round-trip is already running — or concurrently with it.
    pub async fn bind_handler(&self, handler: HandlerRef) -> Result<Ipv6Addr> {
        let stack_handle = self.stack_handle.clone();
        self.allocator
            .bind_handler(handler, move |addr| {
                let stack_handle = stack_handle.clone();
                async move { stack_handle.register(addr).await }
            })
            .await
    }

    /// Runs the manager until `token` is cancelled, then tears down in order (§4.7 steps 2-8):
    /// bridges `token` into the stack's already-running shutdown signal, spawns the forwarder
    /// pair, waits for a cancellation or fault, closes the TUN, joins every task, and returns a
    /// possibly-aggregate error.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!(prefix = ?self.allocator.prefix().octets(), "vnet manager starting");

        let VNetManager {
            tun,
            allocator: _allocator,
            stack_handle: _stack_handle,
            outbound_rx,
            inbound_tx,
            stack_task,
            shutdown,
            tracker,
        } = self;

        // The stack has been running since `new`; bridge the caller's token into its shutdown
        // signal instead of deriving a fresh child (there is nothing left to derive from — the
        // stack task was already spawned against `shutdown` itself).
        let bridge_shutdown = shutdown.clone();
        let bridge = tokio::spawn(async move {
            token.cancelled().await;
            bridge_shutdown.cancel();
        });

        let fwd_out = tokio::spawn(run_stack_to_tun(tun.clone(), outbound_rx, shutdown.clone()));
        let fwd_in = tokio::spawn(run_tun_to_stack(tun.clone(), inbound_tx));

        let watcher_tun = tun.clone();
        let watcher_shutdown = shutdown.clone();
        let watcher = tokio::spawn(async move {
            watcher_shutdown.cancelled().await;
            watcher_tun.close().await;
        });

        // Whichever of the three finishes first - by cancellation or by fault - cancels the
        // shared scope so the others unwind too (§4.2: "if either exits, the other is caused to
        // exit via TUN closure"), rather than double-awaiting the one that already finished.
        let (first, _idx, rest) =
            futures::future::select_all([fwd_out, fwd_in, stack_task]).await;
        shutdown.cancel();

        let mut errors = Vec::new();
        let mut push = |joined: std::result::Result<Result<()>, tokio::task::JoinError>| match joined
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(_) => errors.push(VNetError::Stack("a manager task panicked".into())),
        };
        push(first);
        for handle in rest {
            push(handle.await);
        }
        let _ = watcher.await;
        let _ = bridge.await;

        // The stack task has returned, so every handler/supervisor task it could still spawn is
        // accounted for; close the tracker and wait for the ones already in flight (§4.7 step 6).
        tracker.close();
        tracker.wait().await;

        info!("vnet manager stopped");
        match VNetError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for VNetManager {
    /// If the manager is dropped without ever calling [`VNetManager::run`] (e.g. construction
    /// succeeded but the caller gave up before driving it), cancel the stack's shutdown signal so
    /// the task spawned in [`VNetManager::new`] does not outlive its owner.
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            debug!("vnet manager dropped without running; cancelling its stack task");
            self.shutdown.cancel();
        }
    }
}
