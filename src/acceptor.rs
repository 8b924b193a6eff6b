//! Drives a single handler invocation to completion (§4.5 steps 4-6).

use crate::addr::HandlerRef;
use crate::error::VNetError;
use crate::stack::AttemptKey;
use crate::stream::{AttemptGuard, Decision, StreamProducer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Logs a handler's returned error (§7 `HandlerError`): logged, the connection is closed, and it
/// never propagates to the manager or any other connection.
fn log_handler_error(peer: SocketAddr, err: anyhow::Error) {
    let err = VNetError::Handler(err);
    warn!(%peer, error = %err, "handler returned an error");
}

/// Invokes `handler` with a fresh stream producer and reports its decision back to the stack
/// task over `decision_tx` as soon as it is known — either the moment the handler calls the
/// producer (§4.5 step 6) or the moment it returns without doing so (step 5) — rather than
/// waiting for the handler body to finish running.
///
/// Spawned as an independent task by the stack façade for every SYN with a bound handler; the
/// manager's outstanding-work tracker counts it from spawn to return, so this future keeps
/// driving the handler (e.g. an echo loop that outlives the handshake) to completion even after
/// its decision has already been sent. The [`AttemptGuard`] backing the producer guarantees a
/// decision is always produced, even if `handler.handle` returns without calling the producer,
/// panics, or is cut short by `token` firing.
pub(crate) async fn run_attempt(
    handler: HandlerRef,
    local: SocketAddr,
    peer: SocketAddr,
    token: CancellationToken,
    key: AttemptKey,
    decision_tx: mpsc::Sender<(AttemptKey, Decision)>,
) {
    let (tx, rx) = oneshot::channel();
    let guard = Arc::new(std::sync::Mutex::new(AttemptGuard::new(tx)));
    let producer = StreamProducer::new(local, peer, guard);

    let handle_fut = handler.handle(token.clone(), producer);
    tokio::pin!(handle_fut);
    tokio::pin!(rx);

    // Race the handler body against its own decision channel: whichever resolves first tells
    // us the outcome. If the handler finishes first without producing, `producer` (and with it
    // the guard's last strong reference) has just dropped, so `rx` resolves right away too.
    let mut handler_finished = false;
    let mut handler_result = None;
    let decision = tokio::select! {
        res = &mut rx => res.unwrap_or(Decision::Reject),
        res = &mut handle_fut => {
            handler_finished = true;
            handler_result = Some(res);
            rx.await.unwrap_or(Decision::Reject)
        }
    };

    let _ = decision_tx.send((key, decision)).await;

    if !handler_finished {
        tokio::select! {
            res = &mut handle_fut => { handler_result = Some(res); }
            _ = token.cancelled() => {}
        }
    }

    if let Some(Err(err)) = handler_result {
        log_handler_error(peer, err);
    }
}
