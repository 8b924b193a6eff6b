//! Connection supervisor (§4.6): one task per accepted connection, watching for peer hang-up,
//! transport error, or global shutdown, so the handler's cancellation scope and stream close
//! promptly without the handler having to poll for any of this itself.

use crate::stream::CloseNotifier;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Awaits whichever fires first and reacts (§4.6):
/// - `close_notifier` already fired: the handler closed the stream itself, nothing to do.
/// - `hangup`: the stack façade observed the peer send FIN/RST or a transport error.
/// - `shutdown`: the manager is tearing down.
///
/// On the second or third, cancels `attempt_token` (so a handler blocked on `token.cancelled()`
/// in a `select!` unblocks) and force-closes the stream. Safe to race a handler-initiated close:
/// [`CloseNotifier::force_close`] is idempotent.
pub(crate) async fn run_supervisor(
    attempt_token: CancellationToken,
    close_notifier: CloseNotifier,
    hangup: oneshot::Receiver<()>,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = close_notifier.notified() => {}
        _ = hangup => {
            attempt_token.cancel();
            close_notifier.force_close();
        }
        _ = shutdown.cancelled() => {
            attempt_token.cancel();
            close_notifier.force_close();
        }
    }
}
