//! Packet forwarder (§4.2): two cooperating tasks shuttling whole L3 frames between the TUN
//! adapter and the network stack's link endpoint.

use crate::constants::{HEADER_RESERVE, MTU};
use crate::error::{Result, VNetError};
use crate::tun::TunDevice;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stack → TUN (§4.2): drains outbound frames the link endpoint produced and writes each back
/// through the TUN in its own call. Cancellable via `token`; a cancellation is reported as
/// [`VNetError::Canceled`] rather than a fault, since it is the expected way this task ends at
/// shutdown.
pub(crate) async fn run_stack_to_tun(
    tun: Arc<dyn TunDevice>,
    mut outbound: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Err(VNetError::Canceled),
            frame = outbound.recv() => frame,
        };

        let Some(frame) = frame else {
            // The stack's link endpoint has gone away; nothing left to forward.
            return Err(VNetError::Canceled);
        };

        let mut buf = vec![0u8; HEADER_RESERVE + frame.len()];
        buf[HEADER_RESERVE..].copy_from_slice(&frame);
        let len = frame.len();
        if let Err(e) = tun.write_batch(&[(buf, HEADER_RESERVE, len)]).await {
            warn!("tun write failed, forwarder exiting: {e}");
            return Err(VNetError::Io(e));
        }
    }
}

/// TUN → stack (§4.2): reads batches off the TUN, drops anything whose leading nibble isn't
/// `0x4`/`0x6` (malformed or ARP-like traffic), and hands the rest to the stack's inbound queue.
/// Not cancelled by any token; terminates only when a TUN read fails, which is how it observes
/// the TUN having been closed at shutdown (§4.2).
pub(crate) async fn run_tun_to_stack(
    tun: Arc<dyn TunDevice>,
    inbound: mpsc::Sender<BytesMut>,
) -> Result<()> {
    let batch_size = tun.batch_size();
    let mut bufs: Vec<Vec<u8>> = (0..batch_size)
        .map(|_| vec![0u8; HEADER_RESERVE + MTU])
        .collect();
    let mut lens = vec![0usize; batch_size];

    loop {
        let n = match tun.read_batch(&mut bufs, &mut lens, HEADER_RESERVE).await {
            Ok(n) => n,
            Err(e) => {
                debug!("tun read failed, forwarder exiting: {e}");
                return Err(VNetError::Io(e));
            }
        };

        for (buf, &len) in bufs.iter().zip(lens.iter()).take(n) {
            let frame = &buf[HEADER_RESERVE..HEADER_RESERVE + len];
            match frame.first().map(|b| b >> 4) {
                Some(4) | Some(6) => {
                    if inbound.send(BytesMut::from(frame)).await.is_err() {
                        // The stack side is gone: shutting down.
                        return Err(VNetError::Canceled);
                    }
                }
                _ => {
                    // Malformed or non-IP frame (§4.2): dropped silently.
                }
            }
        }
    }
}
