//! Address allocator (§4.4): monotonic IPv6 suffix assignment and the handler binding table.

use crate::error::{Result, VNetError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// A handler bound to one allocated address.
///
/// `handle` is invoked once per accepted SYN. Not calling `produce` is equivalent to refusing the
/// connection; calling it more than once fails (see [`crate::stream::StreamProducer`]). An `Err`
/// return is logged and the connection is closed (§7); it does not affect the manager or any
/// other connection.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        token: CancellationToken,
        produce: crate::stream::StreamProducer,
    ) -> anyhow::Result<()>;
}

pub type HandlerRef = Arc<dyn Handler>;

/// The fixed 96-bit IPv6 prefix a manager instance hands out suffixes within.
///
/// Bytes 0 is `0xfd` (unique-local), bytes 1-5 are a random global ID, bytes 6-7 are the
/// (zero) subnet id. See the crate-level docs for why bits 48-63 of the global ID are left
/// zero: this is bit-compatible with prior deployments and yields 40 bits of effective entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Prefix([u8; 16]);

impl Ipv6Prefix {
    /// Validates and wraps a caller-supplied prefix. Only the first 12 bytes are significant;
    /// the low 4 bytes are overwritten by suffix assignment and must be zero on input.
    pub fn new(bytes: [u8; 16]) -> Result<Self> {
        if bytes[0] != 0xfd {
            return Err(VNetError::BadParameter(
                "IPv6 prefix must start with 0xfd (unique-local)".into(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Generates a fresh prefix with a random 40-bit global ID, as `faceb00c` deployments do.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xfd;
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[1..6]);
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 16] {
        self.0
    }

    fn address_for_suffix(&self, suffix: u32) -> Ipv6Addr {
        let mut octets = self.0;
        octets[12..16].copy_from_slice(&suffix.to_be_bytes());
        Ipv6Addr::from(octets)
    }

    /// The NIC's own address, suffix 1.
    pub fn nic_address(&self) -> Ipv6Addr {
        self.address_for_suffix(crate::constants::NIC_SUFFIX)
    }

    /// True if `addr`'s first 12 bytes match this prefix.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        addr.octets()[..12] == self.0[..12]
    }
}

/// Monotonic suffix assignment plus the address-to-handler binding table, guarded by a single
/// read/write lock (§5): reads happen on every inbound SYN, writes only when a new handler binds.
pub struct AddressAllocator {
    prefix: Ipv6Prefix,
    next_suffix: AtomicU32,
    table: RwLock<HashMap<Ipv6Addr, HandlerRef>>,
}

impl AddressAllocator {
    pub fn new(prefix: Ipv6Prefix) -> Self {
        Self {
            prefix,
            next_suffix: AtomicU32::new(crate::constants::NIC_SUFFIX),
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> Ipv6Prefix {
        self.prefix
    }

    /// Binds `handler` to a freshly allocated address and registers it with `register`, which
    /// should install the address as a protocol address on the stack's NIC (§4.3). On failure the
    /// table entry is left in place (best-effort consistency; callers should treat this as fatal).
    pub async fn bind_handler<F, Fut>(&self, handler: HandlerRef, register: F) -> Result<Ipv6Addr>
    where
        F: FnOnce(Ipv6Addr) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let suffix = self.next_suffix.fetch_add(1, Ordering::SeqCst);
        if suffix == u32::MAX {
            // The suffix space is exhausted; this is a fatal invariant violation (§3).
            panic!("IPv6 suffix space exhausted: at most 2^32-2 bindings are permitted");
        }
        let address = self.prefix.address_for_suffix(suffix + 1);

        {
            let mut table = self.table.write().await;
            table.insert(address, handler);
        }

        register(address).await?;
        Ok(address)
    }

    /// Looks up the handler bound to `addr`, if any (hot path: called on every inbound SYN).
    pub async fn lookup(&self, addr: &Ipv6Addr) -> Option<HandlerRef> {
        self.table.read().await.get(addr).cloned()
    }

    #[cfg(test)]
    pub async fn bound_count(&self) -> usize {
        self.table.read().await.len()
    }
}

/// Converts a socket address into its address-only form (port dropped), as looked up in the
/// binding table: handlers are bound to addresses, not address:port pairs.
pub fn address_of(dst: SocketAddr) -> Option<Ipv6Addr> {
    match dst {
        SocketAddr::V6(v6) => Some(*v6.ip()),
        SocketAddr::V4(_) => None,
    }
}
