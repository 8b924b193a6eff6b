/// MTU enforced on the virtual NIC and advertised to the TUN adapter.
pub const MTU: usize = 1500;

/// Fixed prefix every TUN write/read buffer reserves before the L3 frame, matching the
/// device-specific header some platforms prepend (e.g. the 4-byte `af_family` header on BSD).
pub const HEADER_RESERVE: usize = 4;

/// Internal queue depth of the software link endpoint, in each direction.
pub const LINK_QUEUE_DEPTH: usize = 512;

/// Maximum number of TCP connection attempts that may be outstanding (SYN received,
/// accept/reset decision not yet made) at any one time.
pub const MAX_IN_FLIGHT_ATTEMPTS: usize = 1024;

/// NIC id the façade binds its single software link endpoint to.
pub const NIC_ID: u32 = 1;

/// Suffix reserved for the NIC's own address; never handed out by the allocator.
pub const RESERVED_SUFFIX: u32 = 0;

/// First suffix assigned to the NIC itself.
pub const NIC_SUFFIX: u32 = 1;

/// Buffer size used for accepted TCP streams, matching the stack's own default.
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Keep-alive interval enabled on every accepted connection.
pub const KEEP_ALIVE_SECS: u64 = 60;

/// Packet channel depth between the TUN adapter and the packet forwarder.
pub const PACKET_CHANNEL_SIZE: usize = 1024;

/// Initial capacity of the link device's recycled transmit-buffer pool.
pub const TX_POOL_CAPACITY: usize = 64;

/// Buffers are only returned to the pool while it holds fewer than this many.
pub const TX_POOL_MAX_SIZE: usize = 256;

/// A drained transmit buffer is recycled only if at least this much spare capacity remains.
pub const TX_POOL_RECYCLE_THRESHOLD: usize = 256;

/// Capacity of a freshly allocated transmit buffer when the pool is empty.
pub const TX_ARENA_SIZE: usize = HEADER_RESERVE + MTU;
