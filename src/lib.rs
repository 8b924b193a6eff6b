//! A userspace VNet manager: presents a TUN device to the host and terminates TCP connections
//! addressed to a private IPv6 range inside the process, handing each accepted connection to a
//! per-address handler as a full-duplex byte stream.
//!
//! See [`VNetManager`] for the entry point and [`Handler`] for the capability bound to each
//! allocated address.

mod acceptor;
pub mod addr;
pub mod constants;
mod device;
pub mod error;
mod forwarder;
mod manager;
mod stack;
pub mod stream;
mod supervisor;
mod trap;
pub mod tun;

pub use addr::{AddressAllocator, Handler, HandlerRef, Ipv6Prefix};
pub use error::{Result, VNetError};
pub use manager::{VNetConfig, VNetManager};
pub use stream::{CloseNotifier, VNetStream};
pub use tun::{TunDevice, TunRsDevice};
