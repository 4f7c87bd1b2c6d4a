//! Impersonates sleeping machines on the local network and wakes them
//! on demand.
//!
//! For every configured address the proxy installs firewall rules,
//! claims the address on the interface, and listens for a client SYN
//! to one of the watched TCP ports. The first SYN is absorbed; the
//! proxy releases the address, sends a wake-on-lan packet, and the
//! client's retransmitted SYN reaches the freshly woken host.

pub mod addr;
pub mod capture;
pub mod config;
pub mod emulate;
pub mod firewall;
pub mod frame;
pub mod guard;
pub mod neighbour;
pub mod signal;
pub mod sys;
pub mod watcher;
pub mod wol;
