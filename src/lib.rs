//! mdnslib: a Multicast DNS (RFC 6762) and DNS-SD (RFC 6763) engine.
//!
//! Two subsystems share one wire codec:
//!
//! - the [`repository`] side advertises local services: it owns names,
//!   produces probe/announce/goodbye/reply packets and detects conflicts;
//!   the [`repeater`] paces the timed transmissions.
//! - the [`client`] side discovers remote services: a continuous querier
//!   with burst scheduling and TTL backoff, feeding the [`decoder`] and the
//!   TTL-indexed [`cache`], fanning completed services out to listeners.
//!
//! Sockets, interface enumeration and the application-facing registration
//! API live outside this crate; the seams are the traits in [`deps`].
//! Everything runs single-threaded on one event loop, no locks anywhere.

pub mod cache;
pub mod client;
pub mod decoder;
pub mod deps;
pub mod error;
pub mod name;
pub mod network_order;
pub mod repeater;
pub mod repository;
pub mod rfc6762;
pub mod util;

mod macros;
