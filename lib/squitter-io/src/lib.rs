//! I/O primitives for consuming BaseStation (SBS-1) feeds.
//!
//! This crate covers everything between the socket and a candidate protocol line: connecting to a feed with a bounded
//! retry policy, reading chunks with a stall timeout, and reassembling those chunks into complete lines.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod framing;
pub mod net;
pub mod shutdown;
