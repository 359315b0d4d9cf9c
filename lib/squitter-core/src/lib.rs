//! Core ingestion pipeline for BaseStation (SBS-1) feeds.
//!
//! Lines produced by `squitter-io` are parsed into typed [`Record`][record::Record]s, rate-limited per aircraft by a
//! [`Throttle`][throttle::Throttle], and delivered in batches to a [`Sink`][sink::Sink] by a
//! [`BatchWriter`][writer::BatchWriter]. [`FeedPipeline`][pipeline::FeedPipeline] ties these together with the
//! connection lifecycle of a single feed.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod collections;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod telemetry;
pub mod throttle;
pub mod writer;
