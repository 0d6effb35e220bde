//! Estafette - Journal Collection & Delivery Agent
//!
//! Estafette watches a directory tree for device journal files, packages
//! each one, and ships it to a remote store through a durable on-disk
//! queue. Delivery is at-least-once: a crash or network outage never loses
//! an item, at the cost of possible duplicate uploads.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐    ┌──────────┐    ┌───────────────┐    ┌──────────┐
//! │ Collector │───▶│ Packager │───▶│ Durable Queue │───▶│   Sink   │
//! │ (scan)    │    │ (zip)    │    │ (filesystem)  │    │ (SFTP)   │
//! └───────────┘    └──────────┘    └───────────────┘    └──────────┘
//! ```
//!
//! One synchronous loop drives a full cycle: drain discovery into the
//! queue, attempt exactly one delivery, refresh metrics, sleep. The queue
//! (`estafette_queue`) carries all persistent state.

pub mod agent;
pub mod archive;
pub mod cancel;
pub mod collector;
pub mod config;
pub mod metrics;
pub mod update;
pub mod uploader;
