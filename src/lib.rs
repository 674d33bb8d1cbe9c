//! `redmine_access` is the client-side data-access layer for a Redmine issue tracker.
//! It layers an async worker pool over a caching decorator over a blocking REST client,
//! and learns custom-field schemas from the tasks it sees.

/// Async facade that runs client calls on a bounded worker pool.
pub mod async_client;
/// TTL cache with background sweeping and a SQLite snapshot.
pub mod cache;
/// Caching decorator applying per-category cache policy.
pub mod cached;
/// The client contract shared by every layer, and its error type.
pub mod client;
/// JSON wire codec for Redmine payloads.
pub mod codec;
/// Runtime configuration loading and validation.
pub mod config;
/// Blocking HTTP transport for the Redmine REST API.
pub mod http;
/// Custom-field definitions learned from observed tasks.
pub mod learning;
/// Logging setup.
pub mod logging;
/// Runtime metrics counters.
pub mod metrics;
/// Domain records exchanged with the tracker.
pub mod model;
