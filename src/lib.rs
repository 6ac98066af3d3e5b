//! Persistence and lifecycle daemon for agent memory.
//!
//! One `memoryd` process owns all durable knowledge and feedback for a storage
//! directory, serves it to concurrent clients over a small JSON envelope
//! protocol, keeps its own memory bounded, and shuts down in a fixed order so
//! nothing in flight is lost.
//!
//! # Wire protocol
//!
//! Requests are `{version, method, params, id}`; responses are
//! `{version, result, id}` or `{version, error: {code, message, data?}, id}`.
//! The primary transport is a unix socket at `<dir>/memoryd.sock`, one JSON
//! document per frame; the fallback is `POST /rpc` on `127.0.0.1:3737`.
//!
//! | Method | Result |
//! |--------|--------|
//! | `storeKnowledge` | `{id, stored}` |
//! | `getKnowledge` | `{entry}` |
//! | `getKnowledgeByDomain` | `{entries, count}` |
//! | `getKnowledgeByTags` | `{entries, count}` |
//! | `deleteKnowledge` | `{deleted}` |
//! | `provideFeedback` | `{stored, id, trajectoryCompleted}` |
//! | `queryPatterns` | `{patterns, count}` |
//! | `beginTrajectory` | `{trajectoryId, startedAt}` |
//! | `flush` | `{flushed}` |
//! | `getStatus` / `ping` | status document |
//! | `describeMethods` | `{methods}` |
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`protocol`]: envelopes, framing, and the method table
//! - [`storage`]: in-memory collections with atomic JSON snapshots
//! - [`daemon`]: lifecycle, listeners, connection ceiling, dispatch
//! - [`monitor`] and [`eviction`]: memory alerts and the trimming they trigger
//! - [`shutdown`]: ordered, timeout-bounded teardown and signal wiring

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod eviction;
pub mod monitor;
pub mod protocol;
pub mod shutdown;
pub mod storage;
pub mod trajectory;
