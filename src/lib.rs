//! # RemusDB
//!
//! An embeddable, persistent, **ordered** key-value storage engine built
//! on a Log-Structured Merge Tree (LSM-tree). Designed for sustained
//! write throughput, fast range scans, and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Engine                             │
//! │   writes ──► WAL (wal1/wal2) ──► writable memtable (WMT)  │
//! │                                        │ view rotation    │
//! │                                        ▼                  │
//! │                             immutable memtable (IMT)      │
//! │                                        │ compaction       │
//! │                 ┌──────────────────────┴──────────┐       │
//! │                 ▼ accept                          ▼ reject│
//! │        new partition tables              keys re-enter WMT│
//! │                 │                                 │       │
//! │                 └────► table version (HEAD) ◄─────┘       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Public surface — open, get/probe, put/del, merge, iterate, sync, compaction pipeline |
//! | [`memtable`] | Concurrent ordered in-memory write buffer |
//! | [`view`] | The four-state memtable view ring |
//! | [`wal`] | Two-file rotating write-ahead log with an async write ring |
//! | [`sstable`] | Immutable tables, anchor-partitioned versions, accept/reject compaction |
//! | [`qsbr`] | Quiescent-state-based reclamation for views and versions |
//! | [`kv`] | Record types, krefs, limits |
//! | [`codec`] | Varints and CRC32C wire primitives |
//!
//! ## Key properties
//!
//! - **WAL-first writes** — every mutation is in the log buffer before
//!   it is visible; `sync` makes the log durable.
//! - **Non-blocking readers** — point reads and scans snapshot a
//!   consistent (WMT, IMT, version) triple and never block writers or
//!   compaction.
//! - **Bounded write amplification** — compaction rejects partitions
//!   whose rewrite would be mostly old data, routing their fresh keys
//!   back into the write path under a fixed budget.
//! - **Crash recovery** — the WAL pair replays against the persisted
//!   table version; a file is truncated only once its records are
//!   durable elsewhere.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use remusdb::engine::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/my_db", EngineConfig::default()).unwrap();
//! let mut h = engine.handle().unwrap();
//!
//! h.put(b"remix", b"easy");
//! assert_eq!(h.get(b"remix").as_deref(), Some(&b"easy"[..]));
//!
//! h.del(b"remix");
//! assert!(!h.probe(b"remix"));
//!
//! // Atomic read-modify-write.
//! use remusdb::kv::MergeUpdate;
//! h.merge(b"counter", |cur| {
//!     let n = cur.map(|v| v.len()).unwrap_or(0);
//!     MergeUpdate::Put(bytes::Bytes::from(vec![b'x'; n + 1]))
//! });
//!
//! engine.sync().unwrap();
//! engine.close().unwrap();
//! ```

pub mod codec;
pub mod engine;
pub mod kv;
pub mod memtable;
pub mod qsbr;
pub mod sstable;
pub mod view;
pub mod wal;

pub use engine::{Engine, EngineConfig, EngineHandle, EngineStats};
pub use kv::MergeUpdate;
