//! # LimboDB Core
//!
//! The core storage engine of a schemaless, document-style, versioned
//! database. The core ingests writes into an in-memory staging layer (the
//! [`limbo`]), asynchronously migrates them into an on-disk indexed store
//! (the [`database`]), and coordinates [`atomic`] operations and
//! [`transaction`]s on top of the resulting two-tier store using a
//! Just-In-Time locking protocol with optimistic conflict detection.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                              Engine                                │
//! │  ┌────────────┐             ┌──────────────────────────────────┐  │
//! │  │   Buffer    │   sync      │             Database             │  │
//! │  │  (Limbo)    │ ──────────► │  primary / secondary / search    │  │
//! │  │  + txn WAL  │ Transporter │  Blocks (blk + fltr + indx)      │  │
//! │  └─────┬──────┘             └──────────────┬───────────────────┘  │
//! │        │ BufferedStore::verify/select/...  │                      │
//! │        └───────────────────┬────────────────┘                      │
//! │                             ▼                                      │
//! │                    AtomicOperation / Transaction                   │
//! │            (JIT locking, preemption via version-change events)     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`common`] | Data-model primitives: `Rid`, `Version`, `Action`, `Value`, `Write`, `Operator` |
//! | [`encoding`] | Dependency-free `Encode`/`Decode` byte-level codec primitives |
//! | [`inventory`] | Persistent set of every RID ever written |
//! | [`block`] | Sorted, immutable-on-sync on-disk revision group with bloom filter + offset index |
//! | [`record`] | In-memory materialized view of revisions for one locator |
//! | [`database`] | Collection of Blocks per index orientation; seeks and merges into Records |
//! | [`limbo`] | Append-only ordered Write log (`Queue`/`ToggleQueue`) plus a disk-backed `Buffer` |
//! | [`buffered_store`] | Composes a Limbo over a durable store with tri-state verify and XOR merge |
//! | [`lock`] | Token-keyed read/write locks, range locks, and version-change announcements |
//! | [`atomic`] | Isolated staging + JIT locking + preemption on version change |
//! | [`transaction`] | `AtomicOperation` with a WAL-backed backup file and crash replay |
//! | [`two_phase_commit`] | Distributed commit phase separating lock acquisition from application |
//! | [`transporter`] | Background workers draining the Limbo into the Database |
//! | [`engine`] | The root store tying Buffer + Database + Inventory + Transporter together |
//! | [`wal`] | Generic, CRC-protected write-ahead log used by the Buffer and Transaction backups |
//!
//! ## Key properties
//!
//! - **XOR-fold consistency** — a Record's present value set is the
//!   XOR-fold of its ordered ADD/REMOVE history.
//! - **Bloom soundness** — a negative `mightContain` answer is authoritative.
//! - **JIT locking** — locks are acquired only at commit time, over the
//!   aggregate set of tokens an operation's reads and writes accumulated.
//! - **Optimistic preemption** — a running operation observes version-change
//!   events for tokens it touched; an intervening commit dooms it before it
//!   ever blocks on a lock.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use limbodb_core::common::{Action, Rid, Value};
//! use limbodb_core::engine::{Engine, EngineConfig};
//!
//! let engine = Engine::open(EngineConfig::new("/tmp/limbodb-env")).unwrap();
//!
//! let op = engine.start_atomic_operation();
//! op.write("name", Value::Str("Alice".to_string()), Rid::new(17), Action::Add).unwrap();
//! assert!(op.commit().unwrap());
//!
//! let read = engine.start_atomic_operation();
//! let record = read.select_key(Rid::new(17), "name").unwrap();
//! assert!(!record.is_empty());
//! ```

#![allow(dead_code)]

pub mod atomic;
pub mod block;
pub mod buffered_store;
pub mod common;
pub mod database;
pub mod encoding;
pub mod engine;
pub mod inventory;
pub mod limbo;
pub mod lock;
pub mod record;
pub mod transaction;
pub mod transporter;
pub mod two_phase_commit;
pub mod wal;
