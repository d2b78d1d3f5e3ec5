//! # Repository Module
//!
//! Database repository implementations.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  SyncAgent                                                             │
//! │       │                                                                 │
//! │       │  db.readings().fetch_unposted(500)                             │
//! │       ▼                                                                 │
//! │  ReadingQueue                                                          │
//! │  ├── store(&self, batch)                                               │
//! │  ├── fetch_unposted(&self, limit)                                      │
//! │  ├── mark_posted(&self, ids)                                           │
//! │  ├── prune(&self, retention)                                           │
//! │  └── stats(&self)                                                      │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`ReadingQueue`](readings::ReadingQueue) - The local durable reading queue

pub mod readings;
