//! KratOs Crawler
//!
//! Periodically discovers peers of the KratOs network, filters them
//! through an IP/pubkey blacklist, scores their liveness and persists
//! the results.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      KRATOS CRAWLER                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Config file (JSON)     ←── re-read every round, hash-gated  │
//! │  Blacklist filter       ←── IPs, CIDR ranges, pubkeys        │
//! │  Crawl scheduler        ←── discovery, checks, scoring       │
//! │  Node registry          ←── snapshot file (JSON)             │
//! │  Peer store (RocksDB)   ←── one row per peer                 │
//! │  HTTP API (8080)        ←── status, peers, metrics           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod blacklist;
pub mod config;
pub mod crawler;
pub mod crypto;
pub mod discovery;
pub mod geo;
pub mod logging;
pub mod registry;
pub mod storage;
pub mod types;
