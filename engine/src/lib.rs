//! # Query Engine
//!
//! Runs protocol definitions from the `protocol` crate against many servers at
//! once. A run is single-threaded: every socket is driven from one readiness
//! loop, bounded by a pool of at most `max_sockets` sessions.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! [`QueryPolicy`]: per-attempt timeout, retry count, socket limit and receive
//! buffer size.
//!
//! ### Session Module (`session`)
//! Socket slots and the pool that recycles them. A session owns at most one
//! UDP socket and performs one exchange at a time: send, collect datagrams from
//! the target until the definition calls the answer complete, retry on timeout.
//!
//! ### Orchestrator Module (`orchestrator`)
//! [`QueryEngine`]: preparation, challenge sequencing, job scheduling and
//! finalization of each server into a [`ServerReport`].
//!
//! ### Report Module (`report`)
//! Per-server outcome: online flag, phase states, scoped failures, traffic
//! statistics and the normalized result.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use engine::{QueryEngine, QueryPolicy};
//! use protocol::ServerDescriptor;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = QueryEngine::new(QueryPolicy::new().with_timeout(Duration::from_secs(2)));
//!     let servers = vec![ServerDescriptor::new("css", "203.0.113.7:27015")?];
//!
//!     for report in engine.run(servers).await {
//!         println!("{} online={}", report.id, report.online);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod orchestrator;
pub mod report;
pub mod session;

pub use config::QueryPolicy;
pub use orchestrator::QueryEngine;
pub use report::{PhaseFailure, PhaseStatus, ServerReport, ServerStats};
pub use session::{Request, Session, SessionPool};
