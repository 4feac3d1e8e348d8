//! # Game Server Query Protocols
//!
//! This library holds everything needed to talk to a game server except the
//! sockets: the byte cursor used by every parser, the protocol definition
//! contract, split-response reassembly and the result accumulator that
//! definitions fill in. The `engine` crate drives these definitions over the
//! network.
//!
//! ## Protocol Definitions
//!
//! A [`Protocol`] is a value built from function pointers:
//! - a packet template per query phase, with substitution points for the
//!   challenge token and target address
//! - a signature → parser table that routes each reassembled payload
//! - optional hooks for the challenge round, pre-send preparation, split
//!   detection, fragment joining and completion checks
//! - an alias table mapping protocol-specific field names onto a shared schema
//!
//! Game titles that speak a family's protocol reuse the family constructor and
//! override the name, port offset or one of the hooks.
//!
//! ## Module Organization
//!
//! ### Buffer Module (`buffer`)
//! Forward-only cursor over a received payload with endian-aware integer reads,
//! delimited and length-prefixed strings.
//!
//! ### Definition Module (`definition`)
//! The [`Protocol`] contract: query port derivation, challenge handling,
//! payload assembly and signature dispatch.
//!
//! ### Reassembly Module (`reassembly`)
//! Fragment ordering, bzip2 decompression with length and CRC32 checks, and
//! the boundary de-duplicating join used by GameSpy-style protocols.
//!
//! ### Result and Normalize Modules (`result`, `normalize`)
//! The per-server [`QueryResult`] accumulator and the alias tables applied to it
//! once all phases are parsed.
//!
//! ### Games Module (`games`)
//! Bundled definitions: Source/GoldSource A2S, Quake 3 and GameSpy 3.
//!
//! ## Usage Example
//!
//! ```rust
//! use protocol::{Phase, Registry, Value};
//!
//! let registry = Registry::with_builtin();
//! let quake = registry.create("quake3").unwrap();
//! assert_eq!(quake.packets().query_phases(), vec![Phase::Status]);
//!
//! let reply = b"\xFF\xFF\xFF\xFFstatusResponse\n\\sv_hostname\\lan party\n".to_vec();
//! let result = quake.process_phase(&[reply]).unwrap();
//! assert_eq!(result.get("sv_hostname"), Some(&Value::from("lan party")));
//! ```

pub mod buffer;
pub mod context;
pub mod definition;
pub mod error;
pub mod filter;
pub mod games;
pub mod normalize;
pub mod phase;
pub mod reassembly;
pub mod registry;
pub mod result;
pub mod server;
pub mod template;

pub use buffer::{Buffer, Endian, LengthPrefix};
pub use context::RunContext;
pub use definition::{Completion, PhaseResponse, ProcessedResponse, Protocol};
pub use error::{QueryError, Result};
pub use filter::{Filter, StripColors};
pub use normalize::{canonical, Normalization};
pub use phase::{Phase, Transport};
pub use reassembly::{Datagram, Fragment};
pub use registry::Registry;
pub use result::{QueryResult, Record, SubGroup, Value};
pub use server::{QueryTarget, ServerDescriptor, ServerOptions};
pub use template::{Packets, Template};
