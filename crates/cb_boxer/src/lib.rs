//! cb_boxer: seals chat messages into boxes and opens them again
//!
//! # Unbox results
//! Unboxing never returns `Err`. Each box becomes exactly one
//! `UnboxedMessage`:
//! - `Valid`: header and body decoded, sender key checked (or provisional
//!   in quick mode until `Boxer::resolve`)
//! - `PermanentError`: the box will never open; keep it as an error record
//! - `TransientError`: the identity oracle could not answer; retry later
//!
//! # Shared state
//! The only state that outlives a call is the `ChainStore`: first-seen
//! header hashes per message ID and body-hash to message-ID bindings, both
//! per conversation.
//!
//! # Modules
//! - `boxer`   Box / unbox / resolve pipeline
//! - `chain`   Hash-chain integrity cache and replay bindings
//! - `oracle`  Key-validity oracle trait and the timeout-bounded gate
//! - `config`  JSON configuration
//! - `error`   Boxing, unbox, oracle and config errors

pub mod boxer;
pub mod chain;
pub mod config;
pub mod error;
pub mod oracle;

pub use boxer::{
    BoxArgs, Boxer, ConversationInfo, KeyStatus, PairwiseArgs, Resolved, UnboxKeys,
    UnboxedMessage, ValidMessage,
};
pub use chain::{ChainStore, MemoryChainStore};
pub use config::{BoxerConfig, UnboxMode};
pub use error::{BoxingError, ConfigError, OracleError, UnboxErrorKind, UnboxFailure};
pub use oracle::{KeyOracle, SenderDisplay, UserVersion};
