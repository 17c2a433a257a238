//! cb_proto: wire types, versioned plaintexts and serialisation for chat boxes
//!
//! Boxes and both sealed plaintexts are CBOR. The plaintexts are wrapped in
//! a versioned envelope so that newer formats fail closed with a
//! classifiable version error.
//!
//! # Modules
//! - `message`   Plaintext message types (header, body, identifiers)
//! - `envelope`  Boxed message as stored by the server
//! - `codec`     Versioned header/body plaintexts and CBOR encode/decode
//! - `version`   Boxed generations, capabilities and version ceilings

pub mod codec;
pub mod envelope;
pub mod message;
pub mod version;

pub use codec::{BodyPlaintext, CodecError, HeaderPlaintext};
pub use envelope::{BoxedMessage, EncryptedData, PairwiseMacs, ServerHeader, SignatureInfo};
pub use message::{
    ConversationId, ConversationIdTriple, MessageBody, MessageClientHeader, MessageId, MessageType,
    PlaintextMessage, PreviousPointer, UserId,
};
pub use version::{BoxedVersion, VersionKind, VersionLimits};
