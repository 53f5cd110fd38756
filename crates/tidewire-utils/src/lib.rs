pub mod error;
pub mod seq;
pub mod varint;
pub mod wire;

pub use error::{CodecError, CodecResult, ProtoError, ProtoResult};
pub use wire::{ConnectionState, DisconnectReason, HeaderKind, RejectReason, SendMode};
