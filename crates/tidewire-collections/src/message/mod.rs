mod bitbuffer;
mod message;
mod pool;

pub use bitbuffer::BitBuffer;
pub use message::{Message, DEFAULT_MAX_PAYLOAD_BYTES, MAX_HEADER_BYTES};
pub use pool::{Pool, DEFAULT_POOL_SIZE};
