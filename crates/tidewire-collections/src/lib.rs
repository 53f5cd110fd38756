pub mod active_peers;
pub mod bitfield;
pub mod message;
pub mod rolling_stat;

pub use bitfield::Bitfield;
pub use message::{BitBuffer, Message, Pool};
pub use rolling_stat::RollingStat;
