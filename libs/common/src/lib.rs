pub mod id;
pub mod room;

pub use id::PrefixedId;
pub use room::{RoomId, RoomKind};
