pub mod id;
pub mod wire;

pub use id::{GroupId, IdParseError, MemberId};
pub use wire::{Envelope, MsgKind, WireError};
