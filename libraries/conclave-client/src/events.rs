use conclave_structs::{GroupId, MemberId};

/// Domain events delivered to the host application.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The transport came up or went down.
    ConnectionChange(bool),
    /// The server rotated the group access key; this is the new invite token.
    KeyUpdate(GroupId),
    /// A text message crossed the wire. `sender` is absent for locally sent
    /// messages.
    Message {
        sender: Option<MemberId>,
        body: String,
        from_self: bool,
    },
}
