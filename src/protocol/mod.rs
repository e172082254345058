//! Wire protocol shared by nodes and clients
//!
//! One TCP connection carries exactly one exchange: the caller writes a
//! signed [`Message`], the callee writes back one [`Reply`], and both sides
//! close. Documents are newline-framed JSON (see [`codec`]).

pub mod codec;
pub mod message;
pub mod reply;

pub use codec::{read_document, write_document};
pub use message::{
    AbortPayload, CoordinatorPayload, Message, MessageType, QueryPayload, TxnPayload,
};
pub use reply::{Reply, Vote};
