//! The length-prefixed binary framing of the wire protocol.

mod header;
mod message;
pub(crate) mod util;


pub use self::{
    header::{Header, OpCode},
    message::{Query, QueryFlags, Reply, ReplyFlags},
};
