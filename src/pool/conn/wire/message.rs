use bitflags::bitflags;
use bson::Document;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::error::{CommandError, ErrorKind, Result};

bitflags! {
    /// The OP_QUERY flag bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct QueryFlags: u32 {
        /// Leave the cursor open on the server after the initial batch is exhausted.
        const TAILABLE_CURSOR = 0b0000_0010;

        /// Allow reads from secondary replica set members.
        const SECONDARY_OK = 0b0000_0100;

        /// Do not time out an idle cursor.
        const NO_CURSOR_TIMEOUT = 0b0001_0000;

        /// Block for a while rather than returning no data for a tailable cursor.
        const AWAIT_DATA = 0b0010_0000;

        /// Stream replies without waiting for further requests. Replies to an exhaust query
        /// do not echo a request id, so they must be received without id correlation.
        const EXHAUST = 0b0100_0000;

        /// Return partial results if some shards are down.
        const PARTIAL = 0b1000_0000;
    }
}

bitflags! {
    /// The OP_REPLY response flag bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ReplyFlags: u32 {
        /// The cursor id named in the request is no longer live on the server.
        const CURSOR_NOT_FOUND = 0b0000_0001;

        /// The query failed; the reply carries a single document describing the failure.
        const QUERY_FAILURE = 0b0000_0010;

        /// The server supports the AWAIT_DATA query flag.
        const AWAIT_CAPABLE = 0b0000_1000;
    }
}

/// Represents an OP_QUERY wire protocol operation.
#[derive(Clone, Debug)]
pub struct Query {
    /// Flag bits for this query.
    pub flags: QueryFlags,
    /// The fully qualified `<db>.<collection>` namespace the query targets.
    pub namespace: String,
    /// Number of leading documents to skip.
    pub number_to_skip: i32,
    /// Batch size; `-1` requests a single-document reply with the cursor closed.
    pub number_to_return: i32,
    /// The query document.
    pub body: Document,
}

impl Query {
    /// Encodes this query into a complete length-prefixed message, returning the request id
    /// assigned to it along with the bytes.
    pub fn encode(&self) -> Result<(i32, Vec<u8>)> {
        let mut body_bytes = Vec::new();
        self.body.to_writer(&mut body_bytes)?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + self.namespace.len()
            + 1
            + 2 * std::mem::size_of::<i32>()
            + body_bytes.len();

        let request_id = util::next_request_id();
        let header = Header {
            length: total_length as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };

        let mut message = Vec::with_capacity(total_length);
        header.write_to(&mut message)?;
        message.write_u32::<LittleEndian>(self.flags.bits())?;
        util::write_cstring(&mut message, &self.namespace)?;
        message.write_i32::<LittleEndian>(self.number_to_skip)?;
        message.write_i32::<LittleEndian>(self.number_to_return)?;
        message.extend_from_slice(&body_bytes);

        Ok((request_id, message))
    }
}

/// Represents the body of an OP_REPLY wire protocol operation.
#[derive(Clone, Debug)]
pub struct Reply {
    /// Response flag bits.
    pub response_flags: ReplyFlags,
    /// The id of the server-side cursor, or 0 when none remains open.
    pub cursor_id: i64,
    /// Offset of the first returned document within the cursor.
    pub starting_from: i32,
    /// The returned documents.
    pub documents: Vec<Document>,
}

impl Reply {
    /// Parses a reply from the payload of a message whose header named OP_REPLY. A reply with
    /// the QueryFailure flag set is surfaced as the command error it describes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = payload;

        let response_flags = ReplyFlags::from_bits_truncate(reader.read_u32::<LittleEndian>()?);
        let cursor_id = reader.read_i64::<LittleEndian>()?;
        let starting_from = reader.read_i32::<LittleEndian>()?;
        let number_returned = reader.read_i32::<LittleEndian>()?;

        let mut documents = Vec::new();
        for _ in 0..number_returned {
            documents.push(Document::from_reader(&mut reader)?);
        }

        if response_flags.contains(ReplyFlags::QUERY_FAILURE) {
            let failure = documents.first();
            return Err(ErrorKind::Command(CommandError {
                code: failure
                    .and_then(|doc| doc.get_i32("code").ok())
                    .unwrap_or_default(),
                code_name: Default::default(),
                message: failure
                    .and_then(|doc| doc.get_str("$err").ok())
                    .unwrap_or("query failure with no error document")
                    .to_string(),
            })
            .into());
        }

        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}
