use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ErrorKind, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum OpCode {
    /// OP_REPLY, sent by the server in response to OP_QUERY and OP_GET_MORE.
    Reply = 1,
    /// OP_QUERY.
    Query = 2004,
    /// OP_GET_MORE.
    GetMore = 2005,
    /// OP_MSG.
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    pub fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message: total length, request id, the id of the request
/// this message responds to, and the op code, each a little-endian i32.
#[derive(Debug, Clone)]
pub struct Header {
    /// Total message length in bytes, header included.
    pub length: i32,
    /// Client- or server-generated identifier for this message.
    pub request_id: i32,
    /// For server replies, the `request_id` of the message being answered.
    pub response_to: i32,
    /// The operation this message carries.
    pub op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    pub(crate) fn write_to<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_i32::<LittleEndian>(self.length)?;
        stream.write_i32::<LittleEndian>(self.request_id)?;
        stream.write_i32::<LittleEndian>(self.response_to)?;
        stream.write_i32::<LittleEndian>(self.op_code as i32)?;

        Ok(())
    }

    pub(crate) fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "Header requires {} bytes but only got {}",
                    Self::LENGTH,
                    data.len()
                ),
            }
            .into());
        }
        let mut cursor = Cursor::new(data);

        let length = cursor.read_i32::<LittleEndian>()?;
        let request_id = cursor.read_i32::<LittleEndian>()?;
        let response_to = cursor.read_i32::<LittleEndian>()?;
        let op_code = OpCode::from_i32(cursor.read_i32::<LittleEndian>()?)?;

        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}
