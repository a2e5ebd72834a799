use std::{
    io::Write,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::error::Result;

/// Returns a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Serializes `string` to bytes and writes them to `writer` with a null terminator appended.
pub(super) fn write_cstring<W: Write>(writer: &mut W, string: &str) -> Result<()> {
    writer.write_all(string.as_bytes())?;
    writer.write_all(&[0])?;

    Ok(())
}
