use bson::{Bson, Document};

use crate::error::{CommandError, ErrorKind, Result};

/// Inspects a command reply document and surfaces a non-ok status as the command error it
/// describes.
pub(super) fn check_command_response(response: &Document, namespace: &str) -> Result<()> {
    if is_ok(response) {
        return Ok(());
    }

    let message = response.get_str("errmsg").unwrap_or("unknown error");

    Err(ErrorKind::Command(CommandError {
        code: response.get_i32("code").unwrap_or_default(),
        code_name: response.get_str("codeName").unwrap_or_default().to_string(),
        message: format!("command on namespace {} failed: {}", namespace, message),
    })
    .into())
}

fn is_ok(response: &Document) -> bool {
    match response.get("ok") {
        Some(Bson::Double(ok)) => *ok == 1.0,
        Some(Bson::Int32(ok)) => *ok == 1,
        Some(Bson::Int64(ok)) => *ok == 1,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}
