//! Shared subprocess plumbing for the store toolchain and the archive
//! (de)compressor.

use std::process::Stdio;

use bstr::BStr;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::Error;

/// Truncation limit for raw output embedded in errors.
const RAW_EXCERPT_LEN: usize = 1024;

/// Run an external tool to completion, capturing stdout and stderr.
///
/// A non-zero exit yields [Error::ExternalToolFailure] carrying the operation
/// name and the captured stderr; failing to spawn at all (tool not on PATH)
/// is reported the same way.
pub async fn run_tool(op: &'static str, command: &mut Command) -> Result<Vec<u8>, Error> {
    debug!(op, command = ?command.as_std(), "running external tool");

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::ExternalToolFailure {
            op,
            status: -1,
            stderr: format!("failed to spawn: {e}"),
        })?;

    if !output.status.success() {
        let stderr = BStr::new(&output.stderr);
        warn!(op, status = %output.status, stderr = %stderr, "external tool failed");
        return Err(Error::ExternalToolFailure {
            op,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        });
    }

    Ok(output.stdout)
}

/// Parse the stdout of an external tool as JSON of the expected shape.
pub fn parse_stdout<T: DeserializeOwned>(op: &'static str, stdout: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(stdout).map_err(|_| Error::ExternalOutputMalformed {
        op,
        raw: excerpt(stdout),
    })
}

pub(crate) fn excerpt(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    let mut s = s.into_owned();
    if s.len() > RAW_EXCERPT_LEN {
        let mut cut = RAW_EXCERPT_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}
