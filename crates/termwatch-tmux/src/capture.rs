//! Viewport capture.

use crate::error::TmuxError;
use crate::executor::TmuxCommandRunner;

/// Capture the last `lines` lines of a session's active pane as one string.
///
/// With `strip_ansi` the text comes back plain; otherwise `-e` keeps escape
/// sequences for colour and attributes.
pub fn capture_pane<R: TmuxCommandRunner + ?Sized>(
    runner: &R,
    target: &str,
    lines: u32,
    strip_ansi: bool,
) -> Result<String, TmuxError> {
    if target.is_empty() || target.starts_with('-') {
        return Err(TmuxError::InvalidTarget(target.to_string()));
    }
    let start_line = format!("-{lines}");
    let mut args = vec!["capture-pane", "-p"];
    if !strip_ansi {
        args.push("-e");
    }
    args.extend(["-S", start_line.as_str(), "-t", target]);
    let output = runner.run(&args)?;
    Ok(output.trim_end_matches('\n').to_string())
}
