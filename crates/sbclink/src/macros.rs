//! The macro feeder.
//!
//! When the firmware requests a macro, the Processor pushes the channel
//! frame and forwards the request here. The feeder thread reads the file,
//! pushes its codes one by one onto the requesting channel (which now has
//! the macro frame on top) and then signals completion, success or not.

use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use sbclink_link::{LinkHandle, Outcome};
use sbclink_packet::{parse, CodeChannel};

/// One firmware macro request, forwarded from the event sink.
pub struct MacroRequest {
    pub channel: CodeChannel,
    pub filename: String,
    pub report_missing: bool,
}

/// Spawn the feeder thread. It stops when the sender side hangs up.
pub fn spawn(
    handle: LinkHandle,
    macros_dir: PathBuf,
    requests: Receiver<MacroRequest>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("macro-feeder".into())
        .spawn(move || {
            while let Ok(request) = requests.recv() {
                feed(&handle, &macros_dir, request);
            }
        })
}

fn feed(handle: &LinkHandle, macros_dir: &Path, request: MacroRequest) {
    let Some(path) = resolve(macros_dir, &request.filename) else {
        warn!(filename = %request.filename, "refusing macro path outside the macro directory");
        handle.macro_finished(request.channel, false);
        return;
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            if request.report_missing {
                warn!(path = %path.display(), %err, "macro file unavailable");
                handle.macro_finished(request.channel, false);
            } else {
                debug!(path = %path.display(), "optional macro file not present");
                handle.macro_finished(request.channel, true);
            }
            return;
        }
    };

    let mut failed = false;
    for (line_number, line) in content.lines().enumerate() {
        let mut code = match parse(line, request.channel) {
            Ok(code) => code,
            Err(sbclink_packet::CodeParseError::Empty) => continue,
            Err(err) => {
                warn!(path = %path.display(), line_number, %err, "skipping unparsable macro line");
                continue;
            }
        };
        code.line_number = Some(line_number as i32 + 1);

        // Macro codes run strictly in file order.
        match handle.push_code(code).wait() {
            Outcome::Completed(result) if result.success => {}
            Outcome::Completed(result) => {
                warn!(path = %path.display(), line_number, reply = %result.reply, "macro code failed");
                failed = true;
                break;
            }
            Outcome::Aborted | Outcome::Cancelled => {
                debug!(path = %path.display(), "macro aborted");
                return;
            }
        }
    }

    handle.macro_finished(request.channel, !failed);
}

/// Resolve a firmware-supplied filename strictly inside `macros_dir`.
pub(crate) fn resolve(macros_dir: &Path, filename: &str) -> Option<PathBuf> {
    let relative = Path::new(filename);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(macros_dir.join(relative))
}

/// The sender half handed to the event sink.
pub type MacroSender = Sender<MacroRequest>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        let dir = Path::new("/opt/sbclink/sys");
        assert!(resolve(dir, "../etc/passwd").is_none());
        assert!(resolve(dir, "/etc/passwd").is_none());
        assert_eq!(
            resolve(dir, "homing/homeall.g"),
            Some(PathBuf::from("/opt/sbclink/sys/homing/homeall.g"))
        );
    }
}
