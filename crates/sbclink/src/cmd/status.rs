use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};

use crate::cmd::StatusArgs;
use crate::config::Config;
use crate::exit::{DaemonError, DaemonResult, SUCCESS, TRANSPORT_FATAL};

pub fn run(args: StatusArgs) -> DaemonResult<i32> {
    let config = Config::load(args.config.as_deref())?;
    let socket_path = args.socket_path.unwrap_or(config.socket_path);

    let stream = UnixStream::connect(&socket_path).map_err(|err| {
        DaemonError::new(
            TRANSPORT_FATAL,
            format!("cannot connect to {}: {err}", socket_path.display()),
        )
    })?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(|err| DaemonError::new(TRANSPORT_FATAL, err.to_string()))?;

    let mut writer = stream
        .try_clone()
        .map_err(|err| DaemonError::new(TRANSPORT_FATAL, err.to_string()))?;
    writer
        .write_all(b"{\"command\":\"diagnostics\"}\n")
        .map_err(|err| DaemonError::new(TRANSPORT_FATAL, err.to_string()))?;

    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .map_err(|err| DaemonError::new(TRANSPORT_FATAL, err.to_string()))?;

    let reply: serde_json::Value = serde_json::from_str(&line)
        .map_err(|err| DaemonError::new(TRANSPORT_FATAL, format!("bad reply: {err}")))?;
    if let Some(error) = reply.get("error").and_then(|e| e.as_str()) {
        return Err(DaemonError::new(TRANSPORT_FATAL, error.to_owned()));
    }
    let diagnostics = reply
        .get("result")
        .ok_or_else(|| DaemonError::new(TRANSPORT_FATAL, "reply without result"))?;

    print_summary(diagnostics);
    print_channels(diagnostics);
    Ok(SUCCESS)
}

fn print_summary(diagnostics: &serde_json::Value) {
    let field = |name: &str| diagnostics.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
    let connected = diagnostics
        .get("connected")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    println!(
        "link: {} | transfers {} | retries {} | stalls {} | resets {} | fw buffer {} B",
        if connected { "up" } else { "down" },
        field("transfers"),
        field("retries"),
        field("stalls"),
        field("resets"),
        field("buffer_space"),
    );
}

fn print_channels(diagnostics: &serde_json::Value) {
    let Some(channels) = diagnostics.get("channels").and_then(|c| c.as_array()) else {
        return;
    };

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED).set_header([
        "Channel", "Stack", "Pending", "In flight", "Suspended", "Flush", "Locks", "Pushed",
        "Done", "Errors",
    ]);

    for channel in channels {
        let text = |name: &str| {
            channel
                .get(name)
                .map(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| v.to_string())
                })
                .unwrap_or_default()
        };
        table.add_row([
            Cell::new(text("channel")),
            Cell::new(text("stack_depth")),
            Cell::new(text("pending")),
            Cell::new(text("in_flight")),
            Cell::new(text("suspended")),
            Cell::new(text("flush_waiters")),
            Cell::new(text("lock_waiters")),
            Cell::new(text("total_pushed")),
            Cell::new(text("total_completed")),
            Cell::new(text("protocol_errors")),
        ]);
    }

    println!("{table}");
}
