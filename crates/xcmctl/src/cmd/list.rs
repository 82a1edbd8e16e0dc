use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use xcm::ctl::client::{enumerate, CtlClient};

use crate::cmd::{resolve_dir, ListArgs};
use crate::exit::{ctl_error, CliResult, SUCCESS};
use crate::output::{print_json, print_table, render_value, OutputFormat};

#[derive(Serialize)]
struct SocketRow {
    pid: u32,
    sock_id: i64,
    sock_type: Option<String>,
    transport: Option<String>,
    local_addr: Option<String>,
    remote_addr: Option<String>,
    alive: bool,
}

pub fn run(args: ListArgs, format: OutputFormat, timeout_ms: u64) -> CliResult<i32> {
    let dir = resolve_dir(args.ctl_dir);
    let entries =
        enumerate(&dir).map_err(|err| ctl_error(&format!("cannot read {}", dir.display()), err))?;

    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut row = SocketRow {
            pid: entry.pid,
            sock_id: entry.sock_id,
            sock_type: None,
            transport: None,
            local_addr: None,
            remote_addr: None,
            alive: false,
        };

        match query(&entry.path, timeout_ms) {
            Ok(attrs) => {
                row.alive = true;
                for (name, value) in attrs {
                    let rendered = render_value(&value);
                    match name.as_str() {
                        "xcm.type" => row.sock_type = Some(rendered),
                        "xcm.transport" => row.transport = Some(rendered),
                        "xcm.local_addr" => row.local_addr = Some(rendered),
                        "xcm.remote_addr" => row.remote_addr = Some(rendered),
                        _ => {}
                    }
                }
            }
            Err(err) => {
                // Stale listener files are expected after crashes.
                debug!(path = %entry.path.display(), "socket not responding: {err}");
            }
        }

        rows.push(row);
    }

    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Table => print_table(
            vec!["PID", "SOCK", "TYPE", "TRANSPORT", "LOCAL", "REMOTE"],
            rows.iter()
                .map(|row| {
                    vec![
                        row.pid.to_string(),
                        row.sock_id.to_string(),
                        cell(&row.sock_type, row.alive),
                        cell(&row.transport, row.alive),
                        cell(&row.local_addr, row.alive),
                        cell(&row.remote_addr, row.alive),
                    ]
                })
                .collect(),
        ),
        OutputFormat::Pretty => {
            for row in &rows {
                println!(
                    "{}-{} type={} transport={} local={} remote={}",
                    row.pid,
                    row.sock_id,
                    cell(&row.sock_type, row.alive),
                    cell(&row.transport, row.alive),
                    cell(&row.local_addr, row.alive),
                    cell(&row.remote_addr, row.alive),
                );
            }
        }
    }

    Ok(SUCCESS)
}

fn cell(value: &Option<String>, alive: bool) -> String {
    match value {
        Some(value) => value.clone(),
        None if alive => "-".to_string(),
        None => "dead".to_string(),
    }
}

fn query(
    path: &std::path::Path,
    timeout_ms: u64,
) -> xcm::Result<Vec<(String, xcm::AttrValue)>> {
    let mut client = CtlClient::connect(path)?;
    client.set_timeout(Some(Duration::from_millis(timeout_ms)))?;
    client.get_all_attrs()
}
