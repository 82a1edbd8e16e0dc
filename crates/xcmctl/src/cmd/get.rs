use serde::Serialize;

use crate::cmd::{connect_socket, GetArgs};
use crate::exit::{ctl_error, CliResult, SUCCESS};
use crate::output::{json_value, print_json, render_value, OutputFormat};

#[derive(Serialize)]
struct AttrOutput {
    pid: u32,
    sock_id: i64,
    name: String,
    value: serde_json::Value,
}

pub fn run(args: GetArgs, format: OutputFormat, timeout_ms: u64) -> CliResult<i32> {
    let mut client = connect_socket(args.ctl_dir, args.pid, args.sock_id, timeout_ms)?;

    let value = client
        .get_attr(&args.attr)
        .map_err(|err| ctl_error(&format!("cannot read {}", args.attr), err))?;

    match format {
        OutputFormat::Json => print_json(&AttrOutput {
            pid: args.pid,
            sock_id: args.sock_id,
            name: args.attr,
            value: json_value(&value),
        }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("{}", render_value(&value));
        }
    }

    Ok(SUCCESS)
}
