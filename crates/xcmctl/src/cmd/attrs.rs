use std::collections::BTreeMap;

use crate::cmd::{connect_socket, AttrsArgs};
use crate::exit::{ctl_error, CliResult, SUCCESS};
use crate::output::{json_value, print_json, print_table, render_value, OutputFormat};

pub fn run(args: AttrsArgs, format: OutputFormat, timeout_ms: u64) -> CliResult<i32> {
    let mut client = connect_socket(args.ctl_dir, args.pid, args.sock_id, timeout_ms)?;

    let attrs = client
        .get_all_attrs()
        .map_err(|err| ctl_error("cannot read attributes", err))?;

    match format {
        OutputFormat::Json => {
            let map: BTreeMap<String, serde_json::Value> = attrs
                .iter()
                .map(|(name, value)| (name.clone(), json_value(value)))
                .collect();
            print_json(&map);
        }
        OutputFormat::Table => print_table(
            vec!["ATTRIBUTE", "TYPE", "VALUE"],
            attrs
                .iter()
                .map(|(name, value)| {
                    vec![
                        name.clone(),
                        value.attr_type().name().to_string(),
                        render_value(value),
                    ]
                })
                .collect(),
        ),
        OutputFormat::Pretty => {
            for (name, value) in &attrs {
                println!("{name} = {}", render_value(value));
            }
        }
    }

    Ok(SUCCESS)
}
