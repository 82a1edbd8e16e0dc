mod attrs;
mod get;
mod list;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use xcm::ctl::client::CtlClient;
use xcm::ctl::{control_dir, socket_ctl_path};

use crate::exit::{ctl_error, CliResult};
use crate::output::OutputFormat;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List XCM sockets visible in the control directory.
    List(ListArgs),
    /// Read one attribute of a socket.
    Get(GetArgs),
    /// Read all attributes of a socket.
    Attrs(AttrsArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Control directory (default: $XCM_CTL or /run/xcm/ctl).
    #[arg(long, value_name = "DIR")]
    pub ctl_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Owning process id.
    pub pid: u32,
    /// Per-process socket id.
    pub sock_id: i64,
    /// Attribute name, e.g. `xcm.transport`.
    pub attr: String,

    #[arg(long, value_name = "DIR")]
    pub ctl_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AttrsArgs {
    /// Owning process id.
    pub pid: u32,
    /// Per-process socket id.
    pub sock_id: i64,

    #[arg(long, value_name = "DIR")]
    pub ctl_dir: Option<PathBuf>,
}

pub fn run(command: Command, format: OutputFormat, timeout_ms: u64) -> CliResult<i32> {
    match command {
        Command::List(args) => list::run(args, format, timeout_ms),
        Command::Get(args) => get::run(args, format, timeout_ms),
        Command::Attrs(args) => attrs::run(args, format, timeout_ms),
    }
}

pub(crate) fn resolve_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(control_dir)
}

pub(crate) fn connect_socket(
    dir: Option<PathBuf>,
    pid: u32,
    sock_id: i64,
    timeout_ms: u64,
) -> CliResult<CtlClient> {
    let path = socket_ctl_path(&resolve_dir(dir), pid, sock_id);
    let client = CtlClient::connect(&path)
        .map_err(|err| ctl_error(&format!("cannot reach socket {pid}-{sock_id}"), err))?;
    client
        .set_timeout(Some(Duration::from_millis(timeout_ms)))
        .map_err(|err| ctl_error("cannot apply timeout", err))?;
    Ok(client)
}
