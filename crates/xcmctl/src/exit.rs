use std::fmt;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;

/// A CLI failure: exit code plus user-facing message.
#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> CliError {
        CliError {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub fn ctl_error(context: &str, err: xcm::Error) -> CliError {
    CliError::new(FAILURE, format!("{context}: {err}"))
}

pub type CliResult<T> = Result<T, CliError>;
