use std::fmt::Display;

use pe_core::ProcError;
use thiserror::Error;

/// Failure reported on stdout. Library errors keep their code and causes.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub(crate) struct CliError {
    pub(crate) code: String,
    pub(crate) message: String,
    pub(crate) causes: Vec<String>,
}

impl CliError {
    pub(crate) fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl From<ProcError> for CliError {
    fn from(error: ProcError) -> Self {
        let mut chain = error.cause_chain().into_iter();
        let message = chain.next().unwrap_or_default();
        Self {
            code: error.code().to_string(),
            message,
            causes: chain.collect(),
        }
    }
}

fn map_error(code: &str, error: impl Display) -> CliError {
    CliError::new(code, error.to_string())
}

pub(crate) fn json_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

pub(crate) fn emit_error(error: CliError) -> i32 {
    println!("RESULT:ERROR");
    println!("ERROR_CODE:{}", error.code);
    println!("ERROR_MSG_JSON:{}", json_string(&error.message));
    for cause in &error.causes {
        println!("CAUSE_JSON:{}", json_string(cause));
    }
    1
}

pub(crate) fn map_cli_source_path(error: std::io::Error) -> CliError {
    map_error("CLI_SOURCE_PATH", error)
}

pub(crate) fn map_cli_source_scan(error: walkdir::Error) -> CliError {
    map_error("CLI_SOURCE_SCAN", error)
}

pub(crate) fn map_cli_source_read(error: std::io::Error) -> CliError {
    map_error("CLI_SOURCE_READ", error)
}

pub(crate) fn map_cli_arg_invalid(argument: &str, error: impl Display) -> CliError {
    CliError::new(
        "CLI_ARG_INVALID",
        format!("argument {} is not valid JSON: {}", argument, error),
    )
}
