use std::ffi::OsString;

use clap::Parser;
use pe_api::{
    check_library, load_library, CallOptions, Library, LoadLibraryOptions, Value, ValueMap,
};
use tracing_subscriber::EnvFilter;

mod cli_args;
mod error_map;
mod output;
mod source_loader;

pub(crate) use cli_args::{CheckArgs, Cli, ListArgs, Mode, RunArgs};
pub(crate) use error_map::{
    emit_error, json_string, map_cli_arg_invalid, map_cli_source_path, map_cli_source_read,
    map_cli_source_scan, CliError,
};
pub(crate) use output::{emit_check, emit_listing, emit_log, emit_value};
pub(crate) use source_loader::load_definitions;
#[cfg(test)]
pub(crate) use source_loader::{collect_definition_files, resolve_definitions_path};

/// Installs the stderr subscriber. `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run_cli_from_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return error.exit_code();
        }
    };
    match run(cli) {
        Ok(code) => code,
        Err(error) => emit_error(error),
    }
}

fn run(cli: Cli) -> Result<i32, CliError> {
    match cli.command {
        Mode::Run(args) => run_procedure(args),
        Mode::Check(args) => run_check(args),
        Mode::List(args) => run_list(args),
    }
}

fn open_library(definitions: &str, call_options: CallOptions) -> Result<Library, CliError> {
    let definitions = load_definitions(definitions)?;
    let options = LoadLibraryOptions {
        call_options,
        ..LoadLibraryOptions::default()
    };
    Ok(load_library(&definitions, &options)?)
}

fn run_procedure(args: RunArgs) -> Result<i32, CliError> {
    let mut call_options = CallOptions::default();
    if let Some(max_depth) = args.max_depth {
        call_options.max_depth = max_depth;
    }
    let library = open_library(&args.definitions, call_options)?;

    let invocation = if args.named.is_empty() {
        library.invoke(&args.procedure, parse_positional(&args.args)?)
    } else {
        library.invoke_named(&args.procedure, parse_named(&args.named)?)
    };
    library.close_pools();

    let code = match invocation.result {
        Ok(value) => {
            emit_value(&value);
            0
        }
        Err(error) => emit_error(error.into()),
    };
    if !args.no_log {
        emit_log(&invocation.log);
    }
    Ok(code)
}

fn run_check(args: CheckArgs) -> Result<i32, CliError> {
    let library = open_library(&args.definitions, CallOptions::default())?;
    let reports = check_library(&library);
    library.close_pools();

    if emit_check(&reports) {
        println!("RESULT:OK");
        Ok(0)
    } else {
        let failed = reports.iter().filter(|report| !report.is_ok()).count();
        Err(CliError::new(
            "CLI_CHECK_FAILED",
            format!("{} of {} procedures failed to check", failed, reports.len()),
        ))
    }
}

fn run_list(args: ListArgs) -> Result<i32, CliError> {
    let definitions = load_definitions(&args.definitions)?;
    emit_listing(&definitions);
    Ok(0)
}

pub(crate) fn parse_json_argument(label: &str, raw: &str) -> Result<Value, CliError> {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .map_err(|error| map_cli_arg_invalid(label, error))
}

pub(crate) fn parse_positional(raw: &[String]) -> Result<Vec<Value>, CliError> {
    raw.iter()
        .enumerate()
        .map(|(index, text)| parse_json_argument(&format!("#{}", index + 1), text))
        .collect()
}

pub(crate) fn parse_named(raw: &[String]) -> Result<ValueMap, CliError> {
    let mut named = ValueMap::new();
    for entry in raw {
        let Some((name, text)) = entry.split_once('=') else {
            return Err(CliError::new(
                "CLI_ARG_INVALID",
                format!("named argument \"{}\" must look like name=<json>", entry),
            ));
        };
        named.insert(name.trim().to_string(), parse_json_argument(name, text)?);
    }
    Ok(named)
}

#[cfg(test)]
mod tests;
