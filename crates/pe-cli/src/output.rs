use pe_api::{CheckReport, Definitions, LogEntry, Value};

use crate::json_string;

fn value_json(value: &Value) -> String {
    value.to_json().to_string()
}

fn values_json(values: &[Value]) -> String {
    Value::List(values.to_vec()).to_json().to_string()
}

pub(crate) fn log_line(entry: &LogEntry) -> String {
    let (kind, payload) = match entry {
        LogEntry::Request { args, .. } => ("REQUEST", values_json(args)),
        LogEntry::Response { result, .. } => ("RESPONSE", value_json(result)),
        LogEntry::Error { causes, .. } => (
            "ERROR",
            serde_json::to_string(causes).unwrap_or_else(|_| "[]".to_string()),
        ),
        LogEntry::Message { text, .. } => ("MESSAGE", json_string(text)),
    };
    format!(
        "LOG:{}|{}|{}|{}",
        entry.depth(),
        kind,
        entry.signature(),
        payload
    )
}

pub(crate) fn emit_log(log: &[LogEntry]) {
    for entry in log {
        println!("{}", log_line(entry));
    }
}

pub(crate) fn emit_value(value: &Value) {
    println!("RESULT:OK");
    println!("VALUE_JSON:{}", value_json(value));
}

/// Prints one block per procedure and returns whether every check passed.
pub(crate) fn emit_check(reports: &[CheckReport]) -> bool {
    let mut passed = true;
    for report in reports {
        println!(
            "CHECK:{}|{}",
            report.id,
            if report.is_ok() { "OK" } else { "FAILED" }
        );
        for warning in &report.warnings {
            println!("WARNING_JSON:{}|{}", report.id, json_string(&warning.to_string()));
        }
        for error in &report.errors {
            println!(
                "ERROR:{}|{}|{}",
                report.id,
                error.code(),
                json_string(&error.to_string())
            );
        }
        passed &= report.is_ok();
    }
    passed
}

pub(crate) fn emit_listing(definitions: &Definitions) {
    println!("RESULT:OK");
    for (name, pool) in &definitions.pools {
        println!("POOL:{}|{}", name, pool.channel_type);
    }
    for procedure in &definitions.procedures {
        let arguments = procedure
            .arguments()
            .map(|binding| binding.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        println!("PROCEDURE:{}|{}", procedure.id, arguments);
    }
}
