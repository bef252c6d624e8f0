use std::fmt;

use once_cell::sync::Lazy;
use pe_core::{CompileError, Diagnostic, ProcError, Value};
use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, ParseError, Position, Scope, AST};
use tracing::warn;

use crate::bridge::{self, render};
use crate::connection;
use crate::context::CallContext;
use crate::procedure;

pub const LEGACY_RETURN_WARNING: &str =
    "implicit return of the final expression is deprecated, add an explicit `return`";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex compiles"));
static EXPLICIT_EXIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(return|throw)\b").expect("exit keyword regex compiles"));

const STATEMENT_PREFIXES: &[&str] = &[
    "let ", "const ", "fn ", "if ", "if(", "else", "for ", "while ", "while(", "loop", "do ",
    "switch ", "import ", "export ", "try", "//", "/*", "*", "}",
];

pub(crate) fn function_symbol(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 3);
    out.push_str("pe_");
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

/// Failure raised by host code, carried through the script engine so the
/// original error survives as the cause of the script failure.
#[derive(Debug, Clone)]
pub struct HostFailure(pub ProcError);

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct CompiledProcedure {
    name: String,
    symbol: String,
    arg_names: Vec<String>,
    ast: AST,
    warnings: Vec<Diagnostic>,
}

impl fmt::Debug for CompiledProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProcedure")
            .field("name", &self.name)
            .field("arg_names", &self.arg_names)
            .field("warnings", &self.warnings)
            .finish()
    }
}

impl CompiledProcedure {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_names(&self) -> &[String] {
        &self.arg_names
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }
}

/// Script result before the depth-1 unwrap decision.
#[derive(Clone)]
pub enum CallResult {
    Value(Value),
    Wrapped(Dynamic),
}

impl CallResult {
    pub fn is_wrapped(&self) -> bool {
        matches!(self, Self::Wrapped(_))
    }

    pub fn into_dynamic(self) -> Dynamic {
        match self {
            Self::Value(value) => bridge::wrap(value),
            Self::Wrapped(value) => value,
        }
    }

    pub fn into_value(self) -> Result<Value, ProcError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Wrapped(value) => bridge::unwrap(value),
        }
    }

    pub(crate) fn log_value(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Wrapped(value) => bridge::unwrap(value.clone()).unwrap_or(Value::Null),
        }
    }
}

pub fn compile(
    name: &str,
    arg_names: &[String],
    body: &str,
) -> Result<CompiledProcedure, CompileError> {
    let mut diagnostics = Vec::new();
    if name.trim().is_empty() {
        diagnostics.push(diagnostic(name, None, None, None, "procedure name is empty"));
    }
    for arg in arg_names {
        if !IDENTIFIER.is_match(arg) {
            diagnostics.push(diagnostic(
                name,
                None,
                None,
                None,
                &format!("binding name \"{}\" is not a valid identifier", arg),
            ));
        }
    }
    if !diagnostics.is_empty() {
        return Err(CompileError { diagnostics });
    }

    let (body, legacy) = apply_legacy_return(name, body);
    let symbol = function_symbol(name);
    let source = format!("fn {}({}) {{\n{}\n}}\n", symbol, arg_names.join(", "), body);

    let mut engine = Engine::new();
    engine.set_strict_variables(true);
    bridge::register_bridge(&mut engine);
    let ast = engine
        .compile(&source)
        .map_err(|error| CompileError {
            diagnostics: vec![parse_diagnostic(name, &body, &error)],
        })?;

    let mut warnings = Vec::new();
    if let Some(warning) = legacy {
        warn!(procedure = name, line = warning.line, "{}", LEGACY_RETURN_WARNING);
        warnings.push(warning);
    }

    Ok(CompiledProcedure {
        name: name.to_string(),
        symbol,
        arg_names: arg_names.to_vec(),
        ast,
        warnings,
    })
}

fn diagnostic(
    file: &str,
    line: Option<usize>,
    column: Option<usize>,
    source_line: Option<String>,
    message: &str,
) -> Diagnostic {
    Diagnostic {
        file: file.to_string(),
        line,
        column,
        source_line,
        message: message.to_string(),
    }
}

/// Parse positions count the generated function header as line 1.
fn parse_diagnostic(name: &str, body: &str, error: &ParseError) -> Diagnostic {
    let position = error.position();
    let line = position
        .line()
        .map(|line| line.saturating_sub(1).max(1))
        .filter(|line| *line <= body.lines().count().max(1));
    let source_line = line.and_then(|line| body.lines().nth(line - 1).map(str::to_string));
    diagnostic(
        name,
        line,
        position.position(),
        source_line,
        &error.err_type().to_string(),
    )
}

/// Turns a final bare expression into an explicit return. Older procedure
/// bodies rely on the value of their last line being returned.
fn apply_legacy_return(name: &str, body: &str) -> (String, Option<Diagnostic>) {
    let mut lines = body.lines().map(str::to_string).collect::<Vec<_>>();
    let Some(index) = lines.iter().rposition(|line| !line.trim().is_empty()) else {
        return (body.to_string(), None);
    };

    let original = lines[index].clone();
    let last = original.trim();
    if EXPLICIT_EXIT.is_match(last)
        || STATEMENT_PREFIXES
            .iter()
            .any(|prefix| last.starts_with(prefix))
        || last.ends_with('{')
        || last.ends_with(',')
    {
        return (body.to_string(), None);
    }

    let expression = last.trim_end_matches(';').trim_end();
    if expression.is_empty() {
        return (body.to_string(), None);
    }
    let indent = &original[..original.len() - original.trim_start().len()];
    lines[index] = format!("{}return {};", indent, expression);

    let warning = diagnostic(
        name,
        Some(index + 1),
        Some(indent.len() + 1),
        Some(original.clone()),
        LEGACY_RETURN_WARNING,
    );
    (lines.join("\n"), Some(warning))
}

pub fn execute(
    compiled: &CompiledProcedure,
    bound: Vec<Dynamic>,
    ctx: &CallContext,
) -> Result<CallResult, ProcError> {
    if bound.len() != compiled.arg_names.len() {
        return Err(ProcError::InvalidArgument {
            procedure: compiled.name.clone(),
            message: format!(
                "expected {} bound values, got {}",
                compiled.arg_names.len(),
                bound.len()
            ),
        });
    }

    let engine = execution_engine(ctx, &compiled.arg_names, &bound);
    let mut scope = Scope::new();
    let outcome = engine.call_fn::<Dynamic>(&mut scope, &compiled.ast, &compiled.symbol, bound);

    match outcome {
        Ok(result) if ctx.depth() <= 1 => bridge::unwrap(result)
            .map(CallResult::Value)
            .map_err(|cause| ProcError::RuntimeScript {
                procedure: compiled.name.clone(),
                message: "result cannot be returned to the caller".to_string(),
                cause: Some(Box::new(cause)),
            }),
        Ok(result) => Ok(CallResult::Wrapped(result)),
        Err(error) => Err(runtime_error(&compiled.name, &error)),
    }
}

fn execution_engine(ctx: &CallContext, names: &[String], bound: &[Dynamic]) -> Engine {
    let mut engine = Engine::new();
    bridge::register_bridge(&mut engine);

    let print_ctx = ctx.clone();
    engine.on_print(move |text| print_ctx.log_message(text));
    let debug_ctx = ctx.clone();
    engine.on_debug(move |text, _, _| debug_ctx.log_message(text));
    let log_ctx = ctx.clone();
    engine.register_fn("log", move |value: Dynamic| log_ctx.log_message(&render(&value)));

    engine
        .register_type_with_name::<HostFailure>("Error")
        .register_get("message", |failure: &mut HostFailure| failure.0.to_string())
        .register_get("code", |failure: &mut HostFailure| failure.0.code().to_string())
        .register_fn("to_string", |failure: &mut HostFailure| failure.0.to_string());

    connection::register_methods(&mut engine, bound);
    procedure::register_calls(&mut engine, names, bound);
    engine
}

fn innermost(error: &EvalAltResult) -> &EvalAltResult {
    match error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost(inner),
        other => other,
    }
}

fn line_of(position: Position) -> Option<usize> {
    position.line().map(|line| line.saturating_sub(1).max(1))
}

/// Maps a script failure to a runtime error, keeping a host failure that
/// caused it as the cause.
fn runtime_error(procedure: &str, error: &EvalAltResult) -> ProcError {
    let inner = innermost(error);
    let (message, cause) = match inner {
        EvalAltResult::ErrorRuntime(value, _) if value.is::<HostFailure>() => {
            let HostFailure(cause) = value.clone().cast::<HostFailure>();
            (cause.to_string(), Some(Box::new(cause)))
        }
        EvalAltResult::ErrorRuntime(value, _) => (render(value), None),
        other => (other.to_string(), None),
    };
    let message = match line_of(inner.position()) {
        Some(line) => format!("{} (line {})", message, line),
        None => message,
    };
    ProcError::RuntimeScript {
        procedure: procedure.to_string(),
        message,
        cause,
    }
}
