use std::fmt;

use thiserror::Error;

/// One reported compile problem, located in the procedure body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub source_line: Option<String>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        write!(f, ": {}", self.message)?;
        if let Some(source_line) = &self.source_line {
            write!(f, "\n    {}", source_line.trim_end())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self
            .diagnostics
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        write!(f, "compile failed: {}", lines.join("\n"))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProcError {
    #[error("invalid configuration for \"{target}\": {message}")]
    Configuration { target: String, message: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("procedure \"{procedure}\" failed: {message}")]
    RuntimeScript {
        procedure: String,
        message: String,
        #[source]
        cause: Option<Box<ProcError>>,
    },

    #[error("call to \"{method}\" failed: {message}")]
    CallDispatch {
        method: String,
        message: String,
        #[source]
        cause: Option<Box<ProcError>>,
    },

    #[error("pool \"{pool}\" had no free channel within {waited_ms} ms")]
    ResourceExhausted { pool: String, waited_ms: u64 },

    #[error("channel invalid: {message}")]
    ChannelInvalid { message: String },

    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid arguments for \"{procedure}\": {message}")]
    InvalidArgument { procedure: String, message: String },

    #[error("{message}")]
    Host { message: String },
}

impl ProcError {
    pub fn configuration(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn dispatch(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CallDispatch {
            method: method.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn channel_invalid(message: impl Into<String>) -> Self {
        Self::ChannelInvalid {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self::Host {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "POOL_CONFIG",
            Self::Compile(_) => "SCRIPT_COMPILE",
            Self::RuntimeScript { .. } => "SCRIPT_RUNTIME",
            Self::CallDispatch { .. } => "CALL_DISPATCH",
            Self::ResourceExhausted { .. } => "POOL_EXHAUSTED",
            Self::ChannelInvalid { .. } => "CHANNEL_INVALID",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Host { .. } => "HOST_FAILURE",
        }
    }

    pub fn cause(&self) -> Option<&ProcError> {
        match self {
            Self::RuntimeScript { cause, .. } | Self::CallDispatch { cause, .. } => {
                cause.as_deref()
            }
            _ => None,
        }
    }

    /// This error's message followed by the messages of every nested cause.
    pub fn cause_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current = self.cause();
        while let Some(cause) = current {
            chain.push(cause.to_string());
            current = cause.cause();
        }
        chain
    }

    /// Innermost error of the chain.
    pub fn root_cause(&self) -> &ProcError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn diagnostics_render_location_and_source_line() {
        let error = CompileError {
            diagnostics: vec![Diagnostic {
                file: "demo/add".to_string(),
                line: Some(2),
                column: Some(5),
                source_line: Some("let x = ;".to_string()),
                message: "Expecting expression".to_string(),
            }],
        };
        let text = error.to_string();
        assert!(text.contains("demo/add:2:5: Expecting expression"));
        assert!(text.contains("    let x = ;"));
        assert_eq!(ProcError::from(error).code(), "SCRIPT_COMPILE");
    }

    #[test]
    fn cause_chain_walks_nested_failures() {
        let error = ProcError::RuntimeScript {
            procedure: "outer".to_string(),
            message: "nested call failed".to_string(),
            cause: Some(Box::new(ProcError::CallDispatch {
                method: "connection/kv#get".to_string(),
                message: "boom".to_string(),
                cause: Some(Box::new(ProcError::host("disk gone"))),
            })),
        };
        let chain = error.cause_chain();
        assert_eq!(chain.len(), 3);
        assert!(chain[1].contains("connection/kv#get"));
        assert_eq!(error.root_cause().code(), "HOST_FAILURE");
        assert!(std::error::Error::source(&error).is_some());
    }
}
