pub mod error;
pub mod types;
pub mod value;

pub use error::{CompileError, Diagnostic, ProcError};
pub use types::*;
pub use value::*;
