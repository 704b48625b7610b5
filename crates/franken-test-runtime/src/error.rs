//! Loader failure taxonomy and the report handed to the result reporter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::resolver::ResolutionError;
use crate::stack_trace::StackFrame;
use crate::value::HeapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorCode {
    ModuleExecution,
    ManualMockMismatch,
    UncaughtException,
    SourceUnreadable,
    InvalidOperation,
    HeapFailure,
}

impl LoadErrorCode {
    pub fn stable_code(self) -> &'static str {
        match self {
            Self::ModuleExecution => "FE-MODLOAD-0001",
            Self::ManualMockMismatch => "FE-MODLOAD-0002",
            Self::UncaughtException => "FE-MODLOAD-0003",
            Self::SourceUnreadable => "FE-MODLOAD-0004",
            Self::InvalidOperation => "FE-MODLOAD-0005",
            Self::HeapFailure => "FE-MODLOAD-0006",
        }
    }
}

/// Module top-level code threw (or failed to parse). `stack` is already
/// normalized; the failed module is never left in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleExecutionError {
    pub identity: String,
    pub name: String,
    pub message: String,
    pub stack: String,
    pub frames: Vec<StackFrame>,
}

impl fmt::Display for ModuleExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: module {} threw during execution: {}: {}",
            LoadErrorCode::ModuleExecution.stable_code(),
            self.identity,
            self.name,
            self.message
        )
    }
}

impl std::error::Error for ModuleExecutionError {}

/// A manual mock exists for the identity but could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualMockMismatchError {
    pub identity: String,
    pub mock_path: String,
    pub reason: String,
}

impl fmt::Display for ManualMockMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: manual mock {} for {} could not be loaded: {}",
            LoadErrorCode::ManualMockMismatch.stable_code(),
            self.mock_path,
            self.identity,
            self.reason
        )
    }
}

impl std::error::Error for ManualMockMismatchError {}

/// A script error escaping a function invoked by the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptException {
    pub name: String,
    pub message: String,
    pub stack: String,
    pub frames: Vec<StackFrame>,
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: uncaught {}: {}",
            LoadErrorCode::UncaughtException.stable_code(),
            self.name,
            self.message
        )
    }
}

impl std::error::Error for ScriptException {}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Resolution(Box<ResolutionError>),
    #[error("{0}")]
    ModuleExecution(Box<ModuleExecutionError>),
    #[error("{0}")]
    ManualMockMismatch(Box<ManualMockMismatchError>),
    #[error("{0}")]
    Uncaught(Box<ScriptException>),
    #[error("{code}: cannot read module source {path}: {message}", code = LoadErrorCode::SourceUnreadable.stable_code())]
    SourceUnreadable { path: String, message: String },
    #[error("{code}: {message}", code = LoadErrorCode::InvalidOperation.stable_code())]
    InvalidOperation { message: String },
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("sandbox heap failure: {0}")]
    Heap(#[from] HeapError),
}

impl RuntimeError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Resolution(error) => error.code.stable_code(),
            Self::ModuleExecution(_) => LoadErrorCode::ModuleExecution.stable_code(),
            Self::ManualMockMismatch(_) => LoadErrorCode::ManualMockMismatch.stable_code(),
            Self::Uncaught(_) => LoadErrorCode::UncaughtException.stable_code(),
            Self::SourceUnreadable { .. } => LoadErrorCode::SourceUnreadable.stable_code(),
            Self::InvalidOperation { .. } => LoadErrorCode::InvalidOperation.stable_code(),
            Self::Config(error) => error.code.stable_code(),
            Self::Heap(_) => LoadErrorCode::HeapFailure.stable_code(),
        }
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Normalized stack text, for errors that carry one.
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::ModuleExecution(error) => Some(&error.stack),
            Self::Uncaught(error) => Some(&error.stack),
            _ => None,
        }
    }

    pub fn is_module_not_found(&self) -> bool {
        matches!(self, Self::Resolution(_))
    }
}

impl From<ResolutionError> for RuntimeError {
    fn from(error: ResolutionError) -> Self {
        Self::Resolution(Box::new(error))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// What the reporter receives for a failed test file or case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub title: String,
    pub message: String,
}

impl FailureReport {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }

    /// Report text is the normalized stack when present, else the error
    /// display.
    pub fn from_error(title: impl Into<String>, error: &RuntimeError) -> Self {
        let message = match error.stack() {
            Some(stack) => stack.to_string(),
            None => error.to_string(),
        };
        Self::new(title, message)
    }
}
