#![forbid(unsafe_code)]

//! Per-test-file module runtime.
//!
//! A [`Runtime`] holds one validated [`RuntimeConfig`] and a [`ModuleFs`].
//! Each test file gets its own [`ExecutionContext`]: a sandbox heap, a module
//! registry with separate real and mock caches, a resolver with name mapping
//! and manual-mock discovery, and mock/real override state. Errors escaping
//! module code carry stacks rewritten to authored file coordinates.

pub mod ast;
pub mod automock;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod interpreter;
pub mod lexer;
pub mod loader;
pub mod mock_registry;
pub mod name_mapper;
pub mod parser;
pub mod resolver;
pub mod runtime;
pub mod stack_trace;
pub mod value;

pub use config::{
    ConfigError, ConfigErrorCode, ConfigOverrides, NameMapperRule, OverridePolicy, RuntimeConfig,
};
pub use error::{FailureReport, RuntimeError, RuntimeResult};
pub use events::{LoaderEvent, LoaderEventLog};
pub use fs::{DiskModuleFs, MemoryModuleFs, ModuleFs};
pub use loader::{ExecutionContext, ModuleRecord};
pub use mock_registry::{MockFactory, NativeFactory};
pub use resolver::{ModuleIdentity, Resolution, ResolutionError, ResolutionErrorCode};
pub use runtime::Runtime;
pub use stack_trace::{PathStyle, StackFrame};
pub use value::JsValue;
