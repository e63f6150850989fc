//! glitter-script
//!
//! Stack-based interpreter for compiled game scripts. Contexts run
//! cooperatively, may block inside library calls, wait on one another, and
//! can be saved and restored mid-execution.

#![allow(clippy::uninlined_format_args)]

pub mod asm;
pub mod config;
pub mod decode;
pub mod globals;
pub mod library;
pub mod opcode;
pub mod save;
pub mod sched;
pub mod vm;
pub mod workaround;

pub use config::{ScriptConfig, ScriptConfigBuilder};
pub use decode::{decode, decode_all, Instruction, ScriptVersion};
pub use globals::Globals;
pub use library::{ContextInfo, LibCall, LibResult, Library, LibraryRegistry, Signature};
pub use opcode::Opcode;
pub use save::{deserialize_context, serialize_context, ContextRecord, InterpreterSnapshot};
pub use sched::{PassReport, Scheduler};
pub use vm::context::{
    ContextKind, ContextStart, ContextState, Event, InterpreterContext, ResumeState, WaitResult,
    WaitToken, STACK_SIZE,
};
pub use vm::pool::{ContextId, ContextPool};
pub use vm::{BlockedOn, CodeMap, CodeSource, Interpreter, Step, VmError, VmResult};
