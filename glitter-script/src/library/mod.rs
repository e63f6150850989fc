//! Library routines callable from scripts with LIBCALL.
//!
//! The interpreter stays independent of the engine: the host hands it a
//! [`Library`] each step. A routine sees its arguments and a little context,
//! and tells the interpreter whether it finished, must run again next turn,
//! or waits for another context.

mod registry;

pub use registry::LibraryRegistry;

use anyhow::Result;
use glitter_core::Handle;

use crate::globals::Globals;
use crate::vm::context::{ContextKind, ContextStart, Event, InterpreterContext, ResumeState, WaitResult};
use crate::vm::pool::{ContextId, ContextPool};
use crate::vm::{CodeSource, VmResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    /// Values popped from the operand stack.
    pub args: usize,
    /// Whether a value is pushed back.
    pub returns: bool,
}

impl Signature {
    pub const fn new(args: usize, returns: bool) -> Self {
        Self { args, returns }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LibResult {
    /// Finished; the value is pushed when the routine returns one.
    Done(i32),
    /// Not finished; run the same LIBCALL again next turn.
    Block,
    /// Suspend until the given context halts or is torn down.
    WaitFor(ContextId),
    /// End the calling script.
    Halt,
}

/// Identity of the calling context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextInfo {
    pub id: ContextId,
    pub kind: ContextKind,
    pub code: Handle,
    pub event: Event,
    pub polygon: i32,
    pub actor: i32,
    pub item: i32,
}

impl ContextInfo {
    pub(crate) fn of(id: ContextId, ctx: &InterpreterContext) -> Self {
        Self {
            id,
            kind: ctx.kind,
            code: ctx.code,
            event: ctx.event,
            polygon: ctx.polygon,
            actor: ctx.actor,
            item: ctx.item,
        }
    }
}

/// One invocation of a library routine.
pub struct LibCall<'a> {
    pub(crate) routine: u32,
    pub(crate) args: &'a [i32],
    pub(crate) escaped: bool,
    pub(crate) wait: Option<WaitResult>,
    pub(crate) context: ContextInfo,
    pub(crate) resume: &'a mut ResumeState,
    pub(crate) globals: &'a mut Globals,
    pub(crate) pool: &'a mut ContextPool,
    pub(crate) code: &'a mut dyn CodeSource,
}

impl<'a> LibCall<'a> {
    pub fn routine(&self) -> u32 {
        self.routine
    }

    /// Arguments in push order.
    pub fn args(&self) -> &[i32] {
        self.args
    }

    pub fn arg(&self, index: usize) -> i32 {
        self.args.get(index).copied().unwrap_or(0)
    }

    pub fn context(&self) -> &ContextInfo {
        &self.context
    }

    /// An escape was raised inside the caller's escape window. A routine
    /// that still blocks is completed with result 0.
    pub fn escaped(&self) -> bool {
        self.escaped
    }

    /// Outcome of the wait this call requested on an earlier turn.
    pub fn wait_result(&self) -> Option<WaitResult> {
        self.wait
    }

    pub fn resume(&self) -> ResumeState {
        *self.resume
    }

    pub fn set_resume(&mut self, state: ResumeState) {
        *self.resume = state;
    }

    pub fn globals(&self) -> &Globals {
        &*self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Globals {
        &mut *self.globals
    }

    /// Starts another script.
    pub fn spawn(&mut self, start: ContextStart) -> VmResult<ContextId> {
        self.pool.spawn(start, &mut *self.code)
    }

    pub fn is_live(&self, id: ContextId) -> bool {
        self.pool.is_live(id)
    }
}

pub trait Library {
    /// Signature of `routine`, `None` if there is no such routine.
    fn signature(&self, routine: u32) -> Option<Signature>;

    fn call(&mut self, routine: u32, call: &mut LibCall<'_>) -> Result<LibResult>;
}
