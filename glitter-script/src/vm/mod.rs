//! The script interpreter.
//!
//! Each [`Interpreter::step`] executes exactly one instruction of one
//! context. The code buffer is resolved through a [`CodeSource`] on every
//! fetch and the decoded [`Instruction`] is copied out before anything runs,
//! so the buffer may be moved or reclaimed between any two steps.

pub mod context;
pub mod pool;

use std::collections::HashMap;

use glitter_core::{Handle, HandleTable, ResourceError, StreamProvider};

use crate::config::ScriptConfig;
use crate::decode::{decode, Instruction, ScriptVersion};
use crate::globals::Globals;
use crate::library::{ContextInfo, LibCall, LibResult, Library, Signature};
use crate::opcode::Opcode;
use crate::workaround::{self, WorkaroundEntry, WORKAROUNDS};

use context::{ContextStart, ContextState, InterpreterContext, PatchCursor, ResumeState, WaitResult, WaitToken};
use pool::{ContextId, ContextPool};

#[derive(thiserror::Error, Debug)]
pub enum VmError {
    #[error("ip out of range: ip=0x{ip:X}, code_len=0x{len:X}")]
    CodeOutOfRange { ip: u32, len: u32 },

    #[error("invalid opcode: 0x{opcode:02X} at ip=0x{ip:X}")]
    InvalidOpcode { opcode: u8, ip: u32 },

    #[error("invalid operand width in 0x{opcode:02X} at ip=0x{ip:X}")]
    InvalidOperandWidth { opcode: u8, ip: u32 },

    #[error("stack slot {index} out of range at ip=0x{ip:X}")]
    StackOutOfRange { index: i32, ip: u32 },

    #[error("global index out of range: idx={index}, globals_len={len}")]
    GlobalOutOfRange { index: i32, len: usize },

    #[error("division by zero at ip=0x{ip:X}")]
    DivideByZero { ip: u32 },

    #[error("unknown library routine {routine} at ip=0x{ip:X}")]
    UnknownRoutine { routine: i32, ip: u32 },

    #[error("library routine {routine} failed: {msg}")]
    LibraryFailed { routine: u32, msg: String },

    #[error("context pool exhausted (capacity={capacity})")]
    PoolExhausted { capacity: usize },

    #[error("no such context {0:?}")]
    NoSuchContext(ContextId),

    #[error("context {0:?} is already waiting")]
    AlreadyWaiting(ContextId),

    #[error("context {0:?} is already awaited by another context")]
    AlreadyAwaited(ContextId),

    #[error("no code for handle {0}")]
    NoCode(Handle),

    #[error("global count mismatch: expected {expected}, save has {found}")]
    GlobalCountMismatch { expected: usize, found: usize },

    #[error("corrupt context record: {0}")]
    CorruptRecord(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("record encoding failed")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type VmResult<T> = std::result::Result<T, VmError>;

/// Resolves a code handle to the bytes starting at it.
pub trait CodeSource {
    fn code(&mut self, handle: Handle) -> VmResult<&[u8]>;
}

impl<P: StreamProvider> CodeSource for HandleTable<P> {
    fn code(&mut self, handle: Handle) -> VmResult<&[u8]> {
        Ok(self.resolve(handle)?)
    }
}

/// Code kept directly in memory, keyed by handle.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    scripts: HashMap<Handle, Vec<u8>>,
}

impl CodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: Handle, code: Vec<u8>) {
        self.scripts.insert(handle, code);
    }

    pub fn with_script(mut self, handle: Handle, code: Vec<u8>) -> Self {
        self.insert(handle, code);
        self
    }
}

impl CodeSource for CodeMap {
    fn code(&mut self, handle: Handle) -> VmResult<&[u8]> {
        self.scripts
            .get(&handle)
            .map(Vec::as_slice)
            .ok_or(VmError::NoCode(handle))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedOn {
    /// A library routine asked to run again next turn.
    Library,
    /// Waiting for another context to end.
    Context(WaitToken),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Blocked(BlockedOn),
    /// The context ended and its slot was released.
    Halted,
}

pub struct Interpreter {
    pub(crate) version: ScriptVersion,
    pub(crate) pool: ContextPool,
    pub(crate) globals: Globals,
    pub(crate) escape_events: u32,
    pub(crate) next_wait: u32,
    workarounds: &'static [WorkaroundEntry],
}

fn binary(op: Opcode, a: i32, b: i32, ip: u32) -> VmResult<i32> {
    let value = match op {
        Opcode::Equal => (a == b) as i32,
        Opcode::Less => (a < b) as i32,
        Opcode::LEqual => (a <= b) as i32,
        Opcode::NEqual => (a != b) as i32,
        Opcode::GEqual => (a >= b) as i32,
        Opcode::Great => (a > b) as i32,
        Opcode::Plus => a.wrapping_add(b),
        Opcode::Minus => a.wrapping_sub(b),
        Opcode::Mult => a.wrapping_mul(b),
        Opcode::Div | Opcode::Mod if b == 0 => return Err(VmError::DivideByZero { ip }),
        Opcode::Div => a.wrapping_div(b),
        Opcode::Mod => a.wrapping_rem(b),
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Eor => a ^ b,
        Opcode::LOr => (a != 0 || b != 0) as i32,
        Opcode::LAnd => (a != 0 && b != 0) as i32,
        other => {
            return Err(VmError::InvalidOpcode {
                opcode: other as u8,
                ip,
            })
        }
    };
    Ok(value)
}

impl Interpreter {
    pub fn new(config: &ScriptConfig) -> Self {
        Self {
            version: config.version,
            pool: ContextPool::new(config.pool_size),
            globals: Globals::new(config.global_count),
            escape_events: 0,
            next_wait: 0,
            workarounds: WORKAROUNDS,
        }
    }

    pub fn version(&self) -> ScriptVersion {
        self.version
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Globals {
        &mut self.globals
    }

    pub fn set_globals(&mut self, globals: Globals) {
        self.globals = globals;
    }

    pub fn escape_events(&self) -> u32 {
        self.escape_events
    }

    /// Signals an escape (the player skipping a cut-scene). Library calls
    /// blocked inside an open escape window complete on their next turn.
    pub fn raise_escape(&mut self) {
        self.escape_events = self.escape_events.wrapping_add(1);
        log::debug!("escape event {}", self.escape_events);
    }

    /// Starts a script at offset 0 of `start.code`.
    pub fn create_context(&mut self, start: ContextStart, code: &mut dyn CodeSource) -> VmResult<ContextId> {
        self.pool.spawn(start, code)
    }

    pub fn context(&self, id: ContextId) -> Option<&InterpreterContext> {
        self.pool.get(id)
    }

    pub fn contexts(&self) -> impl Iterator<Item = (ContextId, &InterpreterContext)> + '_ {
        self.pool.iter()
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.pool.iter().map(|(id, _)| id).collect()
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    pub fn is_live(&self, id: ContextId) -> bool {
        self.pool.is_live(id)
    }

    /// Live and not waiting for another context.
    pub fn is_runnable(&self, id: ContextId) -> bool {
        self.pool
            .get(id)
            .map_or(false, |ctx| ctx.wait_result != Some(WaitResult::Waiting))
    }

    /// Executes one instruction of `id`.
    ///
    /// A context that halts is released and its waiters see `Finished`. A
    /// context that faults is torn down (its waiters see `CutShort`) and the
    /// fault is returned.
    pub fn step<L: Library + ?Sized>(
        &mut self,
        id: ContextId,
        code: &mut dyn CodeSource,
        library: &mut L,
    ) -> VmResult<Step> {
        let mut ctx = self.pool.checkout(id)?;
        let result = self.execute(id, &mut ctx, code, library);
        match &result {
            Ok(Step::Continue) => ctx.state = ContextState::Running,
            Ok(Step::Blocked(BlockedOn::Library)) => ctx.state = ContextState::SuspendedOnLibrary,
            Ok(Step::Blocked(BlockedOn::Context(_))) => ctx.state = ContextState::SuspendedOnContext,
            Ok(Step::Halted) => {}
            Err(e) => {
                log::error!("context {:?} faulted: {}", id, e);
                ctx.log_registers();
            }
        }
        self.pool.checkin(id, ctx);

        match result {
            Ok(Step::Halted) => {
                self.release(id, WaitResult::Finished);
                Ok(Step::Halted)
            }
            Err(e) => {
                self.release(id, WaitResult::CutShort);
                Err(e)
            }
            other => other,
        }
    }

    /// Steps `id` until it blocks or halts, at most `max_steps` times.
    pub fn run<L: Library + ?Sized>(
        &mut self,
        id: ContextId,
        code: &mut dyn CodeSource,
        library: &mut L,
        max_steps: usize,
    ) -> VmResult<Step> {
        for _ in 0..max_steps {
            match self.step(id, code, library)? {
                Step::Continue => {}
                other => return Ok(other),
            }
        }
        Ok(Step::Continue)
    }

    /// Makes `waiter` wait until `waitee` halts or is torn down.
    pub fn wait_for(&mut self, waiter: ContextId, waitee: ContextId) -> VmResult<WaitToken> {
        let mut ctx = self.pool.checkout(waiter)?;
        let result = self.link_wait(waiter, &mut ctx, waitee);
        if result.is_ok() {
            ctx.state = ContextState::SuspendedOnContext;
            ctx.host_wait = true;
        }
        self.pool.checkin(waiter, ctx);
        result
    }

    /// Kills a context. Contexts waiting on it see `CutShort`.
    pub fn teardown(&mut self, id: ContextId) -> VmResult<()> {
        if !self.pool.is_live(id) {
            return Err(VmError::NoSuchContext(id));
        }
        self.release(id, WaitResult::CutShort);
        Ok(())
    }

    /// Kills every context matching `pred`, returning how many died.
    pub fn teardown_where<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&InterpreterContext) -> bool,
    {
        let doomed: Vec<ContextId> = self
            .pool
            .iter()
            .filter(|(_, ctx)| pred(*ctx))
            .map(|(id, _)| id)
            .collect();
        for &id in &doomed {
            self.release(id, WaitResult::CutShort);
        }
        doomed.len()
    }

    fn execute<L: Library + ?Sized>(
        &mut self,
        id: ContextId,
        ctx: &mut InterpreterContext,
        code: &mut dyn CodeSource,
        library: &mut L,
    ) -> VmResult<Step> {
        if ctx.halt {
            return Ok(Step::Halted);
        }
        if let (Some(WaitResult::Waiting), Some(token)) = (ctx.wait_result, ctx.outgoing) {
            return Ok(Step::Blocked(BlockedOn::Context(token)));
        }
        if ctx.host_wait {
            // the outcome belonged to the host; routines must not see it
            ctx.host_wait = false;
            ctx.wait_result = None;
        }

        if ctx.patch.is_none() {
            if let Some(entry) = workaround::lookup(self.workarounds, self.version, ctx.code, ctx.ip) {
                log::debug!("context {:?}: workaround {} at {}:{:#X}", id, entry, ctx.code, ctx.ip);
                ctx.patch = Some(PatchCursor {
                    entry: entry as u16,
                    pos: 0,
                });
            }
        }

        let insn = match ctx.patch {
            Some(cursor) => decode(self.patch_bytes(cursor)?, cursor.pos, self.version)?,
            None => decode(code.code(ctx.code)?, ctx.ip, self.version)?,
        };
        log::trace!("{:?} {:#06X}: {}", id, ctx.ip, insn);

        let fallthrough = ctx.ip.wrapping_add(insn.len);
        let mut target = None;
        match insn.op {
            Opcode::Noop => {}
            Opcode::Halt => ctx.halt = true,
            Opcode::Imm | Opcode::Str | Opcode::Film | Opcode::Font | Opcode::Pal => ctx.push(insn.operand)?,
            Opcode::Zero => ctx.push(0)?,
            Opcode::One => ctx.push(1)?,
            Opcode::MinusOne => ctx.push(-1)?,
            Opcode::Load => {
                let value = ctx.local(insn.operand)?;
                ctx.push(value)?;
            }
            Opcode::Store => {
                let value = ctx.pop()?;
                ctx.set_local(insn.operand, value)?;
            }
            Opcode::GLoad => {
                let value = self.globals.get(insn.operand)?;
                ctx.push(value)?;
            }
            Opcode::GStore => {
                let value = ctx.pop()?;
                self.globals.set(insn.operand, value)?;
            }
            Opcode::Call => {
                ctx.call(fallthrough)?;
                target = Some(insn.operand as u32);
            }
            Opcode::Ret => match ctx.ret()? {
                Some(ip) => target = Some(ip),
                None => ctx.halt = true,
            },
            Opcode::Alloc => ctx.alloc(insn.operand)?,
            Opcode::Jump => target = Some(insn.operand as u32),
            Opcode::JmpFalse => {
                if ctx.pop()? == 0 {
                    target = Some(insn.operand as u32);
                }
            }
            Opcode::JmpTrue => {
                if ctx.pop()? != 0 {
                    target = Some(insn.operand as u32);
                }
            }
            Opcode::Not => {
                let value = ctx.pop()?;
                ctx.push((value == 0) as i32)?;
            }
            Opcode::Comp => {
                let value = ctx.pop()?;
                ctx.push(!value)?;
            }
            Opcode::Neg => {
                let value = ctx.pop()?;
                ctx.push(value.wrapping_neg())?;
            }
            Opcode::Dup => {
                let value = ctx.top()?;
                ctx.push(value)?;
            }
            Opcode::EscOn => {
                ctx.esc_on = true;
                ctx.my_escape = self.escape_events;
            }
            Opcode::EscOff => {
                ctx.esc_on = false;
                ctx.my_escape = 0;
            }
            Opcode::LibCall => return self.library_call(id, ctx, insn, code, library),
            op => {
                let b = ctx.pop()?;
                let a = ctx.pop()?;
                let value = binary(op, a, b, ctx.ip)?;
                ctx.push(value)?;
            }
        }

        self.advance(ctx, insn.len, target);
        Ok(if ctx.halt { Step::Halted } else { Step::Continue })
    }

    fn library_call<L: Library + ?Sized>(
        &mut self,
        id: ContextId,
        ctx: &mut InterpreterContext,
        insn: Instruction,
        code: &mut dyn CodeSource,
        library: &mut L,
    ) -> VmResult<Step> {
        let ip = ctx.ip;
        let unknown = VmError::UnknownRoutine {
            routine: insn.operand,
            ip,
        };
        let Ok(routine) = u32::try_from(insn.operand) else {
            return Err(unknown);
        };
        let signature = library.signature(routine).ok_or(unknown)?;
        let args = ctx.top_values(signature.args)?.to_vec();
        let escaped = ctx.escape_pending(self.escape_events);

        let outcome = {
            let mut call = LibCall {
                routine,
                args: &args,
                escaped,
                wait: ctx.wait_result,
                context: ContextInfo::of(id, ctx),
                resume: &mut ctx.resume,
                globals: &mut self.globals,
                pool: &mut self.pool,
                code: &mut *code,
            };
            library
                .call(routine, &mut call)
                .map_err(|e| VmError::LibraryFailed {
                    routine,
                    msg: format!("{e:#}"),
                })?
        };

        match outcome {
            LibResult::Done(value) => self.complete_call(ctx, signature, value, insn.len, false),
            LibResult::Block | LibResult::WaitFor(_) if escaped => {
                log::debug!("context {:?}: escape cuts routine {} short", id, routine);
                self.complete_call(ctx, signature, 0, insn.len, true)
            }
            LibResult::Block => Ok(Step::Blocked(BlockedOn::Library)),
            LibResult::WaitFor(waitee) => {
                let token = self.link_wait(id, ctx, waitee)?;
                Ok(Step::Blocked(BlockedOn::Context(token)))
            }
            LibResult::Halt => {
                ctx.drop_values(signature.args)?;
                ctx.halt = true;
                Ok(Step::Halted)
            }
        }
    }

    fn complete_call(
        &self,
        ctx: &mut InterpreterContext,
        signature: Signature,
        value: i32,
        len: u32,
        cut_short: bool,
    ) -> VmResult<Step> {
        ctx.drop_values(signature.args)?;
        if signature.returns {
            ctx.push(value)?;
        }
        ctx.resume = ResumeState::Fresh;
        ctx.wait_result = None;
        ctx.escaped = cut_short;
        self.advance(ctx, len, None);
        Ok(Step::Continue)
    }

    /// Moves `ip` past the executed instruction, or to a taken branch target.
    fn advance(&self, ctx: &mut InterpreterContext, len: u32, target: Option<u32>) {
        match target {
            Some(ip) => {
                if ctx.patch.take().is_some() {
                    log::trace!("branch to {:#X} leaves the workaround", ip);
                }
                ctx.ip = ip;
            }
            None => {
                ctx.ip = ctx.ip.wrapping_add(len);
                if let Some(cursor) = ctx.patch.as_mut() {
                    cursor.pos += len;
                    let exhausted = self
                        .workarounds
                        .get(cursor.entry as usize)
                        .map_or(true, |entry| cursor.pos as usize >= entry.bytes.len());
                    if exhausted {
                        ctx.patch = None;
                    }
                }
            }
        }
    }

    fn patch_bytes(&self, cursor: PatchCursor) -> VmResult<&'static [u8]> {
        self.workarounds
            .get(cursor.entry as usize)
            .map(|entry| entry.bytes)
            .ok_or_else(|| VmError::CorruptRecord(format!("unknown workaround entry {}", cursor.entry)))
    }

    fn link_wait(
        &mut self,
        waiter: ContextId,
        ctx: &mut InterpreterContext,
        waitee: ContextId,
    ) -> VmResult<WaitToken> {
        if ctx.outgoing.is_some() {
            return Err(VmError::AlreadyWaiting(waiter));
        }
        let target = self.pool.get_mut(waitee).ok_or(VmError::NoSuchContext(waitee))?;
        if target.incoming.is_some() {
            return Err(VmError::AlreadyAwaited(waitee));
        }

        self.next_wait = self.next_wait.wrapping_add(1).max(1);
        let token = WaitToken(self.next_wait);
        target.incoming = Some(token);
        ctx.outgoing = Some(token);
        ctx.wait_result = Some(WaitResult::Waiting);
        log::debug!("context {:?} waits for {:?}", waiter, waitee);
        Ok(token)
    }

    /// Returns `id` to the pool and settles both ends of its wait links.
    fn release(&mut self, id: ContextId, outcome: WaitResult) {
        let Some(ctx) = self.pool.release(id) else {
            return;
        };
        if let Some(token) = ctx.outgoing {
            for (_, other) in self.pool.iter_mut() {
                if other.incoming == Some(token) {
                    other.incoming = None;
                }
            }
        }
        if let Some(token) = ctx.incoming {
            for (other_id, other) in self.pool.iter_mut() {
                if other.outgoing == Some(token) {
                    other.outgoing = None;
                    other.wait_result = Some(outcome);
                    log::debug!("context {:?} resumes: {:?} ended ({:?})", other_id, id, outcome);
                }
            }
        }
        log::debug!("context {:?} released", id);
    }
}
