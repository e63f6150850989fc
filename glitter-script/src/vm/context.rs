use glitter_core::Handle;
use serde::{Deserialize, Serialize};

use super::{VmError, VmResult};

/// Operand stack depth of every context.
pub const STACK_SIZE: usize = 128;

/// Caller frame pointer stored in the root frame.
pub(crate) const ROOT_FRAME: i32 = -1;

/// What started a script.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextKind {
    #[default]
    None,
    Actor,
    Master,
    Polygon,
    Inventory,
    Scene,
    Process,
    GlobalProcess,
}

/// Event a script was started for.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    #[default]
    NoEvent,
    Startup,
    Closedown,
    Pointed,
    Unpoint,
    WalkIn,
    WalkOut,
    PickUp,
    PutDown,
    WalkTo,
    Look,
    Action,
    Converse,
    ShowEvent,
    HideEvent,
    Talking,
    Entering,
    Leaving,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextState {
    /// Created, never stepped.
    #[default]
    Initialized,
    Running,
    /// Blocked inside a library call that runs again next turn.
    SuspendedOnLibrary,
    /// Waiting for another context to end.
    SuspendedOnContext,
}

/// Progress marker a blocking library routine keeps between turns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResumeState {
    #[default]
    Fresh,
    Stage(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitResult {
    Waiting,
    /// The awaited context halted.
    Finished,
    /// The awaited context was torn down.
    CutShort,
}

/// Links one waiting context to the context it waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaitToken(pub(crate) u32);

/// Position inside an active workaround patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCursor {
    pub(crate) entry: u16,
    pub(crate) pos: u32,
}

/// Everything needed to start a script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextStart {
    pub kind: ContextKind,
    pub code: Handle,
    pub event: Event,
    pub polygon: i32,
    pub actor: i32,
    pub item: i32,
}

impl ContextStart {
    pub fn new(kind: ContextKind, code: Handle) -> Self {
        Self {
            kind,
            code,
            event: Event::NoEvent,
            polygon: 0,
            actor: 0,
            item: 0,
        }
    }

    pub fn event(mut self, event: Event) -> Self {
        self.event = event;
        self
    }

    pub fn polygon(mut self, polygon: i32) -> Self {
        self.polygon = polygon;
        self
    }

    pub fn actor(mut self, actor: i32) -> Self {
        self.actor = actor;
        self
    }

    pub fn item(mut self, item: i32) -> Self {
        self.item = item;
        self
    }
}

/// Register and stack state of one running script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterpreterContext {
    pub(crate) kind: ContextKind,
    pub(crate) code: Handle,
    pub(crate) event: Event,
    pub(crate) polygon: i32,
    pub(crate) actor: i32,
    pub(crate) item: i32,

    pub(crate) stack: [i32; STACK_SIZE],
    pub(crate) sp: i32,
    pub(crate) fp: i32,
    pub(crate) ip: u32,
    pub(crate) halt: bool,

    pub(crate) esc_on: bool,
    pub(crate) my_escape: u32,
    pub(crate) escaped: bool,
    pub(crate) resume: ResumeState,
    pub(crate) patch: Option<PatchCursor>,

    pub(crate) outgoing: Option<WaitToken>,
    pub(crate) incoming: Option<WaitToken>,
    pub(crate) wait_result: Option<WaitResult>,
    /// The wait was started through `Interpreter::wait_for`, not by a routine.
    pub(crate) host_wait: bool,
    pub(crate) state: ContextState,
}

impl InterpreterContext {
    /// Seeds the root frame `[0, -1, 0]`.
    pub(crate) fn new(start: &ContextStart) -> Self {
        let mut stack = [0; STACK_SIZE];
        stack[1] = ROOT_FRAME;
        Self {
            kind: start.kind,
            code: start.code,
            event: start.event,
            polygon: start.polygon,
            actor: start.actor,
            item: start.item,
            stack,
            sp: 2,
            fp: 0,
            ip: 0,
            halt: false,
            esc_on: false,
            my_escape: 0,
            escaped: false,
            resume: ResumeState::Fresh,
            patch: None,
            outgoing: None,
            incoming: None,
            wait_result: None,
            host_wait: false,
            state: ContextState::Initialized,
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn code(&self) -> Handle {
        self.code
    }

    pub fn event(&self) -> Event {
        self.event
    }

    pub fn polygon(&self) -> i32 {
        self.polygon
    }

    pub fn actor(&self) -> i32 {
        self.actor
    }

    pub fn item(&self) -> i32 {
        self.item
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }

    pub fn sp(&self) -> i32 {
        self.sp
    }

    pub fn fp(&self) -> i32 {
        self.fp
    }

    /// Live part of the operand stack, bottom first.
    pub fn stack(&self) -> &[i32] {
        let live = usize::try_from(self.sp + 1).unwrap_or(0).min(STACK_SIZE);
        &self.stack[..live]
    }

    pub fn escape_window_open(&self) -> bool {
        self.esc_on
    }

    /// The last library call was completed early because of an escape.
    pub fn escaped(&self) -> bool {
        self.escaped
    }

    pub fn resume_state(&self) -> ResumeState {
        self.resume
    }

    pub fn wait_result(&self) -> Option<WaitResult> {
        self.wait_result
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn in_patch(&self) -> bool {
        self.patch.is_some()
    }

    /// An escape was raised since the window opened.
    pub(crate) fn escape_pending(&self, escape_events: u32) -> bool {
        self.esc_on && self.my_escape != escape_events
    }

    fn slot(&self, index: i32) -> VmResult<i32> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.stack.get(i))
            .copied()
            .ok_or(VmError::StackOutOfRange { index, ip: self.ip })
    }

    fn slot_mut(&mut self, index: i32) -> VmResult<&mut i32> {
        let ip = self.ip;
        usize::try_from(index)
            .ok()
            .and_then(|i| self.stack.get_mut(i))
            .ok_or(VmError::StackOutOfRange { index, ip })
    }

    pub(crate) fn push(&mut self, value: i32) -> VmResult<()> {
        let sp = self.sp + 1;
        *self.slot_mut(sp)? = value;
        self.sp = sp;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> VmResult<i32> {
        let value = self.slot(self.sp)?;
        self.sp -= 1;
        Ok(value)
    }

    pub(crate) fn top(&self) -> VmResult<i32> {
        self.slot(self.sp)
    }

    pub(crate) fn local(&self, offset: i32) -> VmResult<i32> {
        self.slot(self.fp.wrapping_add(offset))
    }

    pub(crate) fn set_local(&mut self, offset: i32, value: i32) -> VmResult<()> {
        *self.slot_mut(self.fp.wrapping_add(offset))? = value;
        Ok(())
    }

    /// Moves `sp` by `count`, zeroing newly exposed slots.
    pub(crate) fn alloc(&mut self, count: i32) -> VmResult<()> {
        let sp = self.sp.wrapping_add(count);
        if !(-1..STACK_SIZE as i32).contains(&sp) {
            return Err(VmError::StackOutOfRange { index: sp, ip: self.ip });
        }
        for index in (self.sp + 1)..=sp {
            *self.slot_mut(index)? = 0;
        }
        self.sp = sp;
        Ok(())
    }

    /// Pushes a `[0, fp, return ip]` frame and makes it current.
    pub(crate) fn call(&mut self, return_ip: u32) -> VmResult<()> {
        let base = self.sp + 1;
        if base + 2 >= STACK_SIZE as i32 {
            return Err(VmError::StackOutOfRange { index: base + 2, ip: self.ip });
        }
        let fp = self.fp;
        *self.slot_mut(base)? = 0;
        *self.slot_mut(base + 1)? = fp;
        *self.slot_mut(base + 2)? = return_ip as i32;
        self.fp = base;
        self.sp = base + 2;
        Ok(())
    }

    /// Pops the current frame. `None` when it is the root frame.
    pub(crate) fn ret(&mut self) -> VmResult<Option<u32>> {
        let caller_fp = self.slot(self.fp.wrapping_add(1))?;
        let return_ip = self.slot(self.fp.wrapping_add(2))?;
        if caller_fp == ROOT_FRAME {
            return Ok(None);
        }
        // the saved fp is an ordinary stack slot and may have been overwritten
        if !(0..STACK_SIZE as i32).contains(&caller_fp) {
            return Err(VmError::StackOutOfRange { index: caller_fp, ip: self.ip });
        }
        self.sp = self.fp - 1;
        self.fp = caller_fp;
        Ok(Some(return_ip as u32))
    }

    /// The top `count` values, deepest first.
    pub(crate) fn top_values(&self, count: usize) -> VmResult<&[i32]> {
        let end = self.sp + 1;
        let start = end - count as i32;
        if start < 0 || end as usize > STACK_SIZE {
            return Err(VmError::StackOutOfRange { index: start, ip: self.ip });
        }
        Ok(&self.stack[start as usize..end as usize])
    }

    pub(crate) fn drop_values(&mut self, count: usize) -> VmResult<()> {
        self.top_values(count)?;
        self.sp -= count as i32;
        Ok(())
    }

    pub(crate) fn log_registers(&self) {
        log::error!(
            "  code={} ip={:#06X} sp={} fp={} patch={:?} esc_on={} state={:?}",
            self.code,
            self.ip,
            self.sp,
            self.fp,
            self.patch,
            self.esc_on,
            self.state
        );
        for (i, value) in self.stack().iter().enumerate().rev() {
            log::error!("  [{:3}] {}", i, value);
        }
    }
}
