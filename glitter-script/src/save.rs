//! Save records for interpreter state.
//!
//! Records are bincode with fixed-width little-endian integers; trailing
//! bytes are rejected.

use bincode::Options;
use glitter_core::Handle;
use serde::{Deserialize, Serialize};

use crate::decode::ScriptVersion;
use crate::vm::context::{
    ContextKind, ContextState, Event, InterpreterContext, PatchCursor, ResumeState, WaitResult,
    WaitToken, STACK_SIZE,
};
use crate::vm::pool::ContextId;
use crate::vm::{Interpreter, VmError, VmResult};
use crate::workaround::WORKAROUNDS;

const SNAPSHOT_VERSION: u16 = 2;

fn bincode_opts() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Every register of one context plus the live part of its stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub kind: ContextKind,
    pub code: Handle,
    pub event: Event,
    pub polygon: i32,
    pub actor: i32,
    pub item: i32,
    pub stack: Vec<i32>,
    pub sp: i32,
    pub fp: i32,
    pub ip: u32,
    pub halt: bool,
    pub esc_on: bool,
    pub my_escape: u32,
    pub escaped: bool,
    pub resume: ResumeState,
    pub patch: Option<PatchCursor>,
    pub outgoing: Option<WaitToken>,
    pub incoming: Option<WaitToken>,
    pub wait_result: Option<WaitResult>,
    pub host_wait: bool,
    pub state: ContextState,
}

impl ContextRecord {
    pub fn capture(ctx: &InterpreterContext) -> Self {
        Self {
            kind: ctx.kind,
            code: ctx.code,
            event: ctx.event,
            polygon: ctx.polygon,
            actor: ctx.actor,
            item: ctx.item,
            stack: ctx.stack().to_vec(),
            sp: ctx.sp,
            fp: ctx.fp,
            ip: ctx.ip,
            halt: ctx.halt,
            esc_on: ctx.esc_on,
            my_escape: ctx.my_escape,
            escaped: ctx.escaped,
            resume: ctx.resume,
            patch: ctx.patch,
            outgoing: ctx.outgoing,
            incoming: ctx.incoming,
            wait_result: ctx.wait_result,
            host_wait: ctx.host_wait,
            state: ctx.state,
        }
    }

    pub fn into_context(self) -> VmResult<InterpreterContext> {
        if self.stack.len() > STACK_SIZE {
            return Err(VmError::CorruptRecord(format!("stack depth {}", self.stack.len())));
        }
        if self.sp + 1 != self.stack.len() as i32 {
            return Err(VmError::CorruptRecord(format!(
                "sp {} does not match {} saved slots",
                self.sp,
                self.stack.len()
            )));
        }
        if !(0..STACK_SIZE as i32).contains(&self.fp) {
            return Err(VmError::CorruptRecord(format!("fp {}", self.fp)));
        }
        if let Some(cursor) = self.patch {
            let valid = WORKAROUNDS
                .get(cursor.entry as usize)
                .map_or(false, |entry| (cursor.pos as usize) < entry.bytes.len());
            if !valid {
                return Err(VmError::CorruptRecord(format!("patch cursor {:?}", cursor)));
            }
        }

        let mut stack = [0; STACK_SIZE];
        stack[..self.stack.len()].copy_from_slice(&self.stack);
        Ok(InterpreterContext {
            kind: self.kind,
            code: self.code,
            event: self.event,
            polygon: self.polygon,
            actor: self.actor,
            item: self.item,
            stack,
            sp: self.sp,
            fp: self.fp,
            ip: self.ip,
            halt: self.halt,
            esc_on: self.esc_on,
            my_escape: self.my_escape,
            escaped: self.escaped,
            resume: self.resume,
            patch: self.patch,
            outgoing: self.outgoing,
            incoming: self.incoming,
            wait_result: self.wait_result,
            host_wait: self.host_wait,
            state: self.state,
        })
    }
}

pub fn serialize_context(ctx: &InterpreterContext) -> VmResult<Vec<u8>> {
    Ok(bincode_opts().serialize(&ContextRecord::capture(ctx))?)
}

pub fn deserialize_context(bytes: &[u8]) -> VmResult<InterpreterContext> {
    let record: ContextRecord = bincode_opts().deserialize(bytes)?;
    record.into_context()
}

/// All live contexts of an interpreter, in pool order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterSnapshot {
    pub version: u16,
    pub script_version: ScriptVersion,
    pub escape_events: u32,
    pub next_wait: u32,
    pub contexts: Vec<ContextRecord>,
}

impl InterpreterSnapshot {
    pub fn to_bytes(&self) -> VmResult<Vec<u8>> {
        Ok(bincode_opts().serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> VmResult<Self> {
        let snapshot: Self = bincode_opts().deserialize(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(VmError::CorruptRecord(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

impl Interpreter {
    pub fn snapshot(&self) -> InterpreterSnapshot {
        InterpreterSnapshot {
            version: SNAPSHOT_VERSION,
            script_version: self.version,
            escape_events: self.escape_events,
            next_wait: self.next_wait,
            contexts: self
                .pool
                .iter()
                .map(|(_, ctx)| ContextRecord::capture(ctx))
                .collect(),
        }
    }

    /// Replaces every context with the snapshot's. Ids of the restored
    /// contexts are returned in snapshot order; earlier ids become stale.
    pub fn restore(&mut self, snapshot: InterpreterSnapshot) -> VmResult<Vec<ContextId>> {
        if snapshot.script_version != self.version {
            return Err(VmError::CorruptRecord(format!(
                "snapshot is for {:?}, interpreter runs {:?}",
                snapshot.script_version, self.version
            )));
        }
        if snapshot.contexts.len() > self.pool.capacity() {
            return Err(VmError::PoolExhausted {
                capacity: self.pool.capacity(),
            });
        }
        let contexts = snapshot
            .contexts
            .into_iter()
            .map(ContextRecord::into_context)
            .collect::<VmResult<Vec<_>>>()?;

        self.pool.clear();
        let ids = contexts
            .into_iter()
            .map(|ctx| self.pool.insert(ctx))
            .collect::<VmResult<Vec<_>>>()?;
        self.escape_events = snapshot.escape_events;
        self.next_wait = snapshot.next_wait;
        log::debug!("restored {} contexts", ids.len());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::context::ContextStart;
    use pretty_assertions::assert_eq;

    fn busy_context() -> InterpreterContext {
        let mut ctx = InterpreterContext::new(
            &ContextStart::new(ContextKind::Actor, Handle(0x0080_0010))
                .event(Event::WalkTo)
                .actor(7),
        );
        ctx.push(5).unwrap();
        ctx.call(33).unwrap();
        ctx.push(-9).unwrap();
        ctx.ip = 41;
        ctx.esc_on = true;
        ctx.my_escape = 3;
        ctx.resume = ResumeState::Stage(2);
        ctx
    }

    #[test]
    fn context_record_layout_is_stable() {
        let ctx = busy_context();
        let bytes = serialize_context(&ctx).unwrap();
        let restored = deserialize_context(&bytes).unwrap();
        assert_eq!(restored, ctx);
        assert_eq!(serialize_context(&restored).unwrap(), bytes);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = serialize_context(&busy_context()).unwrap();
        bytes.push(0);
        assert!(matches!(deserialize_context(&bytes), Err(VmError::Encoding(_))));
    }

    #[test]
    fn inconsistent_records_are_rejected() {
        let mut record = ContextRecord::capture(&busy_context());
        record.sp += 1;
        assert!(matches!(record.into_context(), Err(VmError::CorruptRecord(_))));

        let mut record = ContextRecord::capture(&busy_context());
        record.patch = Some(PatchCursor { entry: 99, pos: 0 });
        assert!(matches!(record.into_context(), Err(VmError::CorruptRecord(_))));
    }
}
