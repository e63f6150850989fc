use serde::{Deserialize, Serialize};

use super::context::{ContextStart, InterpreterContext};
use super::{CodeSource, VmError, VmResult};

/// Names a context slot under the generation it was allocated in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId {
    index: u32,
    generation: u32,
}

impl ContextId {
    pub fn index(self) -> u32 {
        self.index
    }
}

#[derive(Debug)]
enum SlotState {
    Vacant,
    Live(Box<InterpreterContext>),
    /// Taken out by the interpreter for the current step.
    Executing,
}

#[derive(Debug)]
struct PoolSlot {
    generation: u32,
    state: SlotState,
}

/// Fixed-capacity pool of interpreter contexts.
#[derive(Debug)]
pub struct ContextPool {
    slots: Vec<PoolSlot>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| PoolSlot {
                    generation: 0,
                    state: SlotState::Vacant,
                })
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot.state, SlotState::Vacant))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the initial code resolves, then takes a free slot.
    pub(crate) fn spawn(
        &mut self,
        start: ContextStart,
        code: &mut dyn CodeSource,
    ) -> VmResult<ContextId> {
        code.code(start.code)?;
        let id = self.insert(InterpreterContext::new(&start))?;
        log::debug!(
            "context {:?} started: {:?} {:?} code={}",
            id,
            start.kind,
            start.event,
            start.code
        );
        Ok(id)
    }

    pub(crate) fn insert(&mut self, ctx: InterpreterContext) -> VmResult<ContextId> {
        let capacity = self.capacity();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| matches!(slot.state, SlotState::Vacant))
            .ok_or(VmError::PoolExhausted { capacity })?;
        slot.state = SlotState::Live(Box::new(ctx));
        Ok(ContextId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn slot(&self, id: ContextId) -> Option<&PoolSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: ContextId) -> Option<&mut PoolSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub fn get(&self, id: ContextId) -> Option<&InterpreterContext> {
        match &self.slot(id)?.state {
            SlotState::Live(ctx) => Some(ctx.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: ContextId) -> Option<&mut InterpreterContext> {
        match &mut self.slot_mut(id)?.state {
            SlotState::Live(ctx) => Some(ctx.as_mut()),
            _ => None,
        }
    }

    pub fn is_live(&self, id: ContextId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn checkout(&mut self, id: ContextId) -> VmResult<Box<InterpreterContext>> {
        let slot = self.slot_mut(id).ok_or(VmError::NoSuchContext(id))?;
        match std::mem::replace(&mut slot.state, SlotState::Executing) {
            SlotState::Live(ctx) => Ok(ctx),
            other => {
                slot.state = other;
                Err(VmError::NoSuchContext(id))
            }
        }
    }

    pub(crate) fn checkin(&mut self, id: ContextId, ctx: Box<InterpreterContext>) {
        if let Some(slot) = self.slot_mut(id) {
            slot.state = SlotState::Live(ctx);
        }
    }

    /// Frees the slot, making `id` stale.
    pub(crate) fn release(&mut self, id: ContextId) -> Option<Box<InterpreterContext>> {
        let slot = self.slot_mut(id)?;
        match std::mem::replace(&mut slot.state, SlotState::Vacant) {
            SlotState::Live(ctx) => {
                slot.generation = slot.generation.wrapping_add(1);
                Some(ctx)
            }
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Live contexts in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ContextId, &InterpreterContext)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match &slot.state {
            SlotState::Live(ctx) => Some((
                ContextId {
                    index: index as u32,
                    generation: slot.generation,
                },
                ctx.as_ref(),
            )),
            _ => None,
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (ContextId, &mut InterpreterContext)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match &mut slot.state {
                SlotState::Live(ctx) => Some((
                    ContextId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    ctx.as_mut(),
                )),
                _ => None,
            })
    }

    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            if !matches!(slot.state, SlotState::Vacant) {
                slot.state = SlotState::Vacant;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }
}
