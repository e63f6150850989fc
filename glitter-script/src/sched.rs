use crate::config::ScriptConfig;
use crate::library::Library;
use crate::vm::pool::ContextId;
use crate::vm::{CodeSource, Interpreter, Step, VmError, VmResult};

/// What one scheduler pass did.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Contexts that ran at least one instruction.
    pub ran: usize,
    /// Contexts skipped because they wait on another context.
    pub waiting: usize,
    pub halted: Vec<ContextId>,
    /// Contexts torn down by a fault, with the fault.
    pub faulted: Vec<(ContextId, VmError)>,
    pub instructions: usize,
}

/// Cooperative round-robin driver.
///
/// The interpreter is an explicit state machine: a pass simply calls
/// [`Interpreter::step`] on every live context in pool order until the
/// context blocks, halts or uses up its turn.
#[derive(Debug, Clone)]
pub struct Scheduler {
    turn_budget: usize,
}

impl Scheduler {
    pub fn new(config: &ScriptConfig) -> Self {
        Self {
            turn_budget: config.turn_budget.max(1),
        }
    }

    pub fn turn_budget(&self) -> usize {
        self.turn_budget
    }

    /// Runs one context for at most one turn. Returns the last step outcome
    /// and how many instructions were executed.
    pub fn run_turn<L: Library + ?Sized>(
        &self,
        interp: &mut Interpreter,
        id: ContextId,
        code: &mut dyn CodeSource,
        library: &mut L,
    ) -> VmResult<(Step, usize)> {
        let mut executed = 0;
        while executed < self.turn_budget {
            let step = interp.step(id, code, library)?;
            executed += 1;
            if step != Step::Continue {
                return Ok((step, executed));
            }
        }
        log::trace!("context {:?} used its turn ({} instructions)", id, executed);
        Ok((Step::Continue, executed))
    }

    /// Gives every live context one turn.
    ///
    /// Contexts started during the pass get their first turn on the next one.
    pub fn pass<L: Library + ?Sized>(
        &self,
        interp: &mut Interpreter,
        code: &mut dyn CodeSource,
        library: &mut L,
    ) -> PassReport {
        let mut report = PassReport::default();
        for id in interp.context_ids() {
            if !interp.is_live(id) {
                continue;
            }
            if !interp.is_runnable(id) {
                report.waiting += 1;
                continue;
            }

            match self.run_turn(interp, id, code, library) {
                Ok((Step::Halted, n)) => {
                    report.ran += 1;
                    report.instructions += n;
                    report.halted.push(id);
                }
                Ok((_, n)) => {
                    report.ran += 1;
                    report.instructions += n;
                }
                Err(e) => {
                    log::warn!("context {:?} torn down: {}", id, e);
                    report.ran += 1;
                    report.faulted.push((id, e));
                }
            }
        }
        report
    }
}
