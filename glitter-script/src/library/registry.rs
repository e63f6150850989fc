use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::{LibCall, LibResult, Library, Signature};

type Routine = Box<dyn FnMut(&mut LibCall<'_>) -> Result<LibResult>>;

/// Routines registered as closures (hosts with a fixed table may prefer a
/// hand-written `match`).
#[derive(Default)]
pub struct LibraryRegistry {
    signatures: HashMap<u32, Signature>,
    routines: HashMap<u32, Routine>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, routine: u32, signature: Signature, f: F)
    where
        F: FnMut(&mut LibCall<'_>) -> Result<LibResult> + 'static,
    {
        self.signatures.insert(routine, signature);
        self.routines.insert(routine, Box::new(f));
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }
}

impl Library for LibraryRegistry {
    fn signature(&self, routine: u32) -> Option<Signature> {
        self.signatures.get(&routine).copied()
    }

    fn call(&mut self, routine: u32, call: &mut LibCall<'_>) -> Result<LibResult> {
        let f = self
            .routines
            .get_mut(&routine)
            .ok_or_else(|| anyhow!("unknown library routine {routine}"))?;
        f(call)
    }
}
