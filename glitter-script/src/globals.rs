//! Script global variables.
//!
//! Save format: u32 LE count followed by `count` i32 LE values.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::vm::{VmError, VmResult};

/// Values read per step by [`Globals::load`].
const LOAD_CHUNK: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Globals {
    values: Vec<i32>,
}

impl Globals {
    pub fn new(count: usize) -> Self {
        Self {
            values: vec![0; count],
        }
    }

    pub fn from_values(values: Vec<i32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.values
    }

    pub fn get(&self, index: i32) -> VmResult<i32> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.values.get(i))
            .copied()
            .ok_or(VmError::GlobalOutOfRange {
                index,
                len: self.values.len(),
            })
    }

    pub fn set(&mut self, index: i32, value: i32) -> VmResult<()> {
        let len = self.values.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.values.get_mut(i))
            .ok_or(VmError::GlobalOutOfRange { index, len })?;
        *slot = value;
        Ok(())
    }

    pub fn write_to(&self, mut out: impl Write) -> VmResult<()> {
        out.write_u32::<LittleEndian>(self.values.len() as u32)?;
        for &value in &self.values {
            out.write_i32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    /// Replaces the values from a save. The saved count must equal ours.
    pub fn read_from(&mut self, mut input: impl Read) -> VmResult<()> {
        let found = input.read_u32::<LittleEndian>()? as usize;
        if found != self.values.len() {
            return Err(VmError::GlobalCountMismatch {
                expected: self.values.len(),
                found,
            });
        }
        let mut values = vec![0; found];
        input.read_i32_into::<LittleEndian>(&mut values)?;
        self.values = values;
        Ok(())
    }

    /// Reads a save of any length.
    pub fn load(mut input: impl Read) -> VmResult<Self> {
        let count = input.read_u32::<LittleEndian>()? as usize;
        // the count is untrusted until the values are actually read
        let mut values = Vec::with_capacity(count.min(LOAD_CHUNK));
        while values.len() < count {
            let start = values.len();
            let end = count.min(start + LOAD_CHUNK);
            values.resize(end, 0);
            input.read_i32_into::<LittleEndian>(&mut values[start..end])?;
        }
        Ok(Self { values })
    }
}
