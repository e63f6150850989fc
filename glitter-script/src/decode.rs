//! Instruction decoding.
//!
//! Since V1 an instruction is one opcode byte whose high bits select the
//! operand width:
//!
//! ```text
//! 00xxxxxx  32-bit operand (if any)
//! 01xxxxxx  8-bit signed operand
//! 10xxxxxx  16-bit signed operand
//! 11xxxxxx  invalid
//! ```
//!
//! V0 scripts store every opcode and every operand as a little-endian dword.

use std::convert::TryFrom;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::opcode::{Opcode, OPMASK, OPSIZE16, OPSIZE8};
use crate::vm::VmError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptVersion {
    /// Dword opcodes and operands.
    V0,
    V1,
    #[default]
    V2,
}

impl ScriptVersion {
    pub fn dword_code(self) -> bool {
        self == ScriptVersion::V0
    }
}

/// One decoded instruction, owned so it outlives the code buffer it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the opcode in its buffer.
    pub at: u32,
    pub op: Opcode,
    pub operand: i32,
    /// Encoded length in bytes.
    pub len: u32,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op.has_operand() {
            write!(f, "{} {}", self.op, self.operand)
        } else {
            write!(f, "{}", self.op)
        }
    }
}

fn ensure(code: &[u8], at: u32, need: u32) -> Result<(), VmError> {
    let len = code.len() as u32;
    if at.saturating_add(need) > len {
        return Err(VmError::CodeOutOfRange { ip: at, len });
    }
    Ok(())
}

fn read_u32(code: &[u8], at: u32) -> Result<u32, VmError> {
    ensure(code, at, 4)?;
    let off = at as usize;
    Ok(LittleEndian::read_u32(&code[off..off + 4]))
}

/// Decodes the instruction starting at `at`.
pub fn decode(code: &[u8], at: u32, version: ScriptVersion) -> Result<Instruction, VmError> {
    if version.dword_code() {
        let word = read_u32(code, at)?;
        let op = u8::try_from(word)
            .ok()
            .and_then(|raw| Opcode::try_from(raw).ok())
            .ok_or(VmError::InvalidOpcode {
                opcode: word as u8,
                ip: at,
            })?;
        if !op.has_operand() {
            return Ok(Instruction {
                at,
                op,
                operand: 0,
                len: 4,
            });
        }
        let operand = read_u32(code, at + 4)? as i32;
        return Ok(Instruction {
            at,
            op,
            operand,
            len: 8,
        });
    }

    ensure(code, at, 1)?;
    let raw = code[at as usize];
    let op = Opcode::try_from(raw & OPMASK).map_err(|_| VmError::InvalidOpcode { opcode: raw, ip: at })?;
    if !op.has_operand() {
        return Ok(Instruction {
            at,
            op,
            operand: 0,
            len: 1,
        });
    }

    let body = at + 1;
    let (operand, width) = match raw & !OPMASK {
        0 => (read_u32(code, body)? as i32, 4),
        OPSIZE8 => {
            ensure(code, body, 1)?;
            (code[body as usize] as i8 as i32, 1)
        }
        OPSIZE16 => {
            ensure(code, body, 2)?;
            let off = body as usize;
            (LittleEndian::read_i16(&code[off..off + 2]) as i32, 2)
        }
        _ => return Err(VmError::InvalidOperandWidth { opcode: raw, ip: at }),
    };
    Ok(Instruction {
        at,
        op,
        operand,
        len: 1 + width,
    })
}

/// Decodes a whole buffer front to back.
pub fn decode_all(code: &[u8], version: ScriptVersion) -> Result<Vec<Instruction>, VmError> {
    let mut out = Vec::new();
    let mut at = 0u32;
    while (at as usize) < code.len() {
        let insn = decode(code, at, version)?;
        at += insn.len;
        out.push(insn);
    }
    Ok(out)
}
