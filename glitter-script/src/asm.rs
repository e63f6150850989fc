//! Minimal bytecode emitter, the inverse of [`crate::decode`].

use crate::decode::ScriptVersion;
use crate::opcode::{Opcode, OPSIZE16, OPSIZE8};

#[derive(Debug, Clone)]
pub struct Assembler {
    version: ScriptVersion,
    code: Vec<u8>,
}

impl Assembler {
    pub fn new(version: ScriptVersion) -> Self {
        Self {
            version,
            code: Vec::new(),
        }
    }

    /// Offset the next instruction will be emitted at.
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Pads with `noop` up to `at`.
    pub fn pad_to(&mut self, at: u32) -> &mut Self {
        while self.here() < at {
            self.op(Opcode::Noop);
        }
        self
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.emit(op, 0)
    }

    /// Emits `op` with `operand` in the narrowest encoding that holds it.
    /// The operand is dropped for opcodes that take none.
    pub fn emit(&mut self, op: Opcode, operand: i32) -> &mut Self {
        if self.version.dword_code() {
            self.code.extend_from_slice(&(op as u32).to_le_bytes());
            if op.has_operand() {
                self.code.extend_from_slice(&operand.to_le_bytes());
            }
            return self;
        }

        if !op.has_operand() {
            self.code.push(op as u8);
        } else if let Ok(byte) = i8::try_from(operand) {
            self.code.push(op as u8 | OPSIZE8);
            self.code.push(byte as u8);
        } else if let Ok(word) = i16::try_from(operand) {
            self.code.push(op as u8 | OPSIZE16);
            self.code.extend_from_slice(&word.to_le_bytes());
        } else {
            self.code.push(op as u8);
            self.code.extend_from_slice(&operand.to_le_bytes());
        }
        self
    }

    /// Emits `op` with a full-width operand to be filled in by [`Assembler::bind`].
    /// Returns the operand's position.
    pub fn emit_forward(&mut self, op: Opcode) -> usize {
        if self.version.dword_code() {
            self.code.extend_from_slice(&(op as u32).to_le_bytes());
        } else {
            self.code.push(op as u8);
        }
        let at = self.code.len();
        self.code.extend_from_slice(&0i32.to_le_bytes());
        at
    }

    /// Points the forward operand at `slot` to the current offset.
    pub fn bind(&mut self, slot: usize) -> &mut Self {
        let here = self.here() as i32;
        self.code[slot..slot + 4].copy_from_slice(&here.to_le_bytes());
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        self.code.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_all;
    use pretty_assertions::assert_eq;

    #[test]
    fn emitted_code_decodes_back() {
        for version in [ScriptVersion::V0, ScriptVersion::V2] {
            let mut asm = Assembler::new(version);
            asm.emit(Opcode::Imm, 5).emit(Opcode::Imm, 300).emit(Opcode::Imm, -70_000);
            let skip = asm.emit_forward(Opcode::Jump);
            asm.op(Opcode::Noop);
            asm.bind(skip).op(Opcode::Halt);

            let insns = decode_all(&asm.finish(), version).unwrap();
            let ops: Vec<_> = insns.iter().map(|i| (i.op, i.operand)).collect();
            assert_eq!(
                ops,
                vec![
                    (Opcode::Imm, 5),
                    (Opcode::Imm, 300),
                    (Opcode::Imm, -70_000),
                    (Opcode::Jump, insns[5].at as i32),
                    (Opcode::Noop, 0),
                    (Opcode::Halt, 0),
                ]
            );
        }
    }

    #[test]
    fn narrow_encodings() {
        let mut asm = Assembler::new(ScriptVersion::V2);
        asm.emit(Opcode::GStore, 206).emit(Opcode::Zero, 99);
        assert_eq!(asm.finish(), vec![Opcode::GStore as u8 | OPSIZE16, 206, 0, Opcode::Zero as u8]);
    }
}
