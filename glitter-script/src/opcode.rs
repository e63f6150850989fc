use std::convert::TryFrom;
use std::fmt;

/// Operand is a signed byte.
pub const OPSIZE8: u8 = 0x40;
/// Operand is a signed 16-bit word.
pub const OPSIZE16: u8 = 0x80;
/// Low bits selecting the opcode.
pub const OPMASK: u8 = 0x3F;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Noop = 0,
    Halt,
    Imm,
    Zero,
    One,
    MinusOne,
    Str,
    Film,
    Font,
    Pal,
    Load,
    GLoad,
    Store,
    GStore,
    Call,
    LibCall,
    Ret,
    Alloc,
    Jump,
    JmpFalse,
    JmpTrue,
    Equal,
    Less,
    LEqual,
    NEqual,
    GEqual,
    Great,
    Plus,
    Minus,
    LOr,
    Mult,
    Div,
    Mod,
    And,
    Or,
    Eor,
    LAnd,
    Not,
    Comp,
    Neg,
    Dup,
    EscOn,
    EscOff,
}

const OPCODES: [Opcode; 43] = [
    Opcode::Noop,
    Opcode::Halt,
    Opcode::Imm,
    Opcode::Zero,
    Opcode::One,
    Opcode::MinusOne,
    Opcode::Str,
    Opcode::Film,
    Opcode::Font,
    Opcode::Pal,
    Opcode::Load,
    Opcode::GLoad,
    Opcode::Store,
    Opcode::GStore,
    Opcode::Call,
    Opcode::LibCall,
    Opcode::Ret,
    Opcode::Alloc,
    Opcode::Jump,
    Opcode::JmpFalse,
    Opcode::JmpTrue,
    Opcode::Equal,
    Opcode::Less,
    Opcode::LEqual,
    Opcode::NEqual,
    Opcode::GEqual,
    Opcode::Great,
    Opcode::Plus,
    Opcode::Minus,
    Opcode::LOr,
    Opcode::Mult,
    Opcode::Div,
    Opcode::Mod,
    Opcode::And,
    Opcode::Or,
    Opcode::Eor,
    Opcode::LAnd,
    Opcode::Not,
    Opcode::Comp,
    Opcode::Neg,
    Opcode::Dup,
    Opcode::EscOn,
    Opcode::EscOff,
];

impl TryFrom<u8> for Opcode {
    type Error = ();

    /// Accepts the opcode bits only; strip the width bits with [`OPMASK`] first.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        OPCODES.get(v as usize).copied().ok_or(())
    }
}

impl Opcode {
    /// Whether an operand follows the opcode.
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Opcode::Imm
                | Opcode::Str
                | Opcode::Film
                | Opcode::Font
                | Opcode::Pal
                | Opcode::Load
                | Opcode::GLoad
                | Opcode::Store
                | Opcode::GStore
                | Opcode::Call
                | Opcode::LibCall
                | Opcode::Alloc
                | Opcode::Jump
                | Opcode::JmpFalse
                | Opcode::JmpTrue
        )
    }

    /// Transfers control when executed (possibly conditionally).
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Call | Opcode::Ret | Opcode::Jump | Opcode::JmpFalse | Opcode::JmpTrue
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Noop => "noop",
            Opcode::Halt => "halt",
            Opcode::Imm => "imm",
            Opcode::Zero => "zero",
            Opcode::One => "one",
            Opcode::MinusOne => "minusone",
            Opcode::Str => "str",
            Opcode::Film => "film",
            Opcode::Font => "font",
            Opcode::Pal => "pal",
            Opcode::Load => "load",
            Opcode::GLoad => "gload",
            Opcode::Store => "store",
            Opcode::GStore => "gstore",
            Opcode::Call => "call",
            Opcode::LibCall => "libcall",
            Opcode::Ret => "ret",
            Opcode::Alloc => "alloc",
            Opcode::Jump => "jump",
            Opcode::JmpFalse => "jmpfalse",
            Opcode::JmpTrue => "jmptrue",
            Opcode::Equal => "equal",
            Opcode::Less => "less",
            Opcode::LEqual => "lequal",
            Opcode::NEqual => "nequal",
            Opcode::GEqual => "gequal",
            Opcode::Great => "great",
            Opcode::Plus => "plus",
            Opcode::Minus => "minus",
            Opcode::LOr => "lor",
            Opcode::Mult => "mult",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Eor => "eor",
            Opcode::LAnd => "land",
            Opcode::Not => "not",
            Opcode::Comp => "comp",
            Opcode::Neg => "neg",
            Opcode::Dup => "dup",
            Opcode::EscOn => "escon",
            Opcode::EscOff => "escoff",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_discriminants() {
        for (i, op) in OPCODES.iter().enumerate() {
            assert_eq!(*op as usize, i);
            assert_eq!(Opcode::try_from(i as u8), Ok(*op));
        }
        assert_eq!(Opcode::EscOff as u8, 42);
        assert!(Opcode::try_from(43).is_err());
        assert!(Opcode::try_from(OPMASK).is_err());
    }

    #[test]
    fn ret_carries_no_operand() {
        assert!(!Opcode::Ret.has_operand());
        assert!(Opcode::Ret.is_branch());
        assert!(Opcode::LibCall.has_operand());
        assert!(!Opcode::LibCall.is_branch());
    }
}
