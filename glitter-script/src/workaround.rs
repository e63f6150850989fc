//! Bytecode substitutions for known faulty shipped scripts.
//!
//! When a context is about to fetch from `(version, code, ip)` of an entry,
//! the entry's bytes are executed instead of the real code. `ip` keeps
//! advancing by the bytes consumed, so once the patch runs out the fetch
//! continues from the real code at `entry.ip + patch length`.

use glitter_core::Handle;

use crate::decode::ScriptVersion;
use crate::opcode::{Opcode, OPSIZE16};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkaroundEntry {
    pub version: ScriptVersion,
    pub code: Handle,
    pub ip: u32,
    pub bytes: &'static [u8],
}

/// Clears global 206 before the script reads it.
const RESET_GLOBAL_206: &[u8] = &[Opcode::Zero as u8, Opcode::GStore as u8 | OPSIZE16, 206, 0];

pub static WORKAROUNDS: &[WorkaroundEntry] = &[WorkaroundEntry {
    version: ScriptVersion::V1,
    code: Handle(0x1A2B_3C4F),
    ip: 100,
    bytes: RESET_GLOBAL_206,
}];

/// Index of the entry patching `(version, code, ip)`, if any.
pub fn lookup(table: &[WorkaroundEntry], version: ScriptVersion, code: Handle, ip: u32) -> Option<usize> {
    table
        .iter()
        .position(|entry| entry.version == version && entry.code == code && entry.ip == ip)
}
