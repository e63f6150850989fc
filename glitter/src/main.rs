mod config;

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};

use glitter_core::handle::OFFSET_MASK;
use glitter_core::{DirProvider, Handle, HandleTable, StreamProvider};
use glitter_script::{decode, Globals, ScriptVersion};

use config::ToolConfig;

#[derive(ClapParser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML file with `resources`, `script` and `logger` sections.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every resource of the index.
    Index {
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Disassemble a code resource.
    Disasm {
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        /// Resource name as written in the index.
        name: String,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Print a globals save file.
    Globals {
        input: PathBuf,
        /// Also print globals that are zero.
        #[arg(short, long)]
        all: bool,
    },
}

fn open_table(config: &ToolConfig, dir: PathBuf) -> Result<HandleTable<DirProvider>> {
    let mut table = HandleTable::new(config.resources.clone(), DirProvider::new(dir));
    table.load_index().context("load resource index")?;
    Ok(table)
}

fn list_index<P: StreamProvider>(table: &HandleTable<P>, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{:>4}  {:8}  {:12}  {:>8}  {:>8}  flags", "#", "handle", "name", "size", "media")?;
    for (index, descriptor) in table.descriptors().iter().enumerate() {
        let flags: Vec<&str> = descriptor.flags().iter_names().map(|(name, _)| name).collect();
        writeln!(
            out,
            "{:>4}  {}  {:12}  {:>8}  {:>8X}  {}",
            index,
            Handle::new(index, 0),
            descriptor.name(),
            descriptor.size(),
            descriptor.media(),
            flags.join("|")
        )?;
    }
    Ok(())
}

fn offset_handle(base: Handle, offset: u32) -> Result<Handle> {
    let offset = match base.offset().checked_add(offset) {
        Some(offset) if offset <= OFFSET_MASK => offset,
        _ => bail!("offset {offset:#X} is past the largest handle offset {OFFSET_MASK:#X}"),
    };
    Ok(Handle::new(base.index(), offset))
}

/// Writes one line per instruction; stops at the first undecodable byte.
fn disassemble(code: &[u8], version: ScriptVersion, out: &mut impl Write) -> Result<usize> {
    let mut at = 0u32;
    let mut count = 0;
    while (at as usize) < code.len() {
        match decode(code, at, version) {
            Ok(insn) => {
                writeln!(out, "{:06X}  {}", insn.at, insn)?;
                at += insn.len;
                count += 1;
            }
            Err(e) => {
                writeln!(out, "; {} trailing bytes not decoded: {}", code.len() - at as usize, e)?;
                break;
            }
        }
    }
    Ok(count)
}

fn dump_globals(globals: &Globals, all: bool, out: &mut impl Write) -> Result<()> {
    writeln!(out, "; {} globals", globals.len())?;
    for (index, value) in globals.as_slice().iter().enumerate() {
        if all || *value != 0 {
            writeln!(out, "{:5} = {}", index, value)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = ToolConfig::load_or_default(args.config.as_deref())?;
    config.logger.install();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.command {
        Command::Index { dir } => {
            let table = open_table(&config, dir)?;
            list_index(&table, &mut out)?;
        }
        Command::Disasm { dir, name, offset } => {
            let mut table = open_table(&config, dir)?;
            table.initialize_residency().context("initialize residency")?;
            let handle = table
                .find(&name)
                .with_context(|| format!("no resource named {name}"))?;
            let handle = offset_handle(handle, offset)?;
            let code = table.resolve(handle).with_context(|| format!("resolve {handle}"))?;
            let count = disassemble(code, config.script.version(), &mut out)?;
            log::info!("{}: {} instructions", name, count);
        }
        Command::Globals { input, all } => {
            let file = File::open(&input).with_context(|| format!("open {}", input.display()))?;
            let globals = Globals::load(BufReader::new(file))
                .with_context(|| format!("read globals from {}", input.display()))?;
            dump_globals(&globals, all, &mut out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glitter_core::handle::build_index;
    use glitter_core::{IndexRecord, IndexRevision, MemProvider, ResourceConfig, ResourceFlags};
    use glitter_script::asm::Assembler;
    use glitter_script::Opcode;
    use pretty_assertions::assert_eq;

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn index_listing() {
        let records = [
            IndexRecord::new("SCENE1.SCN", 0x120, ResourceFlags::DISCARDABLE),
            IndexRecord::new("FONT.FNT", 64, ResourceFlags::PRELOAD | ResourceFlags::GRAPHIC).with_media(2),
        ];
        let provider = MemProvider::new().with_file("INDEX", build_index(&records, IndexRevision::Current));
        let mut table = HandleTable::new(ResourceConfig::default(), provider);
        table.load_index().unwrap();

        let mut out = Vec::new();
        list_index(&table, &mut out).unwrap();
        let out = text(out);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("00000000  SCENE1.SCN"));
        assert!(lines[1].ends_with("DISCARDABLE"));
        assert!(lines[2].contains("00800000  FONT.FNT"));
        assert!(lines[2].ends_with("PRELOAD|GRAPHIC"));
    }

    #[test]
    fn disassembly_stops_at_garbage() {
        let mut a = Assembler::new(ScriptVersion::V2);
        a.emit(Opcode::Imm, 300).emit(Opcode::GStore, 4).op(Opcode::Halt);
        let mut code = a.finish();
        code.push(0xFF);

        let mut out = Vec::new();
        assert_eq!(disassemble(&code, ScriptVersion::V2, &mut out).unwrap(), 3);
        let out = text(out);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(&lines[..3], &["000000  imm 300", "000003  gstore 4", "000005  halt"]);
        assert!(lines[3].starts_with("; 1 trailing bytes not decoded"));
    }

    #[test]
    fn offsets_stay_inside_the_resource() {
        let base = Handle::new(3, 0);
        assert_eq!(offset_handle(base, 0x40).unwrap(), Handle::new(3, 0x40));
        assert_eq!(offset_handle(base, OFFSET_MASK).unwrap().index(), 3);
        assert!(offset_handle(base, OFFSET_MASK + 1).is_err());
        assert!(offset_handle(base, u32::MAX).is_err());
    }

    #[test]
    fn globals_dump_skips_zeroes() {
        let globals = Globals::from_values(vec![0, 5, 0, -1]);
        let mut out = Vec::new();
        dump_globals(&globals, false, &mut out).unwrap();
        assert_eq!(text(out), "; 4 globals\n    1 = 5\n    3 = -1\n");
    }
}
