//! Symbol knowledge: the target ELF's symbol table, the ignore
//! predicate, call-site keys, and the input-buffer base address.

use crate::adapter::{Debugger, Frame, Location};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::tree::CallSiteKey;
use goblin::elf::Elf;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

lazy_static! {
    /// Dynamic-linker thunks, libc startup glue and sandbox helpers
    /// that never belong in a parse tree.
    static ref DEFAULT_IGNORE: Regex = Regex::new(
        "^_dl_|^__libc|^_start$|^__gmon|^frame_dummy$|@plt$|^_vgr|^vgPlain_"
    )
    .expect("default ignore pattern is valid");
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub from: u64,
    pub to: u64,
}

/// Static symbol table read from the target ELF. Runtime addresses come
/// from the debugger (which sees relocation); this table exists to fail
/// fast on missing symbols, to name addresses without a debugger
/// round-trip, and to remember the target's pointer width.
#[derive(Debug)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    /// From the ELF class: 4 on 32-bit targets (the on-chip
    /// microcontrollers), 8 on 64-bit ones.
    pointer_width: usize,
}

impl SymbolTable {
    pub fn from_elf_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path)?;
        let elf = Elf::parse(&contents)
            .map_err(|e| Error::ConfigInvalid(format!("{}: not an ELF: {}", path.display(), e)))?;
        let pointer_width = if elf.is_64 { 8 } else { 4 };

        let mut symbols = Vec::new();
        for sym in &elf.syms {
            let Some(name) = elf.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() || sym.st_value == 0 {
                continue;
            }
            symbols.push(Symbol {
                name: name.to_string(),
                from: sym.st_value,
                to: sym.st_value + sym.st_size.max(1),
            });
        }
        symbols.sort_by_key(|s| s.from);
        Ok(SymbolTable {
            symbols,
            pointer_width,
        })
    }

    pub fn pointer_width(&self) -> usize {
        self.pointer_width
    }

    pub fn lookup_addr(&self, addr: u64) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.from <= addr && addr < s.to)
    }

    pub fn lookup_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

pub struct Oracle {
    table: SymbolTable,
    binary: PathBuf,
    ignore: Regex,
    qualify: bool,
    entrypoint: Location,
    exitpoint: Option<Location>,
    input_buffer: String,
}

impl Oracle {
    pub fn new(config: &Config) -> Result<Self> {
        let table = SymbolTable::from_elf_file(&config.binary_file)?;
        if table.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "{} carries no symbols; debug info is required",
                config.binary_file.display()
            )));
        }
        info!(
            symbols = table.len(),
            binary = %config.binary_file.display(),
            "symbol table loaded"
        );

        let ignore = if config.ignore_functions_regex.is_empty() {
            DEFAULT_IGNORE.clone()
        } else {
            Regex::new(&config.ignore_functions_regex)?
        };

        let oracle = Oracle {
            table,
            binary: config.binary_file.clone(),
            ignore,
            qualify: config.qualify_call_sites,
            entrypoint: Location::parse(&config.entrypoint),
            exitpoint: match config.exitpoint.as_str() {
                "" => None,
                s => Some(Location::parse(s)),
            },
            input_buffer: config.input_buffer.clone(),
        };

        // fail fast: every configured symbol must exist in the binary
        oracle.check_symbol(&oracle.entrypoint)?;
        if let Some(exit) = &oracle.exitpoint {
            oracle.check_symbol(exit)?;
        }
        let buffer_symbol = oracle.input_buffer.trim_start_matches('*');
        if Location::parse(buffer_symbol) == Location::Symbol(buffer_symbol.to_string())
            && oracle.table.lookup_name(buffer_symbol).is_none()
        {
            return Err(Error::SymbolNotFound(
                buffer_symbol.to_string(),
                oracle.binary.clone(),
            ));
        }

        Ok(oracle)
    }

    /// Scripted-backend tests have no ELF to read; symbol presence is
    /// the backend's business there.
    #[cfg(test)]
    pub(crate) fn for_tests(config: &Config) -> Oracle {
        let ignore = if config.ignore_functions_regex.is_empty() {
            DEFAULT_IGNORE.clone()
        } else {
            Regex::new(&config.ignore_functions_regex).unwrap()
        };
        Oracle {
            table: SymbolTable {
                symbols: vec![],
                pointer_width: 8,
            },
            binary: config.binary_file.clone(),
            ignore,
            qualify: config.qualify_call_sites,
            entrypoint: Location::parse(&config.entrypoint),
            exitpoint: match config.exitpoint.as_str() {
                "" => None,
                s => Some(Location::parse(s)),
            },
            input_buffer: config.input_buffer.clone(),
        }
    }

    fn check_symbol(&self, location: &Location) -> Result<()> {
        if let Location::Symbol(name) = location {
            if self.table.lookup_name(name).is_none() {
                return Err(Error::SymbolNotFound(name.clone(), self.binary.clone()));
            }
        }
        Ok(())
    }

    pub fn entrypoint(&self) -> &Location {
        &self.entrypoint
    }

    pub fn exitpoint(&self) -> Option<&Location> {
        self.exitpoint.as_ref()
    }

    /// The entrypoint's nonterminal, which becomes the grammar's start
    /// symbol.
    pub fn start_symbol(&self) -> String {
        match &self.entrypoint {
            Location::Symbol(name) => CallSiteKey::new(name.clone()).name(),
            Location::Address(addr) => match self.table.lookup_addr(*addr) {
                Some(sym) => CallSiteKey::new(sym.name.clone()).name(),
                None => format!("sub_{:x}", addr),
            },
        }
    }

    pub fn should_ignore(&self, symbol: &str) -> bool {
        self.ignore.is_match(symbol)
    }

    pub fn ignore_regex(&self) -> &Regex {
        &self.ignore
    }

    /// The grammar identity of a frame; `caller` is the next-outer
    /// frame whose source location qualifies the key when enabled.
    pub fn call_site_key(&self, frame: &Frame, caller: Option<&Frame>) -> CallSiteKey {
        if self.qualify {
            if let Some(site) = caller.and_then(|c| c.source_location()) {
                return CallSiteKey::qualified(frame.func.clone(), site);
            }
        }
        CallSiteKey::new(frame.func.clone())
    }

    /// Read the input-buffer base once at entry. A leading `*` on the
    /// configured name means the symbol is a pointer cell holding the
    /// buffer address, so one dereference through target memory is
    /// needed. The cell is read at the target's pointer width (from the
    /// ELF class), not the host's.
    pub fn input_buffer_base(&self, dbg: &mut dyn Debugger) -> Result<u64> {
        let raw = self.input_buffer.as_str();
        let (deref, name) = match raw.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let cell = match Location::parse(name) {
            Location::Address(addr) => addr,
            Location::Symbol(symbol) => dbg.resolve_symbol(&symbol)?,
        };

        let base = if deref {
            let width = self.table.pointer_width();
            let bytes = dbg.read_memory(cell, width)?;
            if bytes.len() < width {
                return Err(Error::DebuggerProtocolError(format!(
                    "short read of pointer cell at {:#x}: {} of {} bytes",
                    cell,
                    bytes.len(),
                    width
                )));
            }
            let mut word = [0u8; 8];
            word[..width].copy_from_slice(&bytes[..width]);
            u64::from_le_bytes(word)
        } else {
            cell
        };
        debug!("input buffer at {:#x}", base);
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{StopEvent, WatchKind, WatchpointId};

    /// Answers memory reads from a fixed image and records how many
    /// bytes each read asked for.
    struct MemoryDebugger {
        image: Vec<u8>,
        image_base: u64,
        symbol_addr: u64,
        read_lens: Vec<usize>,
    }

    impl Debugger for MemoryDebugger {
        fn launch(&mut self, _: &Path, _: &[String], _: Option<&Path>) -> Result<()> {
            Ok(())
        }
        fn set_breakpoint(&mut self, _: &Location) -> Result<u32> {
            Ok(0)
        }
        fn continue_until_stop(&mut self) -> Result<StopEvent> {
            Ok(StopEvent::Exited(0))
        }
        fn step_instruction(&mut self) -> Result<StopEvent> {
            Ok(StopEvent::Stepped)
        }
        fn step_out(&mut self) -> Result<StopEvent> {
            Ok(StopEvent::Stepped)
        }
        fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
            self.read_lens.push(len);
            let offset = (addr - self.image_base) as usize;
            Ok(self.image[offset..offset + len].to_vec())
        }
        fn write_memory(&mut self, _: u64, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn get_registers(&mut self) -> Result<Vec<(String, u64)>> {
            Ok(vec![])
        }
        fn resolve_symbol(&mut self, _: &str) -> Result<u64> {
            Ok(self.symbol_addr)
        }
        fn get_backtrace(&mut self) -> Result<Vec<Frame>> {
            Ok(vec![])
        }
        fn set_watchpoint(&mut self, _: u64, _: usize, _: WatchKind) -> Result<WatchpointId> {
            Ok(1)
        }
        fn clear_watchpoint(&mut self, _: WatchpointId) -> Result<()> {
            Ok(())
        }
        fn watchpoint_capacity(&self) -> usize {
            usize::MAX
        }
    }

    /// On a 32-bit target the pointer cell is read at 4 bytes; the
    /// adjacent word must not leak into the buffer base.
    #[test]
    fn pointer_cell_deref_uses_target_width() {
        let config: Config = toml::from_str(
            r#"
seed_directory = "seeds"
output_directory = "out"
binary_file = "fw"
entrypoint = "parse_expr"
input_buffer = "*input_ptr"
"#,
        )
        .unwrap();
        let mut oracle = Oracle::for_tests(&config);
        oracle.table.pointer_width = 4;

        // cell holds 0x2000_0040 little-endian, followed by garbage
        let mut dbg = MemoryDebugger {
            image: vec![0x40, 0x00, 0x00, 0x20, 0xde, 0xad, 0xbe, 0xef],
            image_base: 0x2000_0000,
            symbol_addr: 0x2000_0000,
            read_lens: vec![],
        };
        let base = oracle.input_buffer_base(&mut dbg).unwrap();
        assert_eq!(base, 0x2000_0040);
        assert_eq!(dbg.read_lens, vec![4]);

        // a 64-bit table reads the full word
        oracle.table.pointer_width = 8;
        dbg.read_lens.clear();
        let base = oracle.input_buffer_base(&mut dbg).unwrap();
        assert_eq!(base, 0xefbe_adde_2000_0040);
        assert_eq!(dbg.read_lens, vec![8]);
    }

    #[test]
    fn default_ignore_hits_linker_glue() {
        assert!(DEFAULT_IGNORE.is_match("_dl_runtime_resolve"));
        assert!(DEFAULT_IGNORE.is_match("__libc_start_main"));
        assert!(DEFAULT_IGNORE.is_match("memcpy@plt"));
        assert!(!DEFAULT_IGNORE.is_match("parse_expr"));
        assert!(!DEFAULT_IGNORE.is_match("json_parse_value"));
    }

    #[test]
    fn configured_ignore_pattern_replaces_default() {
        let config: Config = toml::from_str(
            r#"
seed_directory = "seeds"
output_directory = "out"
binary_file = "calc"
entrypoint = "parse_expr"
input_buffer = "input"
ignore_functions_regex = "^helper_"
"#,
        )
        .unwrap();
        let oracle = Oracle::for_tests(&config);
        assert!(oracle.should_ignore("helper_skip_ws"));
        assert!(!oracle.should_ignore("_dl_runtime_resolve"));
        assert!(!oracle.should_ignore("parse_expr"));
        assert_eq!(oracle.start_symbol(), "parse_expr");
    }

    #[test]
    fn call_site_qualification_is_opt_in() {
        let base = r#"
seed_directory = "seeds"
output_directory = "out"
binary_file = "calc"
entrypoint = "parse_expr"
input_buffer = "input"
"#;
        let inner = Frame {
            level: 0,
            addr: 0x400646,
            func: "parse_num".into(),
            file: Some("calc.c".into()),
            line: Some(23),
        };
        let caller = Frame {
            level: 1,
            addr: 0x4006aa,
            func: "parse_expr".into(),
            file: Some("calc.c".into()),
            line: Some(41),
        };

        let plain: Config = toml::from_str(base).unwrap();
        let key = Oracle::for_tests(&plain).call_site_key(&inner, Some(&caller));
        assert_eq!(key.nonterminal(), "<parse_num>");

        let qualified: Config =
            toml::from_str(&format!("{}qualify_call_sites = true\n", base)).unwrap();
        let key = Oracle::for_tests(&qualified).call_site_key(&inner, Some(&caller));
        assert_eq!(key.nonterminal(), "<parse_num@calc.c:41>");
    }

    #[test]
    fn symbol_table_lookup() {
        let table = SymbolTable {
            symbols: vec![
                Symbol {
                    name: "parse_expr".into(),
                    from: 0x400600,
                    to: 0x400680,
                },
                Symbol {
                    name: "parse_num".into(),
                    from: 0x400680,
                    to: 0x4006c0,
                },
            ],
            pointer_width: 8,
        };
        assert_eq!(table.lookup_addr(0x400610).unwrap().name, "parse_expr");
        assert_eq!(table.lookup_addr(0x400680).unwrap().name, "parse_num");
        assert!(table.lookup_addr(0x400500).is_none());
        assert_eq!(table.lookup_name("parse_num").unwrap().from, 0x400680);
    }
}
