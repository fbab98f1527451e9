//! # linux-perf-import
//!
//! This crate reads `perf.data` files produced by the Linux `perf`
//! sampling tool and turns them into per-function, per-instruction event
//! counters.
//!
//! The file is memory-mapped and streamed in a single pass: every sample
//! is attributed to the executable mapping that covered its PC at the
//! sample's timestamp, and aggregated into whole-file, per-mapping and
//! per-PC counters. Mappings holding more than 1% of some event are then
//! symbolized with `nm` and disassembled with `objdump`, and each
//! relevant symbol is emitted as a function whose instructions carry the
//! counters of the samples that hit them.
//!
//! ## Example
//!
//! ```no_run
//! use linux_perf_import::{import_perf, ImportOptions};
//!
//! # fn wrapper() -> Result<(), linux_perf_import::Error> {
//! let profile = import_perf("perf.data", ImportOptions::default())?;
//! for (name, count) in &profile.counters {
//!     println!("{name}: {count}");
//! }
//! for (name, function) in &profile.functions {
//!     println!("{name}: {:?}", function.counters);
//! }
//! # Ok(())
//! # }
//! ```

mod constants;
mod cursor;
mod disasm;
mod error;
mod event_desc;
mod header;
mod profile;
mod reader;
mod subprocess;
mod symbols;

use std::path::Path;

pub use disasm::Disassembler;
pub use error::{Error, FormatError, InternalError, ToolError};
pub use profile::{Counters, Function, Line, Profile};
pub use reader::{Map, PerfReader};
pub use symbols::{Symbol, SymbolTable};

/// Options accepted by [`import_perf`].
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Command used to enumerate symbols, invoked as
    /// `<nm> [-D] -S --defined-only <binary_cache_root><path>`.
    pub nm: String,
    /// Command used to disassemble, invoked as
    /// `<objdump> -d --no-show-raw-insn --start-address=<a> --stop-address=<b> <binary_cache_root><path>`.
    pub objdump: String,
    /// Directory prefix prepended to every binary path before invoking
    /// the tools.
    pub binary_cache_root: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            nm: "nm".to_string(),
            objdump: "objdump".to_string(),
            binary_cache_root: String::new(),
        }
    }
}

/// Import a perf.data file and return the annotated profile.
pub fn import_perf(filename: impl AsRef<Path>, options: ImportOptions) -> Result<Profile, Error> {
    PerfReader::open(filename, options)?.import()
}
