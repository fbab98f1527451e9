//! Constants from the perf ABI and the parts of the ELF header we look at.
//!
//! The values mirror `include/uapi/linux/perf_event.h`; only the record
//! types and event types consumed by this crate are listed.

/// `PERF_RECORD_MMAP`
pub const PERF_RECORD_MMAP: u32 = 1;
/// `PERF_RECORD_SAMPLE`
pub const PERF_RECORD_SAMPLE: u32 = 9;
/// `PERF_RECORD_MMAP2`
pub const PERF_RECORD_MMAP2: u32 = 10;

/// `PERF_TYPE_HARDWARE`
pub const PERF_TYPE_HARDWARE: u32 = 0;
/// `PERF_TYPE_SOFTWARE`
pub const PERF_TYPE_SOFTWARE: u32 = 1;

/// Names for `perf_hw_id` config values, indexed by config.
pub const HW_EVENT_NAMES: [&str; 10] = [
    "cycles",
    "instructions",
    "cache-references",
    "cache-misses",
    "branch-instructions",
    "branch-misses",
    "bus-cycles",
    "stalled-cycles-frontend",
    "stalled-cycles-backend",
    "ref-cpu-cycles",
];

/// Names for `perf_sw_ids` config values, indexed by config.
pub const SW_EVENT_NAMES: [&str; 9] = [
    "cpu-clock",
    "task-clock",
    "page-faults",
    "context-switches",
    "cpu-migrations",
    "minor-faults",
    "major-faults",
    "alignment-faults",
    "emulation-faults",
];

/// Name used when an event's type/config pair is not in the tables above.
pub const UNKNOWN_EVENT_NAME: &str = "unknown";

/// Feature bit for the `HEADER_EVENT_DESC` section.
pub const HEADER_EVENT_DESC: u32 = 12;

/// `PROT_EXEC` in the `prot` field of an MMAP2 record.
pub const PROT_EXEC: u32 = 4;

/// `e_type` value for ELF shared objects and position-independent
/// executables.
pub const ET_DYN: u16 = 3;
