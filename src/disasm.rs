use crate::error::ToolError;
use crate::reader::Map;
use crate::subprocess::ShellLines;

/// Streams disassembled instructions for an address range of a binary.
///
/// [`Disassembler::reset`] launches `objdump -d` over `[start, stop + 4)`;
/// [`Disassembler::next`] yields `(address, text)` pairs in the order the
/// tool prints them, which is by non-decreasing address. Once the tool's
/// output ends, `next` keeps returning the `(stop, "")` sentinel.
pub struct Disassembler {
    objdump: String,
    binary_cache_root: String,
    stream: Option<ShellLines>,
    stop: u64,
}

impl Disassembler {
    pub fn new(objdump: impl Into<String>, binary_cache_root: impl Into<String>) -> Self {
        Self {
            objdump: objdump.into(),
            binary_cache_root: binary_cache_root.into(),
            stream: None,
            stop: 0,
        }
    }

    pub fn reset(&mut self, map: &Map, start: u64, stop: u64) -> Result<(), ToolError> {
        // Reap any previous child before starting the next one.
        self.stream = None;
        // Stop 4 bytes past the symbol end so the final instruction is
        // never cut off.
        let command = format!(
            "{} -d --no-show-raw-insn --start-address={:#x} --stop-address={:#x} {}{} 2>/dev/null",
            self.objdump,
            start,
            stop + 4,
            self.binary_cache_root,
            map.filename
        );
        self.stream = Some(ShellLines::spawn(&command)?);
        self.stop = stop;
        Ok(())
    }

    /// The next instruction line. Lines that do not parse as
    /// `<hex address>: <text>` (section headers, labels, blanks) are
    /// skipped.
    pub fn next(&mut self) -> (u64, String) {
        if let Some(stream) = self.stream.as_mut() {
            for line in stream {
                if let Some(instruction) = parse_instruction_line(&line) {
                    return instruction;
                }
            }
            self.stream = None;
        }
        (self.stop, String::new())
    }
}

/// Split an objdump line on its first `:`; the left side must be entirely
/// hex (after surrounding whitespace) to count as an instruction address.
fn parse_instruction_line(line: &str) -> Option<(u64, String)> {
    let (address, text) = line.split_once(':')?;
    let address = u64::from_str_radix(address.trim(), 16).ok()?;
    Some((address, text.to_string()))
}
