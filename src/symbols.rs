use crate::error::ToolError;
use crate::reader::Map;
use crate::subprocess::ShellLines;

/// A text-segment symbol with a half-open `[start, end)` address range.
///
/// The derived ordering sorts by `start` first, which is what the
/// emission join relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Symbol {
    pub start: u64,
    pub end: u64,
    pub name: String,
}

/// The symbols of one mapped binary, listed by the `nm` tool.
///
/// [`SymbolTable::reset`] runs `nm` twice, once for dynamic and once for
/// static symbols, keeps text-segment and weak symbols, and merges the two
/// passes into a sorted, deduplicated list.
pub struct SymbolTable {
    nm: String,
    binary_cache_root: String,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(nm: impl Into<String>, binary_cache_root: impl Into<String>) -> Self {
        Self {
            nm: nm.into(),
            binary_cache_root: binary_cache_root.into(),
            symbols: Vec::new(),
        }
    }

    pub fn reset(&mut self, map: &Map) -> Result<(), ToolError> {
        self.symbols.clear();
        self.fetch_symbols(map, true)?;
        self.fetch_symbols(map, false)?;
        self.symbols.sort_unstable();
        self.symbols.dedup();
        Ok(())
    }

    fn fetch_symbols(&mut self, map: &Map, dynamic: bool) -> Result<(), ToolError> {
        let dynamic_flag = if dynamic { "-D " } else { "" };
        let command = format!(
            "{} {}-S --defined-only {}{} 2>/dev/null",
            self.nm, dynamic_flag, self.binary_cache_root, map.filename
        );
        for line in ShellLines::spawn(&command)? {
            if let Some(symbol) = parse_nm_line(&line) {
                self.symbols.push(symbol);
            }
        }
        Ok(())
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Parse one line of `nm -S` output: hex start, hex extent, a one-char
/// symbol type, and the symbol name. Only text-segment (`T`/`t`) and weak
/// (`V`/`v`/`W`/`w`) symbols are kept; see `man nm` for the type letters.
fn parse_nm_line(line: &str) -> Option<Symbol> {
    let mut fields = line.split_whitespace();
    let start = fields.next()?;
    let extent = fields.next()?;
    let kind = fields.next()?;
    let name = fields.next()?;

    let start = u64::from_str_radix(start, 16).ok()?;
    let extent = u64::from_str_radix(extent, 16).ok()?;
    if !matches!(kind, "T" | "t" | "V" | "v" | "W" | "w") {
        return None;
    }
    Some(Symbol {
        start,
        end: start.checked_add(extent)?,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_symbols() {
        assert_eq!(
            parse_nm_line("0000000000001040 0000000000000026 T main"),
            Some(Symbol {
                start: 0x1040,
                end: 0x1066,
                name: "main".to_string(),
            })
        );
        assert_eq!(
            parse_nm_line("00000000000010a0 0000000000000010 w _fini"),
            Some(Symbol {
                start: 0x10a0,
                end: 0x10b0,
                name: "_fini".to_string(),
            })
        );
    }

    #[test]
    fn skips_non_text_symbols_and_short_lines() {
        assert_eq!(parse_nm_line("0000000000004010 0000000000000008 B bss_var"), None);
        assert_eq!(parse_nm_line("0000000000001040 T main"), None);
        assert_eq!(parse_nm_line(""), None);
        assert_eq!(parse_nm_line("not hex at all"), None);
    }

    #[test]
    fn reset_merges_and_dedups_the_two_passes() {
        let map = Map {
            start: 0x1000,
            end: 0x2000,
            adjust: 0,
            filename: "ignored".to_string(),
        };
        // The trailing '#' swallows the flags and path appended by the
        // table, so both passes print the same two symbols.
        let mut table = SymbolTable::new(
            "printf '2000 10 T beta\\n1000 10 T alpha\\n' #",
            "",
        );
        table.reset(&map).unwrap();
        assert_eq!(
            table.symbols(),
            &[
                Symbol {
                    start: 0x1000,
                    end: 0x1010,
                    name: "alpha".to_string(),
                },
                Symbol {
                    start: 0x2000,
                    end: 0x2010,
                    name: "beta".to_string(),
                },
            ]
        );
    }
}
