use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use linear_map::LinearMap;
use memmap2::Mmap;
use tracing::{debug, warn};

use crate::constants::*;
use crate::cursor::ByteCursor;
use crate::disasm::Disassembler;
use crate::error::{Error, FormatError, InternalError, ToolError};
use crate::event_desc::{EventDescTable, EventName, EventNameTable, SampleFormat};
use crate::header::{FileSpan, PerfHeader};
use crate::profile::{Profile, ProfileBuilder};
use crate::symbols::{Symbol, SymbolTable};
use crate::ImportOptions;

/// Per-event counts, keyed by interned name. A profile rarely tracks more
/// than a handful of events, so a linear map beats hashing here.
type CountsByName = LinearMap<EventName, u64>;

/// `perf_sample_id`, the trailer on non-sample records:
/// `{pid: u32, tid: u32, time: u64, id: u64}`.
const PERF_SAMPLE_ID_SIZE: usize = 24;

/// An executable memory mapping observed in the data stream. Maps are
/// appended as discovered; their index in the map table never changes.
#[derive(Debug, Clone)]
pub struct Map {
    pub start: u64,
    pub end: u64,
    /// Subtracted from raw sample IPs to recover file-relative PCs:
    /// `start - pgoff` for DYN images, 0 otherwise.
    pub adjust: u64,
    pub filename: String,
}

/// Canonical sample fields. Fields absent from the layout stay zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Sample {
    id: u64,
    ip: u64,
    #[allow(dead_code)]
    pid: u32,
    #[allow(dead_code)]
    tid: u32,
    time: u64,
    period: u64,
}

/// Everything accumulated during the single pass over the data section.
#[derive(Default)]
struct Aggregates {
    maps: Vec<Map>,
    /// time -> (mapping start -> index into `maps`), recording which
    /// mappings appeared at which timestamp.
    current_maps: BTreeMap<u64, BTreeMap<u64, usize>>,
    /// map index -> raw sample PC -> per-event counts.
    samples: BTreeMap<usize, BTreeMap<u64, CountsByName>>,
    /// Whole-file per-event totals.
    totals: CountsByName,
    /// map index -> per-event totals.
    map_totals: HashMap<usize, CountsByName>,
}

/// A reader for perf.data profiles.
///
/// [`PerfReader::open`] maps the file and validates the header;
/// [`PerfReader::import`] runs the aggregation and emission passes and
/// returns the annotated [`Profile`].
pub struct PerfReader {
    buffer: Mmap,
    header: PerfHeader,
    options: ImportOptions,
}

impl PerfReader {
    pub fn open(filename: impl AsRef<Path>, options: ImportOptions) -> Result<Self, Error> {
        let file = File::open(filename)?;
        // Safety: the mapping is read-only and perf.data files are not
        // rewritten in place while being imported.
        let buffer = unsafe { Mmap::map(&file)? };
        let header = PerfHeader::parse(&mut ByteCursor::new(&buffer))?;
        Ok(Self {
            buffer,
            header,
            options,
        })
    }

    /// Run the full import: read the event descriptors, stream the data
    /// section into the aggregates, then join them with symbol tables and
    /// disassembly into the result tree.
    pub fn import(&self) -> Result<Profile, Error> {
        let file = ByteCursor::new(&self.buffer[..]);
        let mut names = EventNameTable::default();
        let event_descs = self.read_attrs(file, &mut names)?;
        let mut state = Aggregates::default();
        self.read_data_stream(file, &event_descs, &mut state)?;
        Ok(self.emit(&names, &state))
    }

    fn read_attrs(
        &self,
        file: ByteCursor,
        names: &mut EventNameTable,
    ) -> Result<EventDescTable, Error> {
        let table = if self.header.features.is_set(HEADER_EVENT_DESC) {
            let section = self.locate_event_desc_section(file)?;
            let mut cursor = file.cursor_at(to_usize(section.offset)?)?;
            let bytes = cursor
                .take_bytes(to_usize(section.size)?)
                .map_err(|_| FormatError::SectionOutOfBounds)?;
            EventDescTable::parse_event_desc_section(ByteCursor::new(bytes), names)
                .map_err(|_| FormatError::EventDescSection)?
        } else {
            EventDescTable::parse_attr_section(file, &self.header, names)?
        };
        Ok(table)
    }

    /// Find the `HEADER_EVENT_DESC` feature section. The feature sections
    /// are one `(offset, size)` pair per set feature bit, in ascending
    /// bit order, starting right after the data section.
    fn locate_event_desc_section(&self, file: ByteCursor) -> Result<FileSpan, FormatError> {
        let feature_pos = self.header.data_section.offset + self.header.data_section.size;
        let mut cursor = file.cursor_at(to_usize(feature_pos)?)?;
        for feature in self.header.features.set_bits() {
            let section = FileSpan::read(&mut cursor)?;
            if feature == HEADER_EVENT_DESC {
                return Ok(section);
            }
        }
        Err(FormatError::EventDescSection)
    }

    fn read_data_stream(
        &self,
        file: ByteCursor,
        event_descs: &EventDescTable,
        state: &mut Aggregates,
    ) -> Result<(), Error> {
        let mut cursor = file.cursor_at(to_usize(self.header.data_section.offset)?)?;
        let section_bytes = cursor
            .take_bytes(to_usize(self.header.data_section.size)?)
            .map_err(|_| FormatError::SectionOutOfBounds)?;
        let mut cursor = ByteCursor::new(section_bytes);

        let layout = event_descs.layout().unwrap_or(SampleFormat::empty());

        while !cursor.is_empty() {
            let type_ = cursor.take_u32().map_err(|_| FormatError::RecordHeader)?;
            let _misc = cursor.take_u16().map_err(|_| FormatError::RecordHeader)?;
            let size = cursor.take_u16().map_err(|_| FormatError::RecordHeader)?;

            const HEADER_SIZE: usize = 4 + 2 + 2;
            if (size as usize) < HEADER_SIZE {
                return Err(FormatError::InvalidRecordSize.into());
            }
            let payload = cursor
                .take_bytes(size as usize - HEADER_SIZE)
                .map_err(|_| FormatError::MisalignedRecord)?;
            let payload = ByteCursor::new(payload);

            match type_ {
                PERF_RECORD_MMAP => self.handle_mmap(payload, false, state)?,
                PERF_RECORD_MMAP2 => self.handle_mmap(payload, true, state)?,
                PERF_RECORD_SAMPLE => handle_sample(payload, layout, event_descs, state)?,
                other => debug!(record_type = other, "skipping unhandled record"),
            }
        }
        Ok(())
    }

    fn handle_mmap(
        &self,
        mut payload: ByteCursor,
        is_mmap2: bool,
        state: &mut Aggregates,
    ) -> Result<(), Error> {
        let _pid = payload.take_u32()?;
        let _tid = payload.take_u32()?;
        let start = payload.take_u64()?;
        let extent = payload.take_u64()?;
        let pgoff = payload.take_u64()?;
        if is_mmap2 {
            let _maj = payload.take_u32()?;
            let _min = payload.take_u32()?;
            let _ino = payload.take_u64()?;
            let _ino_generation = payload.take_u64()?;
            let prot = payload.take_u32()?;
            let _flags = payload.take_u32()?;
            if prot & PROT_EXEC == 0 {
                return Ok(());
            }
        }

        // The filename is NUL-terminated and padded up to the
        // perf_sample_id trailer at the end of the record.
        let remaining = payload.remaining();
        if remaining < PERF_SAMPLE_ID_SIZE {
            return Err(FormatError::RecordPayload.into());
        }
        let filename_region = payload.take_bytes(remaining - PERF_SAMPLE_ID_SIZE)?;
        let nul = memchr::memchr(0, filename_region).unwrap_or(filename_region.len());
        let filename = String::from_utf8_lossy(&filename_region[..nul]).into_owned();

        let _pid = payload.take_u32()?;
        let _tid = payload.take_u32()?;
        let time = payload.take_u64()?;

        // EXEC ELF objects aren't relocated; DYN ones are, so their
        // samples need the map base subtracted back out.
        let adjust = if self.is_shared_object(&filename) {
            start.wrapping_sub(pgoff)
        } else {
            0
        };
        let map_id = state.maps.len();
        state.maps.push(Map {
            start,
            end: start.wrapping_add(extent),
            adjust,
            filename,
        });
        // Two mappings landing on the same (time, start): the first one
        // keeps the slot.
        state
            .current_maps
            .entry(time)
            .or_default()
            .entry(start)
            .or_insert(map_id);
        Ok(())
    }

    /// Whether the ELF file behind a mapping is a shared object (`DYN`),
    /// judged by `e_type` in the first 18 bytes. Unreadable or short
    /// files classify as not-DYN.
    fn is_shared_object(&self, filename: &str) -> bool {
        let path = format!("{}{}", self.options.binary_cache_root, filename);
        let mut elf_start = [0u8; 18];
        match File::open(path).and_then(|mut file| file.read_exact(&mut elf_start)) {
            Ok(()) => u16::from_le_bytes([elf_start[16], elf_start[17]]) == ET_DYN,
            Err(_) => false,
        }
    }

    fn emit(&self, names: &EventNameTable, state: &Aggregates) -> Profile {
        let mut builder = ProfileBuilder::new(names);
        builder.set_top_level_counters(&state.totals);

        for (&map_id, map_events) in &state.samples {
            if map_events.is_empty() {
                continue;
            }
            if map_id >= state.maps.len() {
                // Aggregates out of sync with the map table; skip rather
                // than index out of bounds.
                warn!(map_id, "aggregate refers to a map that was never recorded");
                continue;
            }
            let map = &state.maps[map_id];
            let Some(map_totals) = state.map_totals.get(&map_id) else {
                continue;
            };

            // Noise-mapping filter: only bother with a map holding more
            // than 1% of some event.
            let all_under_threshold = map_totals.iter().all(|(name, &count)| {
                let total = state.totals.get(name).copied().unwrap_or(0);
                total == 0 || count as f64 / total as f64 <= 0.01
            });
            if all_under_threshold {
                debug!(filename = %map.filename, "skipping noise mapping");
                continue;
            }

            let mut symbols =
                SymbolTable::new(&self.options.nm, &self.options.binary_cache_root);
            if let Err(error) = symbols.reset(map) {
                warn!(filename = %map.filename, %error, "symbol listing failed");
                continue;
            }
            if symbols.is_empty() {
                debug!(filename = %map.filename, "no symbols");
                continue;
            }

            let adjust = map.adjust;
            let symbol_totals = accumulate_symbol_totals(map_events, symbols.symbols(), adjust);

            let mut disasm =
                Disassembler::new(&self.options.objdump, &self.options.binary_cache_root);
            for sym in symbols.symbols() {
                let Some(sym_counts) = symbol_totals.get(&sym.start) else {
                    continue;
                };
                // Per-symbol relevance filter: keep symbols that took up
                // more than 0.5% of some event.
                let keep = sym_counts.iter().any(|(name, &count)| {
                    let total = state.totals.get(name).copied().unwrap_or(0);
                    total != 0 && count as f64 / total as f64 > 0.005
                });
                if !keep {
                    continue;
                }

                // Position the event walk at the first sample at or past
                // the symbol start, in adjusted terms.
                let events = map_events.range(sym.start.wrapping_add(adjust)..);
                if let Err(error) =
                    emit_symbol(&mut builder, &mut disasm, map, sym, events, sym_counts, adjust)
                {
                    warn!(symbol = %sym.name, %error, "disassembly failed");
                }
            }
        }
        builder.finish()
    }
}

fn handle_sample(
    payload: ByteCursor,
    layout: SampleFormat,
    event_descs: &EventDescTable,
    state: &mut Aggregates,
) -> Result<(), Error> {
    let sample = parse_sample(payload, layout)?;
    let Some(map_id) = resolve_map(&state.current_maps, sample.time, sample.ip) else {
        // Nothing was mapped at this PC when the sample was taken.
        return Ok(());
    };
    let desc = event_descs
        .lookup(sample.id)
        .ok_or(InternalError::UnknownEventId(sample.id))?;

    *state
        .samples
        .entry(map_id)
        .or_default()
        .entry(sample.ip)
        .or_default()
        .entry(desc.name)
        .or_insert(0) += sample.period;
    *state.totals.entry(desc.name).or_insert(0) += sample.period;
    *state
        .map_totals
        .entry(map_id)
        .or_default()
        .entry(desc.name)
        .or_insert(0) += sample.period;
    Ok(())
}

/// Extract the canonical fields from a sample payload, in the field order
/// given by the layout mask.
fn parse_sample(mut payload: ByteCursor, layout: SampleFormat) -> Result<Sample, FormatError> {
    if !layout.contains(SampleFormat::IP | SampleFormat::PERIOD) {
        return Err(FormatError::MissingSampleFields);
    }
    let mut sample = Sample::default();
    if layout.contains(SampleFormat::IDENTIFIER) {
        sample.id = payload.take_u64()?;
    }
    if layout.contains(SampleFormat::IP) {
        sample.ip = payload.take_u64()?;
    }
    if layout.contains(SampleFormat::TID) {
        sample.pid = payload.take_u32()?;
        sample.tid = payload.take_u32()?;
    }
    if layout.contains(SampleFormat::TIME) {
        sample.time = payload.take_u64()?;
    }
    if layout.contains(SampleFormat::ADDR) {
        payload.skip(8)?;
    }
    if layout.contains(SampleFormat::ID) {
        sample.id = payload.take_u64()?;
    }
    if layout.contains(SampleFormat::STREAM_ID) {
        payload.skip(8)?;
    }
    if layout.contains(SampleFormat::CPU) {
        payload.skip(8)?;
    }
    if layout.contains(SampleFormat::PERIOD) {
        sample.period = payload.take_u64()?;
    }
    Ok(sample)
}

/// Resolve a sample's `(time, pc)` to the map it hit.
///
/// Timestamp buckets are visited newest-first, skipping buckets created
/// after the sample. Within a bucket the greatest mapping start at or
/// below the PC wins. The mapping end is deliberately not checked:
/// overlapping unmap/remap is resolved by most-recent-wins.
fn resolve_map(
    current_maps: &BTreeMap<u64, BTreeMap<u64, usize>>,
    time: u64,
    pc: u64,
) -> Option<usize> {
    for (_, bucket) in current_maps.range(..=time).rev() {
        if let Some((_, &map_id)) = bucket.range(..=pc).next_back() {
            return Some(map_id);
        }
    }
    None
}

/// Walk the sorted sample PCs and the sorted symbols together and total
/// each symbol's events, keyed by symbol start.
fn accumulate_symbol_totals(
    map_events: &BTreeMap<u64, CountsByName>,
    symbols: &[Symbol],
    adjust: u64,
) -> BTreeMap<u64, CountsByName> {
    let mut totals: BTreeMap<u64, CountsByName> = BTreeMap::new();
    let mut events = map_events.iter().peekable();
    let mut symbols = symbols.iter();
    let mut symbol = symbols.next();
    while let (Some(sym), Some(&(&raw_pc, counts))) = (symbol, events.peek()) {
        let pc = raw_pc.wrapping_sub(adjust);
        if pc < sym.start {
            events.next();
        } else if pc >= sym.end {
            symbol = symbols.next();
        } else {
            let sym_totals = totals.entry(sym.start).or_default();
            for (&name, &count) in counts {
                *sym_totals.entry(name).or_insert(0) += count;
            }
            events.next();
        }
    }
    totals
}

/// Disassemble one symbol and interleave its instructions with the
/// per-PC counters.
fn emit_symbol<'e>(
    builder: &mut ProfileBuilder<'_>,
    disasm: &mut Disassembler,
    map: &Map,
    sym: &Symbol,
    events: impl Iterator<Item = (&'e u64, &'e CountsByName)>,
    sym_counts: &CountsByName,
    adjust: u64,
) -> Result<(), ToolError> {
    disasm.reset(map, sym.start, sym.end)?;
    let mut events = events.peekable();
    builder.begin_function();
    loop {
        let (address, text) = disasm.next();
        if address >= sym.end {
            break;
        }
        match events.peek() {
            Some(&(&raw_pc, counts)) if raw_pc.wrapping_sub(adjust) == address => {
                builder.emit_line(address, Some(counts), text);
                events.next();
            }
            _ => builder.emit_line(address, None, text),
        }
    }
    builder.end_function(&sym.name, sym_counts);
    Ok(())
}

fn to_usize(value: u64) -> Result<usize, FormatError> {
    usize::try_from(value).map_err(|_| FormatError::SectionOutOfBounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_fields_follow_the_layout_order() {
        let layout = SampleFormat::IDENTIFIER
            | SampleFormat::IP
            | SampleFormat::TID
            | SampleFormat::TIME
            | SampleFormat::PERIOD;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u64.to_le_bytes()); // id
        bytes.extend_from_slice(&0x1000u64.to_le_bytes()); // ip
        bytes.extend_from_slice(&10u32.to_le_bytes()); // pid
        bytes.extend_from_slice(&11u32.to_le_bytes()); // tid
        bytes.extend_from_slice(&99u64.to_le_bytes()); // time
        bytes.extend_from_slice(&100u64.to_le_bytes()); // period

        let sample = parse_sample(ByteCursor::new(&bytes), layout).unwrap();
        assert_eq!(
            sample,
            Sample {
                id: 7,
                ip: 0x1000,
                pid: 10,
                tid: 11,
                time: 99,
                period: 100,
            }
        );
    }

    #[test]
    fn sample_layout_must_carry_ip_and_period() {
        let layout = SampleFormat::IP | SampleFormat::TIME;
        assert_eq!(
            parse_sample(ByteCursor::new(&[]), layout).unwrap_err(),
            FormatError::MissingSampleFields
        );
    }

    #[test]
    fn skipped_fields_are_stepped_over() {
        let layout = SampleFormat::IP
            | SampleFormat::ADDR
            | SampleFormat::ID
            | SampleFormat::STREAM_ID
            | SampleFormat::CPU
            | SampleFormat::PERIOD;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x2000u64.to_le_bytes()); // ip
        bytes.extend_from_slice(&0xaaaau64.to_le_bytes()); // addr
        bytes.extend_from_slice(&3u64.to_le_bytes()); // id
        bytes.extend_from_slice(&0xbbbbu64.to_le_bytes()); // stream id
        bytes.extend_from_slice(&2u64.to_le_bytes()); // cpu + reserved
        bytes.extend_from_slice(&5u64.to_le_bytes()); // period

        let sample = parse_sample(ByteCursor::new(&bytes), layout).unwrap();
        assert_eq!(sample.ip, 0x2000);
        assert_eq!(sample.id, 3);
        assert_eq!(sample.period, 5);
        assert_eq!(sample.time, 0);
    }

    #[test]
    fn map_resolution_prefers_the_newest_bucket_at_or_before_the_sample() {
        let mut current_maps: BTreeMap<u64, BTreeMap<u64, usize>> = BTreeMap::new();
        current_maps.entry(100).or_default().insert(0x1000, 0);
        current_maps.entry(200).or_default().insert(0x1000, 1);

        // Between the two map-in times the older mapping wins; after the
        // second, the newer one shadows it.
        assert_eq!(resolve_map(&current_maps, 150, 0x1800), Some(0));
        assert_eq!(resolve_map(&current_maps, 200, 0x1800), Some(1));
        assert_eq!(resolve_map(&current_maps, 250, 0x1800), Some(1));
        // Before any mapping exists, or below every start, no match.
        assert_eq!(resolve_map(&current_maps, 50, 0x1800), None);
        assert_eq!(resolve_map(&current_maps, 150, 0xfff), None);
    }

    #[test]
    fn older_bucket_is_consulted_when_the_newer_has_no_candidate() {
        let mut current_maps: BTreeMap<u64, BTreeMap<u64, usize>> = BTreeMap::new();
        current_maps.entry(100).or_default().insert(0x1000, 0);
        current_maps.entry(200).or_default().insert(0x8000, 1);

        assert_eq!(resolve_map(&current_maps, 300, 0x2000), Some(0));
        assert_eq!(resolve_map(&current_maps, 300, 0x9000), Some(1));
    }

    #[test]
    fn symbol_totals_join_events_into_containing_symbols() {
        let symbols = vec![
            Symbol {
                start: 0x1000,
                end: 0x1010,
                name: "alpha".to_string(),
            },
            Symbol {
                start: 0x1010,
                end: 0x1020,
                name: "beta".to_string(),
            },
        ];
        let mut names = EventNameTable::default();
        let cycles = names.intern("cycles");

        let mut map_events: BTreeMap<u64, CountsByName> = BTreeMap::new();
        for (pc, count) in [(0x0f00u64, 1u64), (0x1004, 10), (0x1008, 20), (0x101c, 40), (0x2000, 80)] {
            map_events.entry(pc).or_default().insert(cycles, count);
        }

        let totals = accumulate_symbol_totals(&map_events, &symbols, 0);
        assert_eq!(totals[&0x1000].get(&cycles), Some(&30));
        assert_eq!(totals[&0x1010].get(&cycles), Some(&40));
        // PCs outside every symbol contribute nowhere.
        assert_eq!(totals.len(), 2);
    }
}
