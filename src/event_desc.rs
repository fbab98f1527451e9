use std::collections::HashMap;

use bitflags::bitflags;

use crate::constants::*;
use crate::cursor::ByteCursor;
use crate::error::FormatError;
use crate::header::{FileSpan, PerfHeader};

bitflags! {
    /// The layout mask of an event descriptor (`perf_event_attr.sample_type`).
    ///
    /// The set bits determine which fields are present in every sample
    /// record of that event, in the declaration order below.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SampleFormat: u64 {
        const IP = 1 << 0;
        const TID = 1 << 1;
        const TIME = 1 << 2;
        const ADDR = 1 << 3;
        const ID = 1 << 6;
        const CPU = 1 << 7;
        const PERIOD = 1 << 8;
        const STREAM_ID = 1 << 9;
        const IDENTIFIER = 1 << 16;
    }
}

/// An interned event name. Cheap to copy, hash and compare; resolves back
/// to its string through the [`EventNameTable`] it was interned in.
///
/// Counters are keyed by this handle rather than by string value, so two
/// descriptors with equal names share one counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventName(u32);

/// The string pool for event names. Lives as long as the aggregates whose
/// counter keys point into it.
#[derive(Default)]
pub struct EventNameTable {
    names: Vec<Box<str>>,
}

impl EventNameTable {
    pub fn intern(&mut self, name: &str) -> EventName {
        if let Some(index) = self.names.iter().position(|n| &**n == name) {
            return EventName(index as u32);
        }
        self.names.push(name.into());
        EventName((self.names.len() - 1) as u32)
    }

    pub fn resolve(&self, name: EventName) -> &str {
        &self.names[name.0 as usize]
    }
}

/// One entry of the event-descriptor table: the interned event name and
/// the sample layout mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDesc {
    pub name: EventName,
    pub layout: SampleFormat,
}

/// The table mapping sample event ids to event descriptors, built from
/// either the `HEADER_EVENT_DESC` section or the attrs table.
#[derive(Default)]
pub struct EventDescTable {
    by_id: HashMap<u64, EventDesc>,
    /// Set when exactly one descriptor was declared, without any ids.
    /// Perf refers to such a descriptor by arbitrary ids.
    sole: Option<EventDesc>,
    /// The layout of the first descriptor read. All descriptors are
    /// assumed to share it.
    layout: Option<SampleFormat>,
}

impl EventDescTable {
    /// Parse the attrs table pointed to by the file header.
    ///
    /// Each entry is a `perf_event_attr` followed by a `perf_file_section`
    /// listing the event ids; the section sits at the attribute's own
    /// declared `size`, while entries are strided by the header's
    /// `attr_size`. Names are derived from the attribute's type and
    /// config.
    pub fn parse_attr_section(
        file: ByteCursor,
        header: &PerfHeader,
        names: &mut EventNameTable,
    ) -> Result<Self, FormatError> {
        if header.attr_size == 0 {
            return Err(FormatError::EventAttr);
        }
        let num_events = header.attr_section.size / header.attr_size;

        let mut table = EventDescTable::default();
        for index in 0..num_events {
            let attr_offset = header.attr_section.offset + index * header.attr_size;
            let mut attr = file.cursor_at(to_usize(attr_offset)?)?;
            let type_ = attr.take_u32()?;
            let attr_self_size = attr.take_u32()?;
            let config = attr.take_u64()?;
            let _sample_period = attr.take_u64()?;
            let layout = SampleFormat::from_bits_truncate(attr.take_u64()?);

            let mut ids_section_cursor =
                file.cursor_at(to_usize(attr_offset + u64::from(attr_self_size))?)?;
            let ids_section = FileSpan::read(&mut ids_section_cursor)?;
            let num_ids = ids_section.size / 8;
            let mut ids = file.cursor_at(to_usize(ids_section.offset)?)?;

            let name = names.intern(event_name_for(type_, config));
            let desc = EventDesc { name, layout };
            table.layout.get_or_insert(layout);
            if num_events == 1 && num_ids == 0 {
                table.sole = Some(desc);
            }
            for _ in 0..num_ids {
                table.by_id.insert(ids.take_u64()?, desc);
            }
        }
        Ok(table)
    }

    /// Parse a `HEADER_EVENT_DESC` feature section.
    ///
    /// ```c
    /// struct {
    ///   uint32_t nr; /* number of events */
    ///   uint32_t attr_size; /* size of each perf_event_attr */
    ///   struct {
    ///     struct perf_event_attr attr;  /* size of attr_size */
    ///     uint32_t nr_ids;
    ///     struct perf_header_string event_string;
    ///     uint64_t ids[nr_ids];
    ///   } events[nr]; /* Variable length records */
    /// };
    /// ```
    pub fn parse_event_desc_section(
        mut section: ByteCursor,
        names: &mut EventNameTable,
    ) -> Result<Self, FormatError> {
        let nr = section.take_u32()?;
        let attr_size = section.take_u32()?;

        let mut table = EventDescTable::default();
        for _ in 0..nr {
            // Peek the sample_type out of the attr, then step over it.
            let mut attr = section;
            let _type = attr.take_u32()?;
            let _size = attr.take_u32()?;
            let _config = attr.take_u64()?;
            let _sample_period = attr.take_u64()?;
            let layout = SampleFormat::from_bits_truncate(attr.take_u64()?);
            section.skip(attr_size as usize)?;

            let nr_ids = section.take_u32()?;
            let str_len = section.take_u32()?;
            let str_bytes = section.take_bytes(str_len as usize)?;
            let nul = memchr::memchr(0, str_bytes).unwrap_or(str_bytes.len());
            let name_str =
                std::str::from_utf8(&str_bytes[..nul]).unwrap_or(UNKNOWN_EVENT_NAME);

            let name = names.intern(name_str);
            let desc = EventDesc { name, layout };
            table.layout.get_or_insert(layout);
            if nr == 1 && nr_ids == 0 {
                table.sole = Some(desc);
            }
            for _ in 0..nr_ids {
                table.by_id.insert(section.take_u64()?, desc);
            }
        }
        Ok(table)
    }

    /// Look up the descriptor for a sample's event id.
    ///
    /// A sole descriptor declared without any ids matches every id.
    pub fn lookup(&self, id: u64) -> Option<EventDesc> {
        self.by_id.get(&id).copied().or(self.sole)
    }

    /// The layout mask shared by all samples in the stream.
    pub fn layout(&self) -> Option<SampleFormat> {
        self.layout
    }
}

fn event_name_for(type_: u32, config: u64) -> &'static str {
    match type_ {
        PERF_TYPE_HARDWARE => HW_EVENT_NAMES
            .get(config as usize)
            .copied()
            .unwrap_or(UNKNOWN_EVENT_NAME),
        PERF_TYPE_SOFTWARE => SW_EVENT_NAMES
            .get(config as usize)
            .copied()
            .unwrap_or(UNKNOWN_EVENT_NAME),
        _ => UNKNOWN_EVENT_NAME,
    }
}

fn to_usize(value: u64) -> Result<usize, FormatError> {
    usize::try_from(value).map_err(|_| FormatError::SectionOutOfBounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut names = EventNameTable::default();
        let cycles = names.intern("cycles");
        let faults = names.intern("page-faults");
        assert_eq!(names.intern("cycles"), cycles);
        assert_ne!(cycles, faults);
        assert_eq!(names.resolve(cycles), "cycles");
        assert_eq!(names.resolve(faults), "page-faults");
    }

    #[test]
    fn hardware_and_software_names() {
        assert_eq!(event_name_for(PERF_TYPE_HARDWARE, 0), "cycles");
        assert_eq!(event_name_for(PERF_TYPE_HARDWARE, 1), "instructions");
        assert_eq!(event_name_for(PERF_TYPE_SOFTWARE, 2), "page-faults");
        assert_eq!(event_name_for(PERF_TYPE_HARDWARE, 10), "unknown");
        assert_eq!(event_name_for(4, 0), "unknown");
    }

    #[test]
    fn sole_descriptor_matches_any_id() {
        let mut names = EventNameTable::default();
        let name = names.intern("cycles");
        let desc = EventDesc {
            name,
            layout: SampleFormat::IP | SampleFormat::PERIOD,
        };
        let table = EventDescTable {
            by_id: HashMap::new(),
            sole: Some(desc),
            layout: Some(desc.layout),
        };
        assert_eq!(table.lookup(0xdead), Some(desc));
        assert_eq!(table.lookup(0), Some(desc));
    }

    #[test]
    fn parses_event_desc_section() {
        // type + size + config + sample_period + sample_type
        const ATTR_SIZE: u32 = 32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes()); // nr
        bytes.extend_from_slice(&ATTR_SIZE.to_le_bytes());
        for (config, id) in [(0u64, 11u64), (2, 12)] {
            bytes.extend_from_slice(&0u32.to_le_bytes()); // type
            bytes.extend_from_slice(&ATTR_SIZE.to_le_bytes()); // size
            bytes.extend_from_slice(&config.to_le_bytes());
            bytes.extend_from_slice(&4000u64.to_le_bytes()); // sample_period
            let layout = SampleFormat::IP | SampleFormat::ID | SampleFormat::PERIOD;
            bytes.extend_from_slice(&layout.bits().to_le_bytes());
            bytes.extend_from_slice(&1u32.to_le_bytes()); // nr_ids
            let name: &[u8] = if config == 0 { b"cycles\0\0" } else { b"cache-references" };
            bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
            bytes.extend_from_slice(name);
            bytes.extend_from_slice(&id.to_le_bytes());
        }

        let mut names = EventNameTable::default();
        let table =
            EventDescTable::parse_event_desc_section(ByteCursor::new(&bytes), &mut names)
                .unwrap();
        let cycles = table.lookup(11).unwrap();
        let cache = table.lookup(12).unwrap();
        assert_eq!(names.resolve(cycles.name), "cycles");
        assert_eq!(names.resolve(cache.name), "cache-references");
        assert_eq!(table.lookup(13), None);
        assert_eq!(
            table.layout(),
            Some(SampleFormat::IP | SampleFormat::ID | SampleFormat::PERIOD)
        );
    }
}
