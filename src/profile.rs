use std::collections::HashMap;

use linear_map::LinearMap;

use crate::event_desc::{EventName, EventNameTable};

/// Per-event-name counter totals, keyed by the event's display name.
pub type Counters = HashMap<String, u64>;

/// One annotated instruction: the counters attributed to it (empty when no
/// sample hit it), its file-relative PC, and the instruction text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub counters: Counters,
    pub pc: u64,
    pub text: String,
}

/// One emitted function: its counter totals and its instructions in
/// ascending PC order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Function {
    pub counters: Counters,
    pub data: Vec<Line>,
}

/// The result of an import: global counter totals and the annotated
/// functions, keyed by function name. Counter values are absolute.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Profile {
    pub counters: Counters,
    pub functions: HashMap<String, Function>,
}

/// Accumulates the output tree during the emission phase.
///
/// Interned counter keys are resolved to owned strings here, at the
/// boundary where the result outlives the reader's aggregates.
pub struct ProfileBuilder<'a> {
    names: &'a EventNameTable,
    profile: Profile,
    lines: Vec<Line>,
}

impl<'a> ProfileBuilder<'a> {
    pub fn new(names: &'a EventNameTable) -> Self {
        Self {
            names,
            profile: Profile::default(),
            lines: Vec::new(),
        }
    }

    pub fn set_top_level_counters(&mut self, counters: &LinearMap<EventName, u64>) {
        self.profile.counters = self.resolve(counters);
    }

    pub fn begin_function(&mut self) {
        self.lines.clear();
    }

    pub fn emit_line(&mut self, pc: u64, counters: Option<&LinearMap<EventName, u64>>, text: String) {
        let counters = counters.map(|c| self.resolve(c)).unwrap_or_default();
        self.lines.push(Line { counters, pc, text });
    }

    /// Close the current function. A later function with the same name
    /// replaces an earlier one.
    pub fn end_function(&mut self, name: &str, counters: &LinearMap<EventName, u64>) {
        let function = Function {
            counters: self.resolve(counters),
            data: std::mem::take(&mut self.lines),
        };
        self.profile.functions.insert(name.to_string(), function);
    }

    pub fn finish(self) -> Profile {
        self.profile
    }

    fn resolve(&self, counters: &LinearMap<EventName, u64>) -> Counters {
        counters
            .iter()
            .map(|(&name, &count)| (self.names.resolve(name).to_string(), count))
            .collect()
    }
}
