//! By-caller aggregation and its report.

use std::collections::BTreeMap;
use std::io;

use crate::env::TargetEnv;
use crate::processor::{AllocationRecord, Processor};
use crate::target::{self, Module, Target};
use crate::ust;

#[derive(Debug, Clone, Copy, Default)]
struct UstRecord {
    ust_address: u64,
    count: u64,
    total_size: u64,
    max_size: u64,
    largest_entry: u64,
}

/// Aggregates blocks by the stack-trace record that produced them.
pub struct SummaryProcessor {
    /// Sum of segment extents seen during the walk.
    total_reserved: u64,
    records: BTreeMap<u64, UstRecord>,
    /// `-k`: keep only callers with a frame whose `module!symbol` starts
    /// with this.
    key: Option<String>,
}

impl SummaryProcessor {
    pub fn new() -> SummaryProcessor {
        SummaryProcessor {
            total_reserved: 0,
            records: BTreeMap::new(),
            key: None,
        }
    }

    pub fn with_key(key: &str) -> SummaryProcessor {
        let mut processor = SummaryProcessor::new();
        processor.key = Some(key.to_string());
        processor
    }

    /// Render per-module totals, then per-caller rows ranked by total
    /// size with the stack expanded beneath each.
    pub fn print<T: Target + ?Sized>(
        &self,
        target: &T,
        env: &TargetEnv,
        console: &mut dyn io::Write,
    ) {
        let mut rows: Vec<UstRecord> = self.records.values().copied().collect();
        if let Some(key) = &self.key {
            rows.retain(|row| has_matched_frame(target, env, row.ust_address, key));
        }
        rows.sort_by(|a, b| {
            b.total_size
                .cmp(&a.total_size)
                .then(a.ust_address.cmp(&b.ust_address))
        });

        let modules = target.modules().unwrap_or_default();
        self.print_module_totals(target, env, &rows, &modules, console);
        dprintln!(console, "reserved: {:x}", self.total_reserved);

        let ruler = if env.is_64() { 88 } else { 48 };
        dprintln!(console, "{}", "-".repeat(ruler));
        if env.is_64() {
            dprintln!(
                console,
                "             ust,            count,            total,              max,            entry"
            );
        } else {
            dprintln!(console, "     ust,    count,    total,      max,    entry");
        }
        dprintln!(console, "{}", "-".repeat(ruler));
        for row in &rows {
            if env.is_64() {
                dprintln!(
                    console,
                    "{:>16x}, {:>16x}, {:>16x}, {:>16x}, {:>16x}",
                    row.ust_address,
                    row.count,
                    row.total_size,
                    row.max_size,
                    row.largest_entry
                );
            } else {
                dprintln!(
                    console,
                    "{:>8x}, {:>8x}, {:>8x}, {:>8x}, {:>8x}",
                    row.ust_address,
                    row.count,
                    row.total_size,
                    row.max_size,
                    row.largest_entry
                );
            }
            if row.ust_address != 0 {
                if let Err(err) = ust::print_stack_trace(target, env, row.ust_address, "\t", console)
                {
                    dprintln!(console, "\t{}", err);
                }
            }
        }
        dprintln!(console);
    }

    fn print_module_totals<T: Target + ?Sized>(
        &self,
        target: &T,
        env: &TargetEnv,
        rows: &[UstRecord],
        modules: &[Module],
        console: &mut dyn io::Write,
    ) {
        // keyed by module base; None collects the unclassifiable rest
        let mut totals: BTreeMap<Option<u64>, (String, u64)> = BTreeMap::new();
        for row in rows {
            let module = caller_module(target, env, row.ust_address, modules);
            let (key, name) = match module {
                Some(module) => (Some(module.base), module.stem()),
                None => (None, String::from("unknown")),
            };
            let slot = totals.entry(key).or_insert_with(|| (name, 0));
            slot.1 += row.total_size;
        }
        let mut ranked: Vec<(String, u64)> = totals.into_values().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let ruler = if env.is_64() { 88 } else { 48 };
        dprintln!(console, "{}", "-".repeat(ruler));
        if env.is_64() {
            dprintln!(console, "                          module,            total");
        } else {
            dprintln!(console, "          module,    total");
        }
        dprintln!(console, "{}", "-".repeat(ruler));
        for (name, total) in &ranked {
            if env.is_64() {
                dprintln!(console, "{:>32}, {:>16x}", name, total);
            } else {
                dprintln!(console, "{:>16}, {:>8x}", name, total);
            }
        }
        dprintln!(console);
    }
}

impl Default for SummaryProcessor {
    fn default() -> SummaryProcessor {
        SummaryProcessor::new()
    }
}

impl Processor for SummaryProcessor {
    fn start_segment(&mut self, start: u64, end: u64) {
        self.total_reserved += end.saturating_sub(start);
    }

    fn record(&mut self, record: &AllocationRecord) {
        let slot = self
            .records
            .entry(record.ust_address)
            .or_insert_with(|| UstRecord {
                ust_address: record.ust_address,
                ..UstRecord::default()
            });
        slot.count += 1;
        slot.total_size += record.block_size;
        if record.block_size > slot.max_size {
            slot.max_size = record.block_size;
            slot.largest_entry = record.block_address;
        }
    }
}

/// The module owning the first meaningful frame: allocator and runtime
/// frames (`ntdll*`, `msvcr*`, `verifier`) are skipped; a frame outside
/// every loaded module classifies the caller as unknown.
fn caller_module<'m, T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    ust_address: u64,
    modules: &'m [Module],
) -> Option<&'m Module> {
    if ust_address == 0 {
        return None;
    }
    let trace = ust::read_stack_trace(target, env, ust_address).ok()?;
    for frame in trace {
        match target::module_at(modules, frame) {
            Some(module) => {
                let stem = module.stem();
                if stem.starts_with("ntdll") || stem.starts_with("msvcr") || stem == "verifier" {
                    continue;
                }
                return Some(module);
            }
            None => return None,
        }
    }
    None
}

fn has_matched_frame<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    ust_address: u64,
    key: &str,
) -> bool {
    if ust_address == 0 {
        return false;
    }
    let Ok(trace) = ust::read_stack_trace(target, env, ust_address) else {
        return false;
    };
    trace.iter().any(|&frame| {
        target
            .symbolize(frame)
            .is_some_and(|symbol| symbol.qualified().starts_with(key))
    })
}
