//! By-size aggregation and its report.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use crate::env::TargetEnv;
use crate::processor::{AllocationRecord, Processor};

#[derive(Debug, Clone, Default)]
struct SizeRecord {
    count: u64,
    ust_addresses: BTreeSet<u64>,
}

/// Aggregates blocks by the size the caller requested.
pub struct BySizeProcessor {
    /// When set, only this exact user size is recorded and the report is
    /// the bare list of its callers.
    filter: Option<u64>,
    records: BTreeMap<u64, SizeRecord>,
}

impl BySizeProcessor {
    pub fn new(filter: Option<u64>) -> BySizeProcessor {
        BySizeProcessor {
            filter,
            records: BTreeMap::new(),
        }
    }

    pub fn print(&self, env: &TargetEnv, console: &mut dyn io::Write) {
        if let Some(size) = self.filter {
            if let Some(record) = self.records.get(&size) {
                for ust_address in &record.ust_addresses {
                    dprintln!(console, "{:x}", ust_address);
                }
            }
            return;
        }

        let mut rows: Vec<(u64, &SizeRecord)> =
            self.records.iter().map(|(size, record)| (*size, record)).collect();
        rows.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(&b.0)));

        if env.is_64() {
            dprintln!(
                console,
                "        userSize(           count)             ust0,             ust1,..."
            );
        } else {
            dprintln!(console, "userSize(   count)     ust0,     ust1,...");
        }
        for (size, record) in rows {
            if env.is_64() {
                dprint!(console, "{:>16x}({:>16x})", size, record.count);
                for ust_address in &record.ust_addresses {
                    dprint!(console, "{:>16x},", ust_address);
                }
            } else {
                dprint!(console, "{:>8x}({:>8x})", size, record.count);
                for ust_address in &record.ust_addresses {
                    dprint!(console, "{:>8x},", ust_address);
                }
            }
            dprintln!(console);
        }
        dprintln!(console);
    }
}

impl Processor for BySizeProcessor {
    fn record(&mut self, record: &AllocationRecord) {
        if let Some(size) = self.filter {
            if record.user_size != size {
                return;
            }
        }
        let slot = self.records.entry(record.user_size).or_default();
        slot.count += 1;
        slot.ust_addresses.insert(record.ust_address);
    }
}
