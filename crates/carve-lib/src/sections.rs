//! Address sections and the per-section pattern interval index.
//!
//! After a run the exported patterns of each section are indexed into a
//! flattened interval table: entries sorted by start address, augmented
//! with a running maximum end so overlap queries can stop early.

use carve_core::SectionId;
use carve_vm::Pattern;

/// A logical address namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    start: u128,
    end: u128,
    pattern: usize,
    /// Maximum `end` over this entry and all entries before it.
    max_end: u128,
}

/// Flattened interval table answering "which patterns overlap address X".
#[derive(Debug, Default)]
pub struct IntervalIndex {
    entries: Vec<Entry>,
}

impl IntervalIndex {
    /// Index the top-level patterns of one section.
    pub fn build(patterns: &[Pattern]) -> Self {
        let mut entries: Vec<Entry> = patterns
            .iter()
            .enumerate()
            .map(|(pattern, p)| Entry {
                start: p.address,
                end: p.address + p.size as u128,
                pattern,
                max_end: 0,
            })
            .collect();
        entries.sort_by_key(|e| e.start);

        let mut running = 0u128;
        for entry in &mut entries {
            running = running.max(entry.end);
            entry.max_end = running;
        }

        Self { entries }
    }

    /// Indices of patterns whose span contains `address`.
    pub fn query(&self, address: u128) -> Vec<usize> {
        let mut hits = Vec::new();
        // entries starting after the address can never contain it
        let upper = self.entries.partition_point(|e| e.start <= address);
        for entry in self.entries[..upper].iter().rev() {
            if entry.max_end <= address {
                break;
            }
            if entry.end > address {
                hits.push(entry.pattern);
            }
        }
        hits.reverse();
        hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
