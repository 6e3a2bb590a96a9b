//! Pure merge logic for the local scan list.
//!
//! Every channel (optimistic insert, change feed, poll, full refetch, local
//! delete) is expressed as a [`SyncEvent`] and folded into [`ScanListState`]
//! by [`reduce`]. Merges are keyed by id and idempotent, so the channels can
//! race without coordinating with each other.

use std::collections::{HashMap, HashSet};

use crate::models::Scan;
use crate::services::scan_store::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Optimistic,
    Push,
    Poll,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Upsert {
        source: Source,
        scan: Scan,
    },
    Removed {
        source: Source,
        id: String,
    },
    /// Full list for the owner. `as_of` is the state revision read just
    /// before the fetch was issued.
    Refreshed {
        scans: Vec<Scan>,
        as_of: u64,
    },
    Select(Option<String>),
}

impl From<ChangeEvent> for SyncEvent {
    fn from(event: ChangeEvent) -> Self {
        match event {
            ChangeEvent::Inserted(scan) | ChangeEvent::Updated(scan) => SyncEvent::Upsert {
                source: Source::Push,
                scan,
            },
            ChangeEvent::Deleted { id } => SyncEvent::Removed {
                source: Source::Push,
                id,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisPhase {
    Unanalyzed,
    Analyzed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedScan {
    pub id: String,
    pub phase: AnalysisPhase,
}

/// Result of folding one event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub changed: bool,
    /// Set when the selected scan just moved to `Analyzed`
    pub analyzed: Option<String>,
    /// Set when the selection was dropped because its scan went away
    pub selection_cleared: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanListState {
    scans: Vec<Scan>,
    revision: u64,
    /// Revision at which an entry was added by an upsert, until a refetch
    /// that could have seen it reports it
    added_at: HashMap<String, u64>,
    /// Ids removed in this session; late upserts for them are dropped
    removed: HashSet<String>,
    selected: Option<SelectedScan>,
}

impl ScanListState {
    /// Newest first
    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    pub fn get(&self, id: &str) -> Option<&Scan> {
        self.scans.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    /// Number of events folded so far
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn selected(&self) -> Option<&SelectedScan> {
        self.selected.as_ref()
    }

    pub fn selected_scan(&self) -> Option<&Scan> {
        self.selected.as_ref().and_then(|sel| self.get(&sel.id))
    }

    /// Id that still needs polling: selected and not analyzed yet
    pub fn awaiting_analysis(&self) -> Option<&str> {
        self.selected
            .as_ref()
            .filter(|sel| sel.phase == AnalysisPhase::Unanalyzed)
            .map(|sel| sel.id.as_str())
    }

    /// Added locally and not yet reported by a refetch
    pub fn is_unconfirmed(&self, id: &str) -> bool {
        self.added_at.contains_key(id)
    }
}

/// Fold one event into the state
pub fn reduce(mut state: ScanListState, event: SyncEvent) -> (ScanListState, Transition) {
    state.revision += 1;
    let mut transition = Transition::default();

    match event {
        SyncEvent::Upsert { scan, .. } => {
            if state.removed.contains(&scan.id) {
                return (state, transition);
            }
            let id = scan.id.clone();
            match upsert(&mut state.scans, scan) {
                Upserted::Inserted => {
                    state.added_at.insert(id, state.revision);
                    transition.changed = true;
                }
                Upserted::Updated => transition.changed = true,
                Upserted::Unchanged => {}
            }
        }
        SyncEvent::Removed { id, .. } => {
            let before = state.scans.len();
            state.scans.retain(|s| s.id != id);
            transition.changed = state.scans.len() != before;
            state.added_at.remove(&id);
            state.removed.insert(id.clone());

            if state.selected.as_ref().is_some_and(|sel| sel.id == id) {
                state.selected = None;
                transition.changed = true;
                transition.selection_cleared = Some(id);
            }
        }
        SyncEvent::Refreshed { scans, as_of } => {
            let (merged, added_at) = merge_refetch(&state, scans, as_of);
            transition.changed = merged != state.scans;
            state.scans = merged;
            state.added_at = added_at;

            let vanished = state
                .selected
                .as_ref()
                .filter(|sel| state.get(&sel.id).is_none())
                .map(|sel| sel.id.clone());
            if let Some(id) = vanished {
                state.selected = None;
                transition.changed = true;
                transition.selection_cleared = Some(id);
            }
        }
        SyncEvent::Select(id) => {
            let next = id.and_then(|id| {
                state.get(&id).map(|scan| SelectedScan {
                    phase: phase_of(scan),
                    id,
                })
            });
            transition.changed = next != state.selected;
            state.selected = next;
            // Selecting does not count as an arrival, even if already analyzed
            return (state, transition);
        }
    }

    if let Some(sel) = state.selected.as_mut() {
        if sel.phase == AnalysisPhase::Unanalyzed {
            let arrived = state
                .scans
                .iter()
                .find(|s| s.id == sel.id)
                .is_some_and(Scan::has_analysis);
            if arrived {
                sel.phase = AnalysisPhase::Analyzed;
                transition.analyzed = Some(sel.id.clone());
                transition.changed = true;
            }
        }
    }

    (state, transition)
}

fn phase_of(scan: &Scan) -> AnalysisPhase {
    if scan.has_analysis() {
        AnalysisPhase::Analyzed
    } else {
        AnalysisPhase::Unanalyzed
    }
}

enum Upserted {
    Inserted,
    Updated,
    Unchanged,
}

/// Keyed upsert, last writer wins except that a missing analysis never
/// replaces a present one
fn upsert(scans: &mut Vec<Scan>, mut incoming: Scan) -> Upserted {
    if let Some(pos) = scans.iter().position(|s| s.id == incoming.id) {
        let existing = &scans[pos];
        if !incoming.has_analysis() && existing.has_analysis() {
            incoming.analysis = existing.analysis.clone();
        }
        if *existing == incoming {
            return Upserted::Unchanged;
        }
        let reorder = existing.created_at != incoming.created_at;
        scans[pos] = incoming;
        if reorder {
            sort_newest_first(scans);
        }
        return Upserted::Updated;
    }

    let pos = scans
        .iter()
        .position(|s| s.created_at < incoming.created_at)
        .unwrap_or(scans.len());
    scans.insert(pos, incoming);
    Upserted::Inserted
}

fn merge_refetch(
    state: &ScanListState,
    fetched: Vec<Scan>,
    as_of: u64,
) -> (Vec<Scan>, HashMap<String, u64>) {
    let mut scans: Vec<Scan> = Vec::with_capacity(fetched.len());

    for mut scan in fetched {
        if state.removed.contains(&scan.id) || scans.iter().any(|s| s.id == scan.id) {
            continue;
        }
        if !scan.has_analysis() {
            if let Some(local) = state.get(&scan.id).filter(|l| l.has_analysis()) {
                scan.analysis = local.analysis.clone();
            }
        }
        scans.push(scan);
    }

    // Entries added after the fetch was issued cannot be in it yet
    let mut added_at = HashMap::new();
    for (id, rev) in &state.added_at {
        if *rev <= as_of || scans.iter().any(|s| &s.id == id) {
            continue;
        }
        if let Some(local) = state.get(id) {
            scans.push(local.clone());
            added_at.insert(id.clone(), *rev);
        }
    }

    sort_newest_first(&mut scans);
    (scans, added_at)
}

fn sort_newest_first(scans: &mut [Scan]) {
    scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
