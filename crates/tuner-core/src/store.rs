//! Station Registry Store: the authoritative ordered station list plus the
//! current selection.
//!
//! The list is only ever mutated through `apply_upsert`, `apply_delete` and
//! `replace_all`, so the two invariants hold after every call:
//!
//! - no two entries share a `station_id`, and new entries land at the tail;
//! - `selection` is `Some(i)` with `i < len` whenever the list is non-empty,
//!   and `None` exactly when it is empty.

use tracing::debug;
use tuner_proto::protocol::Station;

#[derive(Debug, Default, Clone)]
pub struct StationStore {
    stations: Vec<Station>,
    selection: Option<usize>,
}

impl StationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list (initial bulk seed).  A duplicate id keeps the
    /// position of its first occurrence; the later entry replaces its value.
    pub fn replace_all(&mut self, stations: Vec<Station>) {
        self.stations.clear();
        for station in stations {
            self.upsert_entry(station);
        }
        self.settle_selection();
        debug!(
            "store: seeded {} stations, selection={:?}",
            self.stations.len(),
            self.selection
        );
    }

    /// Replace in place when the id is known, otherwise append.
    pub fn apply_upsert(&mut self, station: Station) {
        self.upsert_entry(station);
        self.settle_selection();
    }

    /// Remove the entry with `station_id`; no-op when absent.
    pub fn apply_delete(&mut self, station_id: &str) -> bool {
        let Some(pos) = self.position(station_id) else {
            return false;
        };
        self.stations.remove(pos);
        self.settle_selection();
        true
    }

    /// Unconditional selection; callers pick from the rendered list.
    /// Out-of-range indices are refused so the invariant survives misuse.
    pub fn select(&mut self, index: usize) -> bool {
        if index < self.stations.len() {
            self.selection = Some(index);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> &[Station] {
        &self.stations
    }

    pub fn selection(&self) -> Option<usize> {
        self.selection
    }

    pub fn current(&self) -> Option<&Station> {
        self.selection.and_then(|idx| self.stations.get(idx))
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    fn position(&self, station_id: &str) -> Option<usize> {
        self.stations
            .iter()
            .position(|s| s.station_id == station_id)
    }

    fn upsert_entry(&mut self, station: Station) {
        match self.position(&station.station_id) {
            Some(pos) => self.stations[pos] = station,
            None => self.stations.push(station),
        }
    }

    /// Create the selection on first non-empty list, clamp it to the tail when
    /// the list shrinks, drop it when the list empties.
    fn settle_selection(&mut self) {
        let len = self.stations.len();
        self.selection = match (len, self.selection) {
            (0, _) => None,
            (_, None) => Some(0),
            (len, Some(idx)) if idx >= len => Some(len - 1),
            (_, keep) => keep,
        };
    }
}
