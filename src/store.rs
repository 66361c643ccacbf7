use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::match_record::{MatchRecord, Tier};

/// Completed maps, kept in non-decreasing date order.
///
/// All reads that feed features go through [`HistoricalMatchStore::as_of`],
/// which only ever hands out records dated strictly before the reference day.
#[derive(Debug, Clone, Default)]
pub struct HistoricalMatchStore {
    records: Vec<MatchRecord>,
}

impl HistoricalMatchStore {
    pub fn new(mut records: Vec<MatchRecord>) -> Self {
        // Stable sort: same-day records keep their load order.
        records.sort_by_key(|r| r.date);
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MatchRecord] {
        &self.records
    }

    pub fn earliest_date(&self) -> Option<NaiveDate> {
        self.records.first().map(|r| r.date)
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.records.last().map(|r| r.date)
    }

    pub fn teams(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .flat_map(|r| [r.team_a.as_str(), r.team_b.as_str()])
            .collect()
    }

    pub fn maps(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.map.as_str()).collect()
    }

    /// Records with `date < reference_date`, oldest first.
    pub fn as_of(&self, reference_date: NaiveDate) -> Snapshot<'_> {
        let end = self.records.partition_point(|r| r.date < reference_date);
        Snapshot {
            as_of: Some(reference_date),
            records: self.records[..end].iter().collect(),
        }
    }

    /// Unbounded view, for reporting only.
    pub fn all(&self) -> Snapshot<'_> {
        Snapshot {
            as_of: None,
            records: self.records.iter().collect(),
        }
    }
}

/// A date-ordered, read-only selection of store records.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    as_of: Option<NaiveDate>,
    records: Vec<&'a MatchRecord>,
}

impl<'a> Snapshot<'a> {
    pub fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a MatchRecord> + '_ {
        self.records.iter().copied()
    }

    pub fn on_map(&self, map: &str) -> Snapshot<'a> {
        self.filter(|r| r.map == map)
    }

    /// Team on either side.
    pub fn involving(&self, team: &str) -> Snapshot<'a> {
        self.filter(|r| r.involves(team))
    }

    /// Meetings between the pair, in either orientation.
    pub fn between(&self, team_a: &str, team_b: &str) -> Snapshot<'a> {
        self.filter(|r| {
            (r.team_a == team_a && r.team_b == team_b) || (r.team_a == team_b && r.team_b == team_a)
        })
    }

    pub fn tier(&self, tier: Tier) -> Snapshot<'a> {
        self.filter(|r| r.tier == tier)
    }

    fn filter(&self, keep: impl Fn(&MatchRecord) -> bool) -> Snapshot<'a> {
        Snapshot {
            as_of: self.as_of,
            records: self.records.iter().copied().filter(|r| keep(r)).collect(),
        }
    }
}
