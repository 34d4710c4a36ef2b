#![forbid(unsafe_code)]
//! Dirty metadata-page tracking per log group.
//!
//! Every log record appended to a group dirties some set of map pages
//! (mpages). The checkpoint for that group must flush exactly those pages,
//! so the log-write path records them here and the releaser snapshots the
//! accumulated set when the group's checkpoint begins.

use karst_types::{LogGroupId, MapId, MpageNum};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::notifier::ResetSubscriber;

/// Set of dirty (map, mpage) coordinates, grouped by map.
///
/// Immutable once handed to the checkpoint handler: `DirtyMapManager`
/// returns snapshots, never live references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapPageSet {
    pages: BTreeMap<MapId, BTreeSet<MpageNum>>,
}

impl MapPageSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one dirty mpage. Returns `true` if it was not already present.
    pub fn insert(&mut self, map: MapId, mpage: MpageNum) -> bool {
        self.pages.entry(map).or_default().insert(mpage)
    }

    /// Fold another set into this one.
    pub fn merge(&mut self, other: &MapPageSet) {
        for (map, mpages) in &other.pages {
            self.pages.entry(*map).or_default().extend(mpages.iter().copied());
        }
    }

    /// Iterate maps and their dirty mpage sets in map order.
    pub fn maps(&self) -> impl Iterator<Item = (MapId, &BTreeSet<MpageNum>)> {
        self.pages.iter().map(|(map, mpages)| (*map, mpages))
    }

    /// Number of distinct maps with at least one dirty mpage.
    #[must_use]
    pub fn map_count(&self) -> usize {
        self.pages.len()
    }

    /// Total number of dirty mpages across all maps.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.values().map(BTreeSet::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Decompose into per-map entries, consuming the set.
    #[must_use]
    pub fn into_maps(self) -> BTreeMap<MapId, BTreeSet<MpageNum>> {
        self.pages
    }
}

/// Read side of the dirty-page index: one snapshot per log group.
pub trait DirtyPageIndex: Send + Sync {
    /// The dirty pages accumulated for `group`. Pure snapshot; later writes
    /// to the index do not mutate a returned set.
    fn dirty_list(&self, group: LogGroupId) -> MapPageSet;
}

/// Tracks which mpages each in-flight log group has dirtied.
///
/// Fed by the log-write path, drained by the releaser at checkpoint start,
/// and cleared per group once the group's region has been reset (via the
/// [`ResetSubscriber`] impl).
#[derive(Debug, Default)]
pub struct DirtyMapManager {
    groups: Mutex<HashMap<LogGroupId, MapPageSet>>,
}

impl DirtyMapManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a record in `group` dirtied `mpage` of `map`.
    pub fn add_dirty_page(&self, group: LogGroupId, map: MapId, mpage: MpageNum) {
        self.groups.lock().entry(group).or_default().insert(map, mpage);
    }

    /// Fold a batch of dirty pages into `group`'s set.
    pub fn add_dirty_pages(&self, group: LogGroupId, pages: &MapPageSet) {
        self.groups.lock().entry(group).or_default().merge(pages);
    }

    /// Drop all tracking for `group`.
    pub fn clear_group(&self, group: LogGroupId) {
        self.groups.lock().remove(&group);
    }

    /// Total dirty mpages currently tracked for `group`.
    #[must_use]
    pub fn page_count(&self, group: LogGroupId) -> usize {
        self.groups.lock().get(&group).map_or(0, MapPageSet::page_count)
    }
}

impl DirtyPageIndex for DirtyMapManager {
    fn dirty_list(&self, group: LogGroupId) -> MapPageSet {
        self.groups.lock().get(&group).cloned().unwrap_or_default()
    }
}

impl ResetSubscriber for DirtyMapManager {
    fn log_buffer_reset(&self, group: LogGroupId) {
        self.clear_group(group);
    }
}
