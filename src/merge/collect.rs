//! The joint three-tree walk: populates the path map with one record per
//! path appearing in any of {base, side1, side2} and queues up the rename
//! candidates for both sides.
//!
//! The traversal is an explicit work queue of directory triples rather than
//! mutual recursion; within one directory all plain file entries are examined
//! before any subdirectory is descended into, so that the rename-source
//! elision mask has settled by the time it is inherited.

use super::state::*;
use super::MergeCtxt;
use crate::error::OrtResult;
use crate::obj::{FileMode, Oid, Tree, TreeEntry};
use crate::path::OrtPath;
use itertools::Itertools;
use rustc_hash::FxHashMap;

/// how far the path count must shrink across deferred-subtree handling before
/// collection is worth redoing with a populated rename cache
const REDO_FACTOR: usize = 10;

pub(super) struct WorkItem {
    dir: OrtPath,
    trees: [Option<Oid>; 3],
    dir_rename_mask: u8,
}

fn entry_masks(ents: &[Option<TreeEntry>; 3]) -> (u8, u8, u8) {
    let mut filemask = 0u8;
    let mut dirmask = 0u8;
    for role in 0..3 {
        if let Some(entry) = ents[role] {
            if entry.mode.is_tree() {
                dirmask |= 1 << role;
            } else {
                filemask |= 1 << role;
            }
        }
    }
    // pairwise (mode, oid) equality between file roles; a matching pair sets
    // both its bits, so the encoding is {3, 5, 6, 7}
    let mut match_mask = 0u8;
    for (i, j, bits) in [(0, 1, 0b011u8), (0, 2, 0b101), (1, 2, 0b110)] {
        if let (Some(a), Some(b)) = (ents[i], ents[j]) {
            if !a.mode.is_tree() && !b.mode.is_tree() && a.oid == b.oid && a.mode == b.mode {
                match_mask |= bits;
            }
        }
    }
    (filemask, dirmask, match_mask)
}

fn version_of(entry: TreeEntry) -> VersionInfo {
    VersionInfo::new(entry.oid, entry.mode)
}

impl MergeCtxt<'_> {
    pub(super) fn collect_merge_info(&mut self, trees: [Option<Oid>; 3]) -> OrtResult<()> {
        debug!("MergeCtxt::collect_merge_info({:?})", trees);
        let mut queue = vec![WorkItem { dir: OrtPath::EMPTY, trees, dir_rename_mask: 0 }];
        self.drain_queue(&mut queue)?;
        self.handle_deferred_entries(&mut queue)?;
        Ok(())
    }

    fn drain_queue(&mut self, queue: &mut Vec<WorkItem>) -> OrtResult<()> {
        while let Some(item) = queue.pop() {
            self.collect_tree_triple(item, queue)?;
        }
        Ok(())
    }

    fn collect_tree_triple(&mut self, item: WorkItem, queue: &mut Vec<WorkItem>) -> OrtResult<()> {
        let WorkItem { dir, trees, dir_rename_mask } = item;
        let mut local_mask = dir_rename_mask;

        let mut parsed: [Tree; 3] = Default::default();
        for (role, oid) in trees.iter().enumerate() {
            if let Some(oid) = oid {
                parsed[role] = self.odb.read_tree(*oid)?;
            }
        }

        let mut names: FxHashMap<&'static str, [Option<TreeEntry>; 3]> = FxHashMap::default();
        for role in 0..3 {
            for &entry in &parsed[role].entries {
                names.entry(entry.name.as_str()).or_insert([None; 3])[role] = Some(entry);
            }
        }
        let sorted_names: Vec<&str> = names.keys().copied().sorted().collect();

        // pass 1: entries that are files (or absent) on every role
        for &name in &sorted_names {
            let ents = &names[name];
            if ents.iter().flatten().any(|entry| entry.mode.is_tree()) {
                continue;
            }
            self.collect_file_entry(dir, name, ents, &mut local_mask)?;
        }

        // pass 2: entries with a directory on at least one role
        let mut subdirs = vec![];
        for &name in &sorted_names {
            let ents = &names[name];
            if !ents.iter().flatten().any(|entry| entry.mode.is_tree()) {
                continue;
            }
            self.collect_dir_entry(dir, name, ents, local_mask, &mut subdirs)?;
        }
        // LIFO queue: reversed push keeps the traversal in lexical order
        queue.extend(subdirs.into_iter().rev());
        Ok(())
    }

    fn collect_file_entry(
        &mut self,
        dir: OrtPath,
        name: &str,
        ents: &[Option<TreeEntry>; 3],
        local_mask: &mut u8,
    ) -> OrtResult<()> {
        let path = dir.join(name);
        let (filemask, _dirmask, match_mask) = entry_masks(ents);

        // trivial resolutions; none of these recurse or contribute rename candidates
        if match_mask == 7 {
            self.paths.insert(path, PathInfo::resolved(path, version_of(ents[MERGE_BASE].unwrap())));
            return Ok(());
        }
        if filemask == 7 {
            let winner = match match_mask {
                0b110 => Some(MERGE_SIDE1),
                0b011 => Some(MERGE_SIDE2),
                0b101 => Some(MERGE_SIDE1),
                _ => None,
            };
            if let Some(role) = winner {
                self.paths.insert(path, PathInfo::resolved(path, version_of(ents[role].unwrap())));
                return Ok(());
            }
        }

        let mut info = PathInfo::new(path);
        info.filemask = filemask;
        info.match_mask = match_mask;
        for role in 0..3 {
            if let Some(entry) = ents[role] {
                info.stages[role] = version_of(entry);
            }
        }
        self.paths.insert(path, info);

        self.maybe_raise_dir_rename_mask(ents, local_mask);
        self.collect_rename_candidates(path, ents, match_mask, *local_mask);
        Ok(())
    }

    /// Inside a subtree that one side removed wholesale, a source whose other
    /// side still matches the base would normally be elided; that would starve
    /// directory-rename inference of exactly the renames it counts, so once we
    /// see such a file every rename source below here is kept.
    fn maybe_raise_dir_rename_mask(&self, ents: &[Option<TreeEntry>; 3], local_mask: &mut u8) {
        let side = match *local_mask {
            2 => MergeSide::Side1,
            4 => MergeSide::Side2,
            _ => return,
        };
        let base = match ents[MERGE_BASE] {
            Some(entry) => entry,
            None => return,
        };
        if ents[side.role()].is_none() && ents[side.other().role()] == Some(base) {
            *local_mask = 7;
        }
    }

    fn collect_rename_candidates(
        &mut self,
        path: OrtPath,
        ents: &[Option<TreeEntry>; 3],
        match_mask: u8,
        dir_rename_mask: u8,
    ) {
        let blob_at = |role: usize| ents[role].filter(|entry| entry.mode.is_blob());
        for side in MergeSide::BOTH {
            match (blob_at(MERGE_BASE), blob_at(side.role())) {
                (Some(base), None) => {
                    let other = ents[side.other().role()];
                    let unchanged_other = other == Some(base);
                    let mut relevance = 0u8;
                    if other.map_or(false, |entry| entry.mode.is_blob()) && !unchanged_other {
                        relevance |= RELEVANT_CONTENT;
                    }
                    if self.dir_rename_detection()
                        && (dir_rename_mask == 7 || dir_rename_mask & side.mask() != 0)
                    {
                        relevance |= RELEVANT_LOCATION;
                    }
                    if relevance == 0 {
                        // pure-unchanged sources may be dropped outright, and
                        // sources a previous merge already found uninteresting
                        // can be skipped once the cache is declared valid
                        if unchanged_other && dir_rename_mask == 0 {
                            continue;
                        }
                        if self.cache.valid_side.covers(side)
                            && self.cache.cached_irrelevant[side.ix()].contains(&path)
                        {
                            continue;
                        }
                    }
                    let spec = FileSpec { path, oid: base.oid, mode: base.mode };
                    let renames = &mut self.renames[side.ix()];
                    renames.pairs.push(DiffPair::deleted(spec));
                    if relevance != 0 {
                        renames.relevant_sources.insert(path, relevance);
                    }
                }
                (None, Some(added)) => {
                    // identical adds on both sides need no rename detection
                    // unless a directory rename might still pull them along
                    if match_mask == 0b110 && dir_rename_mask == 0 {
                        continue;
                    }
                    let spec = FileSpec { path, oid: added.oid, mode: added.mode };
                    self.renames[side.ix()].pairs.push(DiffPair::added(spec));
                }
                _ => {}
            }
        }
    }

    fn collect_dir_entry(
        &mut self,
        dir: OrtPath,
        name: &str,
        ents: &[Option<TreeEntry>; 3],
        local_mask: u8,
        subdirs: &mut Vec<WorkItem>,
    ) -> OrtResult<()> {
        let path = dir.join(name);
        let (filemask, dirmask, match_mask) = entry_masks(ents);
        let present_mask = filemask | dirmask;

        // all three sides agree, trees included; adopt without recursing
        if ents[0].is_some() && ents[0] == ents[1] && ents[1] == ents[2] {
            self.paths.insert(path, PathInfo::resolved(path, version_of(ents[MERGE_BASE].unwrap())));
            return Ok(());
        }

        let trees = [0, 1, 2].map(|role| {
            ents[role].filter(|entry| entry.mode.is_tree()).map(|entry| entry.oid)
        });

        if filemask == 0 && dirmask == present_mask {
            // both sides brought the same new directory
            if dirmask == 0b110 && ents[1] == ents[2] && local_mask == 0 {
                self.paths.insert(path, PathInfo::resolved(path, version_of(ents[MERGE_SIDE1].unwrap())));
                return Ok(());
            }
            // exactly one side changed this subtree: recursing into it is
            // wasted work unless a rename needs something inside, so park it
            if local_mask == 0 {
                let changed_side = match dirmask {
                    0b010 => Some(MergeSide::Side1),
                    0b100 => Some(MergeSide::Side2),
                    0b111 if trees[0] == trees[1] => Some(MergeSide::Side2),
                    0b111 if trees[0] == trees[2] => Some(MergeSide::Side1),
                    _ => None,
                };
                if let Some(side) = changed_side {
                    if !self.renames[side.ix()].limit_hit {
                        let mut info = PathInfo::new(path);
                        info.dirmask = dirmask;
                        self.paths.insert(path, info);
                        self.renames[side.ix()].deferred.push(DeferredDir {
                            dir: path,
                            trees,
                            dir_rename_mask: local_mask,
                        });
                        return Ok(());
                    }
                }
            }
        }

        // ordinary case: a pending record built up from its children
        let mut info = PathInfo::new(path);
        info.filemask = filemask;
        info.dirmask = dirmask;
        info.match_mask = match_mask;
        info.df_conflict = filemask != 0 && dirmask != 0;
        for role in 0..3 {
            if let Some(entry) = ents[role] {
                info.stages[role] = version_of(entry);
            }
        }
        self.paths.insert(path, info);

        let mut child_mask = local_mask;
        if dirmask & 1 != 0 {
            for side in MergeSide::BOTH {
                if dirmask & side.mask() == 0 {
                    self.renames[side.ix()].dirs_removed.insert(path, local_mask == 7);
                    if self.dir_rename_detection() && child_mask != 7 {
                        child_mask = if child_mask == 0 { side.mask() } else { 7 };
                    }
                }
            }
        }
        subdirs.push(WorkItem { dir: path, trees, dir_rename_mask: child_mask });

        if filemask != 0 {
            self.collect_rename_candidates(path, ents, match_mask, local_mask);
        }
        Ok(())
    }

    /// Deferred subtrees are expanded only if rename handling might need their
    /// contents; the rest resolve by adopting the changed side's tree id. If
    /// handling them shrinks the path count to under 1/REDO_FACTOR of what it
    /// was, a redo of the whole collection with a populated rename cache is
    /// requested.
    fn handle_deferred_entries(&mut self, queue: &mut Vec<WorkItem>) -> OrtResult<()> {
        let path_count_before = self.paths.len();
        loop {
            let mut progressed = false;
            for side in MergeSide::BOTH {
                let deferred = std::mem::take(&mut self.renames[side.ix()].deferred);
                for entry in deferred {
                    progressed = true;
                    if self.should_expand_deferred(side, &entry) {
                        trace!("expanding deferred subtree `{}` for {:?}", entry.dir, side);
                        queue.push(WorkItem {
                            dir: entry.dir,
                            trees: entry.trees,
                            dir_rename_mask: entry.dir_rename_mask,
                        });
                    } else {
                        trace!("bulk-adopting deferred subtree `{}` from {:?}", entry.dir, side);
                        let tree = entry.trees[side.role()];
                        let info = self.paths.get_mut(&entry.dir).unwrap();
                        info.result = match tree {
                            Some(oid) => VersionInfo::new(oid, FileMode::TREE),
                            None => VersionInfo::NULL,
                        };
                        info.clean = true;
                    }
                }
            }
            self.drain_queue(queue)?;
            if !progressed {
                break;
            }
        }

        let path_count_after = self.paths.len();
        if !self.redone && path_count_after * REDO_FACTOR < path_count_before {
            debug!(
                "requesting collection redo after renames ({} -> {} paths)",
                path_count_before, path_count_after
            );
            self.redo_after_renames = true;
            self.cache.valid_side = CacheValidity::Both;
        }
        Ok(())
    }

    fn should_expand_deferred(&self, side: MergeSide, entry: &DeferredDir) -> bool {
        let renames = &self.renames[side.ix()];
        if renames.limit_hit || !renames.relevant_sources.is_empty() {
            return true;
        }
        let receives_renames = |dir: &OrtPath| *dir == entry.dir || dir.is_inside(entry.dir);
        if renames.target_dirs.iter().any(receives_renames) {
            return true;
        }
        if self.cache.valid_side.covers(side)
            && self.cache.cached_target_names[side.ix()].iter().any(receives_renames)
        {
            return true;
        }
        self.dir_rename_detection() && !renames.dirs_removed.is_empty()
    }
}
