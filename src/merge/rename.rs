//! Rename detection and application.
//!
//! Phase one pairs up each side's delete/add candidates: exact matches by
//! object id first, then content similarity over the relevant remainder.
//! Phase two aggregates the per-file renames into directory renames and
//! applies implicit renames to paths the other side added inside a renamed
//! directory. Results are cached so a sequence of merges (cherry-pick,
//! rebase) can skip redetection on the side that did not change.

use super::state::*;
use super::{DirRenameDetection, MergeCtxt};
use crate::error::OrtResult;
use crate::obj::Oid;
use crate::path::OrtPath;
use itertools::Itertools;
use rustc_hash::FxHashMap;
use std::hash::Hasher;

pub const MAX_SIMILARITY_SCORE: u32 = 60000;
pub const DEFAULT_RENAME_SCORE: u32 = MAX_SIMILARITY_SCORE / 2;
pub const DEFAULT_RENAME_LIMIT: i32 = 1000;

/// Similarity in [0, MAX_SIMILARITY_SCORE]: the byte volume of common lines
/// relative to the larger file.
pub fn estimate_similarity(src: &[u8], dst: &[u8]) -> u32 {
    if src.is_empty() || dst.is_empty() {
        return 0;
    }
    if src == dst {
        return MAX_SIMILARITY_SCORE;
    }
    let mut lines: FxHashMap<u64, u32> = FxHashMap::default();
    for line in split_lines(src) {
        *lines.entry(hash_line(line)).or_default() += 1;
    }
    let mut common = 0u64;
    for line in split_lines(dst) {
        if let Some(count) = lines.get_mut(&hash_line(line)) {
            if *count > 0 {
                *count -= 1;
                common += line.len() as u64;
            }
        }
    }
    let max_size = src.len().max(dst.len()) as u64;
    ((common * MAX_SIMILARITY_SCORE as u64) / max_size) as u32
}

fn hash_line(line: &[u8]) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(line);
    hasher.finish()
}

fn split_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(rest.len());
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

impl MergeCtxt<'_> {
    pub(super) fn detect_and_process_renames(&mut self) -> OrtResult<()> {
        for side in MergeSide::BOTH {
            self.detect_regular_renames(side)?;
        }
        if self.dir_rename_detection() {
            for side in MergeSide::BOTH {
                self.compute_dir_renames(side);
            }
            self.invalidate_dir_renames();
            for side in MergeSide::BOTH {
                self.apply_implicit_dir_renames(side)?;
            }
        }
        self.process_renames()
    }

    /// Regular renames for one side: exact matches by oid, similarity
    /// scoring for the relevant rest, and cache emission.
    pub(super) fn detect_regular_renames(&mut self, side: MergeSide) -> OrtResult<()> {
        let six = side.ix();
        debug!(
            "MergeCtxt::detect_regular_renames({:?}): {} candidate pairs",
            side,
            self.renames[six].pairs.len()
        );

        // sources the cache already has answers for need no redetection
        {
            let cache = &self.cache;
            self.renames[six].relevant_sources.retain(|path, _| {
                !cache.cached_pairs[six].contains_key(path)
                    && !cache.cached_irrelevant[six].contains(path)
            });
        }

        if self.cache.valid_side.covers(side) {
            // cached pairs are taken as known matches; detection still runs
            // for whatever the cache has no answer for
            self.apply_cached_renames(side);
        } else {
            self.cache.clear_side(side);
        }
        let mut pairs = std::mem::take(&mut self.renames[six].pairs);

        let mut unmatched_dels: Vec<usize> = vec![];
        let mut unmatched_adds: Vec<usize> = vec![];
        for (idx, pair) in pairs.iter().enumerate() {
            match pair.status {
                PairStatus::Delete => unmatched_dels.push(idx),
                PairStatus::Add => unmatched_adds.push(idx),
                PairStatus::Rename => {}
            }
        }

        // exact renames: unmodified content pairs up by object id alone
        let mut by_oid: FxHashMap<Oid, Vec<usize>> = FxHashMap::default();
        for &del in unmatched_dels.iter().rev() {
            by_oid.entry(pairs[del].src().oid).or_default().push(del);
        }
        let mut consumed_adds = vec![false; pairs.len()];
        unmatched_adds.retain(|&add| {
            let dst = *pairs[add].dst();
            if let Some(dels) = by_oid.get_mut(&dst.oid) {
                if let Some(pos) = dels.iter().rposition(|&del| pairs[del].src().mode == dst.mode) {
                    let del = dels.remove(pos);
                    pairs[del].two = Some(dst);
                    pairs[del].status = PairStatus::Rename;
                    pairs[del].score = MAX_SIMILARITY_SCORE;
                    consumed_adds[add] = true;
                    return false;
                }
            }
            true
        });
        unmatched_dels.retain(|&del| pairs[del].status == PairStatus::Delete);

        // inexact renames: only sources somebody actually cares about
        let relevant_dels: Vec<usize> = unmatched_dels
            .iter()
            .copied()
            .filter(|&del| self.renames[six].relevant_sources.contains_key(&pairs[del].src().path))
            .collect();
        let limit = effective_rename_limit(self.opts.rename_limit) as usize;
        if relevant_dels.len() * unmatched_adds.len() > limit * limit {
            warn!("skipping inexact rename detection for {:?}: too many candidates", side);
            self.renames[six].limit_hit = true;
            self.path_msg(
                OrtPath::EMPTY,
                format!(
                    "warning: inexact rename detection was skipped due to too many files (limit {}).",
                    limit
                ),
            );
        } else if !relevant_dels.is_empty() && !unmatched_adds.is_empty() {
            let min_score = effective_rename_score(self.opts.rename_score);
            let mut candidates = vec![];
            let mut del_blobs = FxHashMap::default();
            for &del in &relevant_dels {
                del_blobs.insert(del, self.odb.read_blob(pairs[del].src().oid)?);
            }
            for &add in &unmatched_adds {
                let dst_blob = self.odb.read_blob(pairs[add].dst().oid)?;
                for &del in &relevant_dels {
                    let score = estimate_similarity(&del_blobs[&del], &dst_blob);
                    if score >= min_score {
                        candidates.push((score, del, add));
                    }
                }
            }
            // best scores first; ties break on pair order for determinism
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| (a.1, a.2).cmp(&(b.1, b.2))));
            for (score, del, add) in candidates {
                if pairs[del].status != PairStatus::Delete || consumed_adds[add] {
                    continue;
                }
                let dst = pairs[add].two;
                pairs[del].two = dst;
                pairs[del].status = PairStatus::Rename;
                pairs[del].score = score;
                consumed_adds[add] = true;
            }
        }

        // drop adds that were fused into renames, keep traversal order otherwise
        let mut out = Vec::with_capacity(pairs.len());
        for (idx, pair) in pairs.into_iter().enumerate() {
            if !consumed_adds[idx] {
                out.push(pair);
            }
        }

        // cache emission so a follow-up merge in a sequence can skip all this
        for pair in &out {
            match pair.status {
                PairStatus::Rename => {
                    let src = pair.src().path;
                    let dst = pair.dst().path;
                    trace!("rename on {:?}: `{}` -> `{}` (score {})", side, src, dst, pair.score);
                    self.cache.cached_pairs[six].insert(src, Some(dst));
                    let target_dir = dst.parent().unwrap_or(OrtPath::EMPTY);
                    self.cache.cached_target_names[six].insert(target_dir);
                    self.renames[six].target_dirs.insert(target_dir);
                }
                PairStatus::Delete => {
                    let src = pair.src().path;
                    if self.renames[six].relevant_sources.contains_key(&src) {
                        self.cache.cached_pairs[six].insert(src, None);
                    } else {
                        self.cache.cached_irrelevant[six].insert(src);
                    }
                }
                PairStatus::Add => {}
            }
        }
        self.renames[six].pairs = out;
        Ok(())
    }

    /// the cache-reuse short-circuit: replay the previous merge's rename
    /// conclusions before detection gets a look at the leftovers
    fn apply_cached_renames(&mut self, side: MergeSide) {
        let six = side.ix();
        debug!("MergeCtxt::apply_cached_renames({:?})", side);
        let mut pairs = std::mem::take(&mut self.renames[six].pairs);

        let mut add_by_path: FxHashMap<OrtPath, usize> = FxHashMap::default();
        for (idx, pair) in pairs.iter().enumerate() {
            if pair.status == PairStatus::Add {
                add_by_path.insert(pair.dst().path, idx);
            }
        }

        let mut consumed = vec![false; pairs.len()];
        for del in 0..pairs.len() {
            if pairs[del].status != PairStatus::Delete {
                continue;
            }
            let src = pairs[del].src().path;
            if let Some(Some(dst)) = self.cache.cached_pairs[six].get(&src) {
                if let Some(&add) = add_by_path.get(dst) {
                    let two = pairs[add].two;
                    pairs[del].two = two;
                    pairs[del].status = PairStatus::Rename;
                    pairs[del].score = MAX_SIMILARITY_SCORE;
                    consumed[add] = true;
                }
            }
        }

        let mut out = Vec::with_capacity(pairs.len());
        for (idx, pair) in pairs.into_iter().enumerate() {
            if !consumed[idx] {
                out.push(pair);
            }
        }
        self.renames[six].pairs = out;

        let cached_targets = self.cache.cached_target_names[six].iter().copied().collect_vec();
        self.renames[six].target_dirs.extend(cached_targets);
    }

    /// Directory renames: aggregate this side's file renames into
    /// old-directory -> new-directory counts and collapse each row to its
    /// strict maximum.
    fn compute_dir_renames(&mut self, side: MergeSide) {
        let six = side.ix();
        let mut counts: FxHashMap<OrtPath, FxHashMap<OrtPath, u32>> = FxHashMap::default();
        for pair in &self.renames[six].pairs {
            if pair.status != PairStatus::Rename {
                continue;
            }
            let src_dir = pair.src().path.parent().unwrap_or(OrtPath::EMPTY);
            let dst_dir = pair.dst().path.parent().unwrap_or(OrtPath::EMPTY);
            if src_dir == dst_dir || !self.renames[six].dirs_removed.contains_key(&src_dir) {
                continue;
            }
            *counts.entry(src_dir).or_default().entry(dst_dir).or_default() += 1;
        }

        self.renames[six].dir_rename_count = counts;

        let mut dir_renames = FxHashMap::default();
        let mut split_conflicts = vec![];
        for (&old_dir, targets) in &self.renames[six].dir_rename_count {
            let max = targets.values().copied().max().unwrap();
            let best: Vec<OrtPath> =
                targets.iter().filter(|(_, &count)| count == max).map(|(&dir, _)| dir).collect();
            match best.as_slice() {
                [winner] => {
                    debug!("directory rename on {:?}: `{}` -> `{}`", side, old_dir, winner);
                    dir_renames.insert(old_dir, *winner);
                }
                _ => split_conflicts.push(old_dir),
            }
        }
        debug!("{} directory rename(s) on {:?}", dir_renames.len(), side);
        for old_dir in split_conflicts {
            self.forced_unclean = true;
            let label = self.side_label(side).to_owned();
            self.path_msg(
                old_dir,
                format!(
                    "CONFLICT (directory rename split): Unclear where to rename {} to in {}; \
                     it was renamed to multiple other directories, with no destination getting \
                     a majority of the files.",
                    old_dir, label
                ),
            );
        }
        self.renames[six].dir_renames = dir_renames;
    }

    fn invalidate_dir_renames(&mut self) {
        // a directory renamed on both sides is already fully handled by the
        // two sides' individual file renames
        let duplicated: Vec<OrtPath> = self.renames[0]
            .dir_renames
            .keys()
            .filter(|old| self.renames[1].dir_renames.contains_key(*old))
            .copied()
            .collect();
        for old in duplicated {
            self.renames[0].dir_renames.remove(&old);
            self.renames[1].dir_renames.remove(&old);
        }

        // drop mappings whose source is not actually gone on that side
        for side in MergeSide::BOTH {
            let six = side.ix();
            let stale: Vec<OrtPath> = self.renames[six]
                .dir_renames
                .keys()
                .filter(|old| {
                    self.paths
                        .get(old)
                        .map_or(true, |info| info.clean || info.dirmask & side.mask() != 0)
                })
                .copied()
                .collect();
            for old in stale {
                self.renames[six].dir_renames.remove(&old);
            }
        }
    }

    /// paths the *other* side created inside a directory this side renamed
    /// follow the rename, unless doing so would collide
    fn apply_implicit_dir_renames(&mut self, renaming_side: MergeSide) -> OrtResult<()> {
        if self.renames[renaming_side.ix()].dir_renames.is_empty() {
            return Ok(());
        }
        let applying = renaming_side.other();

        // census of rewrite targets so n-to-1 collapses can be refused
        let mut rewrites: Vec<(usize, OrtPath, OrtPath)> = vec![];
        let mut target_census: FxHashMap<OrtPath, u32> = FxHashMap::default();
        for (idx, pair) in self.renames[applying.ix()].pairs.iter().enumerate() {
            if !matches!(pair.status, PairStatus::Add | PairStatus::Rename) {
                continue;
            }
            let old_path = pair.dst().path;
            if let Some(new_path) = self.apply_dir_rename(renaming_side, old_path) {
                *target_census.entry(new_path).or_default() += 1;
                rewrites.push((idx, old_path, new_path));
            }
        }

        for (idx, old_path, new_path) in rewrites {
            let occupied = self.paths.get(&new_path).map_or(false, |info| {
                (info.filemask | info.dirmask) & applying.mask() != 0
            });
            if occupied || target_census[&new_path] > 1 {
                let applying_label = self.side_label(applying).to_owned();
                self.path_msg(
                    new_path,
                    format!(
                        "CONFLICT (implicit dir rename): Cannot map more than one path to {}; \
                         implicit directory renames tried to put {} there.",
                        new_path, old_path
                    ),
                );
                trace!("implicit rename of `{}` for {} abstained", old_path, applying_label);
                if let Some(info) = self.paths.get_mut(&old_path) {
                    info.path_conflict = true;
                }
                if let Some(info) = self.paths.get_mut(&new_path) {
                    info.path_conflict = true;
                }
                continue;
            }

            let as_conflict = self.opts.detect_directory_renames == DirRenameDetection::Conflict;
            if let Some(two) = &mut self.renames[applying.ix()].pairs[idx].two {
                two.path = new_path;
            }
            self.move_path_record(old_path, new_path, as_conflict)?;
            if as_conflict {
                self.path_msg(
                    new_path,
                    format!(
                        "CONFLICT (file location): {} added in {} inside a directory that was \
                         renamed in {}, suggesting it should perhaps be moved to {}.",
                        old_path,
                        self.side_label(applying),
                        self.side_label(renaming_side),
                        new_path
                    ),
                );
            } else {
                self.path_msg(
                    new_path,
                    format!(
                        "Path updated: {} added in {} inside a directory that was renamed in {}; \
                         moving it to {}.",
                        old_path,
                        self.side_label(applying),
                        self.side_label(renaming_side),
                        new_path
                    ),
                );
            }
        }
        Ok(())
    }

    /// rewrite `path` through the longest matching directory rename of `side`
    fn apply_dir_rename(&self, side: MergeSide, path: OrtPath) -> Option<OrtPath> {
        let dir_renames = &self.renames[side.ix()].dir_renames;
        // ancestors() yields the deepest directory first, which is exactly
        // the longest-match rule
        let (old_dir, new_dir) = path.ancestors().find_map(|ancestor| {
            dir_renames.get(&ancestor).map(|&new_dir| (ancestor, new_dir))
        })?;
        let suffix = &path.as_str()[old_dir.len() + 1..];
        Some(new_dir.join(suffix))
    }

    /// Moving a record inside the path map: transfer to an empty slot or
    /// merge into a resident record for the complementary side(s)
    pub(super) fn move_path_record(
        &mut self,
        old_path: OrtPath,
        new_path: OrtPath,
        as_conflict: bool,
    ) -> OrtResult<()> {
        let mut moving = match self.paths.remove(&old_path) {
            Some(info) => info,
            None => bail!("no record at `{}` to relocate", old_path),
        };
        trace!("moving path record `{}` -> `{}`", old_path, new_path);
        if let Some(resident) = self.paths.get_mut(&new_path) {
            ensure!(
                resident.filemask & moving.filemask == 0,
                "records at `{}` and `{}` overlap on roles",
                old_path,
                new_path
            );
            for role in 0..3 {
                if moving.filemask & (1 << role) != 0 {
                    resident.stages[role] = moving.stages[role];
                    resident.pathnames[role] = moving.pathnames[role];
                    resident.filemask |= 1 << role;
                }
            }
            if resident.dirmask != 0 {
                resident.df_conflict = true;
            }
            if as_conflict {
                resident.path_conflict = true;
            }
        } else {
            moving.directory_name = new_path.parent().unwrap_or(OrtPath::EMPTY);
            moving.basename_offset = new_path.basename_offset();
            if as_conflict {
                moving.path_conflict = true;
            }
            self.ensure_directory_records(new_path);
            self.paths.insert(new_path, moving);
        }
        Ok(())
    }

    /// ancestors of a rename target may be directories no input tree had;
    /// they still need records for the bottom-up tree construction
    pub(super) fn ensure_directory_records(&mut self, path: OrtPath) {
        for ancestor in path.ancestors() {
            if ancestor.is_empty() || self.paths.contains_key(&ancestor) {
                break;
            }
            self.paths.insert(ancestor, PathInfo::new(ancestor));
        }
    }

    /// Fold each rename's source stages into its target record so the
    /// resolver sees the full three-way state at the post-rename path.
    fn process_renames(&mut self) -> OrtResult<()> {
        let mut by_src: FxHashMap<OrtPath, [Option<OrtPath>; 2]> = FxHashMap::default();
        for side in MergeSide::BOTH {
            for pair in &self.renames[side.ix()].pairs {
                if pair.status == PairStatus::Rename {
                    by_src.entry(pair.src().path).or_default()[side.ix()] = Some(pair.dst().path);
                }
            }
        }

        for (src, targets) in by_src.into_iter().sorted() {
            match targets {
                [Some(dst1), Some(dst2)] if dst1 == dst2 => {
                    // both sides renamed it the same way
                    self.fold_rename_stages(src, dst1, &[MERGE_BASE])?;
                    self.resolve_source_as_gone(src);
                }
                [Some(dst1), Some(dst2)] => {
                    // rename/rename(1to2): the base version wants to be in two places
                    let msg = format!(
                        "CONFLICT (rename/rename): {} renamed to {} in {} and to {} in {}.",
                        src,
                        dst1,
                        self.side_label(MergeSide::Side1),
                        dst2,
                        self.side_label(MergeSide::Side2)
                    );
                    self.path_msg(dst1, &msg);
                    self.path_msg(dst2, &msg);
                    for dst in [dst1, dst2] {
                        self.fold_rename_stages(src, dst, &[MERGE_BASE])?;
                        if let Some(info) = self.paths.get_mut(&dst) {
                            info.path_conflict = true;
                        }
                    }
                    self.resolve_source_as_gone(src);
                }
                [one, two] => {
                    let (side, dst) = match (one, two) {
                        (Some(dst), None) => (MergeSide::Side1, dst),
                        (None, Some(dst)) => (MergeSide::Side2, dst),
                        _ => continue,
                    };
                    self.process_single_rename(side, src, dst)?;
                }
            }
        }
        Ok(())
    }

    fn process_single_rename(&mut self, side: MergeSide, src: OrtPath, dst: OrtPath) -> OrtResult<()> {
        let other = side.other();
        let src_info = match self.paths.get(&src) {
            Some(info) => info.clone(),
            None => bail!("rename source `{}` has no record", src),
        };

        if src_info.filemask & other.mask() == 0 {
            // the other side deleted the source: rename/delete
            self.fold_rename_stages(src, dst, &[MERGE_BASE])?;
            if let Some(info) = self.paths.get_mut(&dst) {
                info.path_conflict = true;
            }
            let msg = format!(
                "CONFLICT (rename/delete): {} renamed to {} in {} but deleted in {}.",
                src,
                dst,
                self.side_label(side),
                self.side_label(other)
            );
            self.path_msg(dst, msg);
        } else {
            let dst_occupied = self
                .paths
                .get(&dst)
                .map_or(false, |info| info.filemask & other.mask() != 0);
            if dst_occupied {
                // rename/add: the other side independently put a file at the target
                self.fold_rename_stages(src, dst, &[MERGE_BASE])?;
                if let Some(info) = self.paths.get_mut(&dst) {
                    info.path_conflict = true;
                }
                let msg = format!(
                    "CONFLICT (rename/add): {} renamed to {} in {}, but {} added in {}.",
                    src,
                    dst,
                    self.side_label(side),
                    dst,
                    self.side_label(other)
                );
                self.path_msg(dst, msg);
            } else {
                // carry the base and the other side's version over to the target
                self.fold_rename_stages(src, dst, &[MERGE_BASE, other.role()])?;
            }
        }
        self.resolve_source_as_gone(src);
        Ok(())
    }

    fn fold_rename_stages(&mut self, src: OrtPath, dst: OrtPath, roles: &[usize]) -> OrtResult<()> {
        let src_info = match self.paths.get(&src) {
            Some(info) => info.clone(),
            None => bail!("rename source `{}` has no record", src),
        };
        let dst_info = match self.paths.get_mut(&dst) {
            Some(info) => info,
            None => bail!("rename target `{}` has no record", dst),
        };
        for &role in roles {
            if src_info.filemask & (1 << role) != 0 {
                dst_info.stages[role] = src_info.stages[role];
                dst_info.pathnames[role] = src_info.pathnames[role];
                dst_info.filemask |= 1 << role;
                // stages moved in from elsewhere invalidate the collector's equality bits
                dst_info.match_mask = 0;
            }
        }
        Ok(())
    }

    /// a fully-renamed-away source resolves to nothing at its old path
    fn resolve_source_as_gone(&mut self, src: OrtPath) {
        if let Some(info) = self.paths.get_mut(&src) {
            info.filemask = 0;
            info.match_mask = 0;
            if info.dirmask == 0 {
                info.clean = true;
                info.result = VersionInfo::NULL;
            } else {
                info.df_conflict = false;
            }
        }
    }
}

pub(super) fn effective_rename_limit(limit: i32) -> i32 {
    if limit <= 0 { DEFAULT_RENAME_LIMIT } else { limit }
}

fn effective_rename_score(score: u32) -> u32 {
    score.min(MAX_SIMILARITY_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_is_maximally_similar() {
        assert_eq!(estimate_similarity(b"a\nb\nc\n", b"a\nb\nc\n"), MAX_SIMILARITY_SCORE);
    }

    #[test]
    fn disjoint_content_scores_zero() {
        assert_eq!(estimate_similarity(b"a\nb\n", b"x\ny\n"), 0);
        assert_eq!(estimate_similarity(b"", b"x\n"), 0);
    }

    #[test]
    fn mostly_shared_lines_score_above_the_default_threshold() {
        let src = b"one\ntwo\nthree\nfour\n";
        let dst = b"one\ntwo\nthree\nfive\n";
        let score = estimate_similarity(src, dst);
        assert!(score > DEFAULT_RENAME_SCORE, "score {} too low", score);
        assert!(score < MAX_SIMILARITY_SCORE);
    }

    #[test]
    fn nonpositive_rename_limits_fall_back_to_the_default() {
        assert_eq!(effective_rename_limit(0), DEFAULT_RENAME_LIMIT);
        assert_eq!(effective_rename_limit(-3), DEFAULT_RENAME_LIMIT);
        assert_eq!(effective_rename_limit(25), 25);
    }
}
