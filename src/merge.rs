//! The merge engine: a three-way, in-memory tree merge with rename detection,
//! conflict classification and bottom-up tree emission. Nothing here touches
//! a working directory; input trees come from the object store and the merged
//! tree goes back into it.
//!
//! Data flows collector -> rename engine -> resolver -> tree builder, all
//! over the shared per-path map in [`state`].

mod collect;
mod rename;
mod resolve;
mod state;
mod tree_builder;

#[cfg(test)]
mod tests;

pub use self::rename::{DEFAULT_RENAME_LIMIT, DEFAULT_RENAME_SCORE, MAX_SIMILARITY_SCORE};
pub use self::state::{
    CacheValidity, MergeSide, MergeStage, PathInfo, RenameCache, UnmergedEntry, VersionInfo,
};
pub use crate::xdiff::MergeFavor;

use self::state::*;
use crate::error::OrtResult;
use crate::obj::{Commit, Oid};
use crate::odb::{merge_bases, Odb};
use crate::path::OrtPath;
use crate::xdiff::{self, ConflictStyle};
use indexmap::IndexMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DirRenameDetection {
    /// never infer directory renames
    None,
    /// infer them, but surface every implicit rename as a conflict
    Conflict,
    /// infer them and apply implicit renames silently (with a note)
    True,
}

#[derive(Debug, Clone)]
pub struct MergeOpts {
    /// human-readable names used in conflict messages
    pub ancestor_label: Option<String>,
    pub side1_label: String,
    pub side2_label: String,
    pub detect_directory_renames: DirRenameDetection,
    /// bound on the inexact rename matrix; zero or negative selects the default
    pub rename_limit: i32,
    /// minimum similarity for an inexact rename, in [0, MAX_SIMILARITY_SCORE]
    pub rename_score: u32,
    pub recursive_variant: MergeFavor,
    pub renormalize: bool,
    pub conflict_style: ConflictStyle,
}

impl Default for MergeOpts {
    fn default() -> Self {
        Self {
            ancestor_label: None,
            side1_label: "HEAD".to_owned(),
            side2_label: "merge".to_owned(),
            detect_directory_renames: DirRenameDetection::Conflict,
            rename_limit: 0,
            rename_score: DEFAULT_RENAME_SCORE,
            recursive_variant: MergeFavor::Normal,
            renormalize: false,
            conflict_style: ConflictStyle::Merge,
        }
    }
}

#[derive(Debug)]
pub struct MergeOutcome {
    /// the merged tree; complete even when the merge is unclean
    pub tree: Oid,
    pub clean: bool,
    /// conventional three-stage projection of everything left unresolved
    pub unmerged: Vec<UnmergedEntry>,
    /// per-path user-facing narration, in path order of first mention
    pub messages: IndexMap<OrtPath, String>,
}

/// The engine owns the rename cache that survives from merge to merge; one
/// instance is intended to be driven through a whole cherry-pick or rebase
/// sequence. There is exactly one merge in flight per engine at a time.
pub struct MergeEngine<'o> {
    odb: &'o dyn Odb,
    cache: RenameCache,
}

impl<'o> MergeEngine<'o> {
    pub fn new(odb: &'o dyn Odb) -> Self {
        Self { odb, cache: RenameCache::default() }
    }

    /// The caller's assertion that, relative to the previous merge on this
    /// engine, `side`'s renames are still valid (its base equals the previous
    /// other side and its tree equals the previous result). Detection for
    /// that side then replays the cache instead of re-running.
    pub fn declare_rename_cache_valid(&mut self, side: MergeSide) {
        self.cache.valid_side = CacheValidity::Side(side);
    }

    pub fn clear_rename_cache(&mut self) {
        self.cache.clear();
    }

    /// Three-way merge of tree objects; `base` is None when the sides share
    /// no common ancestor.
    pub fn merge_trees(
        &mut self,
        base: Option<Oid>,
        side1: Oid,
        side2: Oid,
        opts: &MergeOpts,
    ) -> OrtResult<MergeOutcome> {
        self.merge_trees_at_depth(base, side1, side2, opts, 0)
    }

    /// Merge two commits, recursively synthesizing a virtual ancestor when
    /// their merge base is not unique.
    pub fn merge_commits(&mut self, side1: Oid, side2: Oid, opts: &MergeOpts) -> OrtResult<MergeOutcome> {
        self.merge_commits_at_depth(side1, side2, opts, 0)
    }

    fn merge_commits_at_depth(
        &mut self,
        side1: Oid,
        side2: Oid,
        opts: &MergeOpts,
        depth: usize,
    ) -> OrtResult<MergeOutcome> {
        debug!("MergeEngine::merge_commits({}, {}, depth: {})", side1, side2, depth);
        let bases = merge_bases(self.odb, side1, side2)?;
        let base_tree = match bases.as_slice() {
            [] => None,
            [base] => Some(self.odb.parse_commit(*base)?.tree),
            _ => {
                // criss-cross history: merge the bases pairwise into a virtual
                // ancestor; conflicts inside it are accepted as-is, markers
                // and all, which is why inner marker sizes grow
                let mut virtual_base = bases[0];
                for &base in &bases[1..] {
                    let outcome = self.merge_commits_at_depth(virtual_base, base, opts, depth + 1)?;
                    let commit = Commit {
                        tree: outcome.tree,
                        parents: smallvec![virtual_base, base],
                        time: 0,
                        message: "virtual merge base".to_owned(),
                    };
                    virtual_base = self.odb.write_commit(&commit)?;
                }
                Some(self.odb.parse_commit(virtual_base)?.tree)
            }
        };
        let tree1 = self.odb.parse_commit(side1)?.tree;
        let tree2 = self.odb.parse_commit(side2)?.tree;
        self.merge_trees_at_depth(base_tree, tree1, tree2, opts, depth)
    }

    fn merge_trees_at_depth(
        &mut self,
        base: Option<Oid>,
        side1: Oid,
        side2: Oid,
        opts: &MergeOpts,
        depth: usize,
    ) -> OrtResult<MergeOutcome> {
        // trivial resolutions that need no walk at all
        let quick = if side1 == side2 {
            Some(side1)
        } else if base == Some(side1) {
            Some(side2)
        } else if base == Some(side2) {
            Some(side1)
        } else {
            None
        };
        if let Some(tree) = quick {
            self.cache.valid_side = CacheValidity::None;
            return Ok(MergeOutcome { tree, clean: true, unmerged: vec![], messages: IndexMap::new() });
        }

        let mut ctxt = MergeCtxt::new(self.odb, opts, &mut self.cache, depth);
        let outcome = ctxt.merge([base, Some(side1), Some(side2)]);
        // validity is a per-merge assertion; the cache contents live on
        self.cache.valid_side = CacheValidity::None;
        outcome
    }
}

/// All the shared mutable state of one merge invocation. Dropped wholesale
/// when the merge finishes; only the rename cache it borrows survives.
pub(crate) struct MergeCtxt<'a> {
    odb: &'a dyn Odb,
    opts: &'a MergeOpts,
    cache: &'a mut RenameCache,
    call_depth: usize,
    marker_size: usize,
    paths: PathMap,
    renames: [SideRenames; 2],
    messages: IndexMap<OrtPath, String>,
    unmerged_paths: Vec<OrtPath>,
    /// set by diagnostics (directory rename splits) that mark the merge
    /// unclean without leaving stages behind
    forced_unclean: bool,
    redo_after_renames: bool,
    redone: bool,
}

impl<'a> MergeCtxt<'a> {
    fn new(odb: &'a dyn Odb, opts: &'a MergeOpts, cache: &'a mut RenameCache, call_depth: usize) -> Self {
        Self {
            odb,
            opts,
            cache,
            call_depth,
            marker_size: xdiff::DEFAULT_MARKER_SIZE + 2 * call_depth,
            paths: PathMap::default(),
            renames: Default::default(),
            messages: IndexMap::new(),
            unmerged_paths: vec![],
            forced_unclean: false,
            redo_after_renames: false,
            redone: false,
        }
    }

    fn merge(&mut self, trees: [Option<Oid>; 3]) -> OrtResult<MergeOutcome> {
        self.collect_merge_info(trees)?;

        if self.redo_after_renames {
            // populate the rename cache from what we have, then restart the
            // collection with it so irrelevant sources get skipped this time
            for side in MergeSide::BOTH {
                self.detect_regular_renames(side)?;
            }
            self.restart_collection();
            self.collect_merge_info(trees)?;
        }

        self.detect_and_process_renames()?;
        let tree = self.process_entries()?;

        let mut unmerged = vec![];
        self.unmerged_paths.sort();
        self.unmerged_paths.dedup();
        for path in &self.unmerged_paths {
            let info = &self.paths[path];
            debug_assert!(!info.clean);
            for role in 0..3 {
                if info.filemask & (1 << role) == 0 {
                    continue;
                }
                let version = info.stages[role];
                let mode = match version.mode {
                    Some(mode) => mode,
                    None => bug!("present stage {} of `{}` has no mode", role, path),
                };
                unmerged.push(UnmergedEntry {
                    path: *path,
                    stage: MergeStage::from_role(role),
                    mode,
                    oid: version.oid,
                });
            }
        }

        let clean = !self.forced_unclean
            && unmerged.is_empty()
            && self.paths.values().all(|info| info.clean);
        info!(
            "merge finished: tree {}, clean: {}, {} unmerged entries",
            tree,
            clean,
            unmerged.len()
        );
        Ok(MergeOutcome { tree, clean, unmerged, messages: std::mem::take(&mut self.messages) })
    }

    fn restart_collection(&mut self) {
        debug!("restarting merge-info collection with populated rename cache");
        self.paths.clear();
        self.renames = Default::default();
        self.unmerged_paths.clear();
        self.redo_after_renames = false;
        self.redone = true;
    }

    fn dir_rename_detection(&self) -> bool {
        self.opts.detect_directory_renames != DirRenameDetection::None
    }

    fn side_label(&self, side: MergeSide) -> &str {
        match side {
            MergeSide::Side1 => &self.opts.side1_label,
            MergeSide::Side2 => &self.opts.side2_label,
        }
    }

    fn side_label_for_role(&self, role: usize) -> &str {
        match role {
            MERGE_SIDE1 => &self.opts.side1_label,
            MERGE_SIDE2 => &self.opts.side2_label,
            MERGE_BASE => self.opts.ancestor_label.as_deref().unwrap_or("merged common ancestors"),
            _ => bug!("invalid role `{}`", role),
        }
    }

    fn path_msg(&mut self, path: OrtPath, msg: impl AsRef<str>) {
        let buf = self.messages.entry(path).or_insert_with(String::new);
        buf.push_str(msg.as_ref());
        buf.push('\n');
    }
}
