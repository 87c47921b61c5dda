use crate::obj::{FileMode, Oid};
use crate::path::OrtPath;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt::{self, Display, Formatter};

/// role indices into stage triples: 0 = merge base, 1 = side1 ("ours"), 2 = side2 ("theirs")
pub const MERGE_BASE: usize = 0;
pub const MERGE_SIDE1: usize = 1;
pub const MERGE_SIDE2: usize = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeSide {
    Side1,
    Side2,
}

impl MergeSide {
    pub const BOTH: [MergeSide; 2] = [MergeSide::Side1, MergeSide::Side2];

    /// role index (1 or 2)
    #[inline]
    pub fn role(self) -> usize {
        match self {
            MergeSide::Side1 => MERGE_SIDE1,
            MergeSide::Side2 => MERGE_SIDE2,
        }
    }

    /// index into per-side arrays (0 or 1)
    #[inline]
    pub fn ix(self) -> usize {
        self.role() - 1
    }

    /// this side's bit in a 3-bit role mask (2 or 4)
    #[inline]
    pub fn mask(self) -> u8 {
        1 << self.role()
    }

    #[inline]
    pub fn other(self) -> MergeSide {
        match self {
            MergeSide::Side1 => MergeSide::Side2,
            MergeSide::Side2 => MergeSide::Side1,
        }
    }
}

/// the unmerged-entry index convention: stage N holds role N-1
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MergeStage {
    Base = 1,
    Ours = 2,
    Theirs = 3,
}

impl MergeStage {
    pub fn from_role(role: usize) -> Self {
        match role {
            MERGE_BASE => MergeStage::Base,
            MERGE_SIDE1 => MergeStage::Ours,
            MERGE_SIDE2 => MergeStage::Theirs,
            _ => bug!("invalid role `{}`", role),
        }
    }
}

impl Display for MergeStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// object id + mode; `mode: None` means the path is absent in that version
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub oid: Oid,
    pub mode: Option<FileMode>,
}

impl VersionInfo {
    pub const NULL: Self = Self { oid: Oid::UNKNOWN, mode: None };

    pub fn new(oid: Oid, mode: FileMode) -> Self {
        Self { oid, mode: Some(mode) }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.mode.is_none()
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::NULL
    }
}

/// Per-path record in the path map. One record serves both the unresolved and
/// the resolved life stages: while `clean` is false the stage triple and masks
/// describe the three-way state, once `clean` flips the `result` is
/// authoritative and the rest is history.
#[derive(Debug, Clone)]
pub struct PathInfo {
    /// interned key of the containing directory; pointer-comparable against
    /// other records' directory names
    pub directory_name: OrtPath,
    /// where the basename starts inside the full path
    pub basename_offset: usize,
    pub result: VersionInfo,
    pub clean: bool,

    /// versions per role
    pub stages: [VersionInfo; 3],
    /// path per role; these diverge when a rename contributed a stage
    pub pathnames: [OrtPath; 3],
    /// bit i set iff role i contributes a file (blob or gitlink) here
    pub filemask: u8,
    /// bit i set iff role i contributes a directory here
    pub dirmask: u8,
    /// pairwise equality of (mode, oid) between roles, encoded
    /// {3: base==side1, 5: base==side2, 6: side1==side2, 7: all}
    pub match_mask: u8,
    /// a file on one role collides with a directory on another
    pub df_conflict: bool,
    /// a rename-level naming dispute involves this path
    pub path_conflict: bool,
}

impl PathInfo {
    pub fn new(path: OrtPath) -> Self {
        let directory_name = path.parent().unwrap_or(OrtPath::EMPTY);
        Self {
            directory_name,
            basename_offset: path.basename_offset(),
            result: VersionInfo::NULL,
            clean: false,
            stages: [VersionInfo::NULL; 3],
            pathnames: [path; 3],
            filemask: 0,
            dirmask: 0,
            match_mask: 0,
            df_conflict: false,
            path_conflict: false,
        }
    }

    pub fn resolved(path: OrtPath, result: VersionInfo) -> Self {
        Self { result, clean: true, ..Self::new(path) }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.result.is_null()
    }

    /// the basename slice of this record's key path
    pub fn basename(&self, path: OrtPath) -> &'static str {
        &path.as_str()[self.basename_offset..]
    }
}

pub type PathMap = FxHashMap<OrtPath, PathInfo>;

/// why a rename source must be fed to the similarity detector
pub const RELEVANT_CONTENT: u8 = 1;
pub const RELEVANT_LOCATION: u8 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PairStatus {
    Add,
    Delete,
    Rename,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: OrtPath,
    pub oid: Oid,
    pub mode: FileMode,
}

/// a candidate or classified diff pair for one side; `one` is the old
/// (base-side) file, `two` the new one
#[derive(Debug, Clone)]
pub struct DiffPair {
    pub one: Option<FileSpec>,
    pub two: Option<FileSpec>,
    pub status: PairStatus,
    /// similarity score in [0, MAX_SIMILARITY_SCORE], meaningful for renames
    pub score: u32,
}

impl DiffPair {
    pub fn added(two: FileSpec) -> Self {
        Self { one: None, two: Some(two), status: PairStatus::Add, score: 0 }
    }

    pub fn deleted(one: FileSpec) -> Self {
        Self { one: Some(one), two: None, status: PairStatus::Delete, score: 0 }
    }

    pub fn src(&self) -> &FileSpec {
        self.one.as_ref().unwrap_or_else(|| bug!("pair has no source"))
    }

    pub fn dst(&self) -> &FileSpec {
        self.two.as_ref().unwrap_or_else(|| bug!("pair has no destination"))
    }
}

/// a subtree parked by the collector because one side matched the base and
/// recursing may turn out to be unnecessary
#[derive(Debug, Clone)]
pub struct DeferredDir {
    pub dir: OrtPath,
    pub trees: [Option<Oid>; 3],
    pub dir_rename_mask: u8,
}

/// per-side rename state for a single merge
#[derive(Debug, Default)]
pub struct SideRenames {
    /// candidate add/delete pairs in traversal order, refined in place by detection
    pub pairs: Vec<DiffPair>,
    /// sources worth detecting, and why (RELEVANT_* bits)
    pub relevant_sources: FxHashMap<OrtPath, u8>,
    /// directories present in the base but gone on this side; the flag records
    /// whether full rename-source reconstruction was required when we saw it
    pub dirs_removed: FxHashMap<OrtPath, bool>,
    /// old directory -> (new directory -> number of renamed files that moved that way)
    pub dir_rename_count: FxHashMap<OrtPath, FxHashMap<OrtPath, u32>>,
    /// subtrees deferred because this side was the only one to change them
    pub deferred: Vec<DeferredDir>,
    /// directories known to receive renames
    pub target_dirs: FxHashSet<OrtPath>,
    /// collapsed directory renames, old -> new
    pub dir_renames: FxHashMap<OrtPath, OrtPath>,
    /// set once the rename limit was hit; trivial-merge deferral distrusts the
    /// incomplete rename information from then on
    pub limit_hit: bool,
}

/// which side(s) of the cross-merge rename cache may be trusted
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheValidity {
    None,
    Side(MergeSide),
    /// both sides; only used internally while redoing the collection phase
    Both,
}

impl CacheValidity {
    pub fn covers(self, side: MergeSide) -> bool {
        match self {
            CacheValidity::None => false,
            CacheValidity::Side(valid) => valid == side,
            CacheValidity::Both => true,
        }
    }
}

impl Default for CacheValidity {
    fn default() -> Self {
        CacheValidity::None
    }
}

/// Rename results that survive from one merge to the next in a sequence
/// (cherry-pick, rebase). Everything else about a merge dies with it.
#[derive(Debug, Default)]
pub struct RenameCache {
    /// old path -> Some(new path) for a rename, None for a plain deletion
    pub cached_pairs: [FxHashMap<OrtPath, Option<OrtPath>>; 2],
    /// deletions that weren't relevant to anything last time
    pub cached_irrelevant: [FxHashSet<OrtPath>; 2],
    /// directories that received renames last time
    pub cached_target_names: [FxHashSet<OrtPath>; 2],
    pub valid_side: CacheValidity,
}

impl RenameCache {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn clear_side(&mut self, side: MergeSide) {
        self.cached_pairs[side.ix()].clear();
        self.cached_irrelevant[side.ix()].clear();
        self.cached_target_names[side.ix()].clear();
    }
}

/// the conventional three-stage index projection of an unresolved path
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnmergedEntry {
    pub path: OrtPath,
    pub stage: MergeStage,
    pub mode: FileMode,
    pub oid: Oid,
}
