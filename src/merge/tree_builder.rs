//! Bottom-up tree object emission.
//!
//! Resolution hands us paths in an order where every directory immediately
//! follows its own contents; we keep a stack of open directories (`offsets`)
//! over a flat stack of pending entries (`versions`). Closing a directory
//! serializes its slice of `versions` into a tree object and replaces it with
//! a single entry in the parent's slice.

use super::state::VersionInfo;
use super::MergeCtxt;
use crate::error::OrtResult;
use crate::obj::{FileMode, Oid, Tree, TreeEntry};
use crate::path::OrtPath;

pub(super) struct TreeBuilder {
    /// (basename, version) of entries for the directories still open
    versions: Vec<(OrtPath, VersionInfo)>,
    /// (directory, start index into `versions`) for each open directory
    offsets: Vec<(OrtPath, usize)>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self { versions: vec![], offsets: vec![(OrtPath::EMPTY, 0)] }
    }

    pub fn push(&mut self, basename: OrtPath, version: VersionInfo) {
        debug_assert!(!version.is_null());
        self.versions.push((basename, version));
    }

    /// Close every open directory that does not contain `new_dir`, then open
    /// `new_dir` itself. Closed directories get their tree object written and
    /// their id recorded on their path-map record.
    pub fn change_directory(&mut self, ctxt: &mut MergeCtxt<'_>, new_dir: OrtPath) -> OrtResult<()> {
        loop {
            let &(top_dir, offset) = self.offsets.last().unwrap();
            if top_dir == new_dir {
                return Ok(());
            }
            if new_dir.is_inside(top_dir) {
                self.offsets.push((new_dir, self.versions.len()));
                return Ok(());
            }

            // close the innermost open directory
            self.offsets.pop();
            let segment = self.versions.split_off(offset);
            let tree_version = ctxt.write_tree_segment(segment)?;
            ctxt.record_closed_directory(top_dir, tree_version);

            let parent = match top_dir.parent() {
                Some(parent) => parent,
                None => bug!("attempted to close the root directory"),
            };
            let &(next_dir, _) = self.offsets.last().unwrap();
            if next_dir != parent {
                debug_assert!(parent.is_inside(next_dir) || next_dir.is_empty());
                self.offsets.push((parent, self.versions.len()));
            }
            if let Some(version) = tree_version {
                self.versions.push((OrtPath::intern(top_dir.file_name()), version));
            }
        }
    }

    pub fn finish(mut self, ctxt: &mut MergeCtxt<'_>) -> OrtResult<Oid> {
        self.change_directory(ctxt, OrtPath::EMPTY)?;
        debug_assert_eq!(self.offsets.len(), 1);
        let segment = std::mem::take(&mut self.versions);
        match ctxt.write_tree_segment(segment)? {
            Some(version) => Ok(version.oid),
            // the root tree is written even when the merge result is empty
            None => ctxt.odb.write_tree(&Tree::default()),
        }
    }
}

impl MergeCtxt<'_> {
    /// serialize one directory's worth of entries; empty directories are not
    /// emitted at all
    pub(super) fn write_tree_segment(
        &mut self,
        segment: Vec<(OrtPath, VersionInfo)>,
    ) -> OrtResult<Option<VersionInfo>> {
        if segment.is_empty() {
            return Ok(None);
        }
        let mut tree = Tree::default();
        for (name, version) in segment {
            let mode = match version.mode {
                Some(mode) => mode,
                None => bug!("null version pushed for `{}`", name),
            };
            tree.entries.insert(TreeEntry { mode, name, oid: version.oid });
        }
        let oid = self.odb.write_tree(&tree)?;
        Ok(Some(VersionInfo::new(oid, FileMode::TREE)))
    }

    pub(super) fn record_closed_directory(&mut self, dir: OrtPath, version: Option<VersionInfo>) {
        if let Some(info) = self.paths.get_mut(&dir) {
            info.result = version.unwrap_or(VersionInfo::NULL);
        } else {
            debug_assert!(dir.is_empty(), "closed directory `{}` has no record", dir);
        }
    }
}
