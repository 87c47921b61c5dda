use crate::error::{OrtError, OrtResult};
use crate::obj::{Commit, ObjKind, Oid, Tree};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// The object-store operations the merge engine needs. Everything else about
/// the store (encoding, packing, caching) is the implementor's business.
///
/// The engine only ever reads trees, blobs and commits, and writes the blobs
/// and trees produced by content merging and tree reconstruction.
pub trait Odb {
    fn read_tree(&self, oid: Oid) -> OrtResult<Tree>;

    fn read_blob(&self, oid: Oid) -> OrtResult<Vec<u8>>;

    fn parse_commit(&self, oid: Oid) -> OrtResult<Commit>;

    fn write_object(&self, kind: ObjKind, bytes: Vec<u8>) -> OrtResult<Oid>;

    fn write_blob(&self, bytes: Vec<u8>) -> OrtResult<Oid> {
        self.write_object(ObjKind::Blob, bytes)
    }

    fn write_tree(&self, tree: &Tree) -> OrtResult<Oid> {
        self.write_object(ObjKind::Tree, tree.to_bytes()?)
    }

    fn write_commit(&self, commit: &Commit) -> OrtResult<Oid> {
        self.write_object(ObjKind::Commit, commit.to_bytes()?)
    }
}

/// In-memory object store. Also what the tests merge against.
#[derive(Default)]
pub struct MemOdb {
    objects: RefCell<FxHashMap<Oid, (ObjKind, Vec<u8>)>>,
}

impl MemOdb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.objects.borrow().contains_key(&oid)
    }

    fn read_raw(&self, oid: Oid, expected: ObjKind) -> OrtResult<Vec<u8>> {
        match self.objects.borrow().get(&oid) {
            Some((kind, bytes)) if *kind == expected => Ok(bytes.clone()),
            Some((kind, _)) => Err(anyhow!("object `{}` is a {}, expected {}", oid, kind, expected)),
            None => Err(anyhow!(OrtError::ObjectMissing(oid))),
        }
    }
}

impl Odb for MemOdb {
    fn read_tree(&self, oid: Oid) -> OrtResult<Tree> {
        let bytes = self.read_raw(oid, ObjKind::Tree)?;
        Tree::deserialize(oid, &bytes)
    }

    fn read_blob(&self, oid: Oid) -> OrtResult<Vec<u8>> {
        self.read_raw(oid, ObjKind::Blob)
    }

    fn parse_commit(&self, oid: Oid) -> OrtResult<Commit> {
        let bytes = self.read_raw(oid, ObjKind::Commit)?;
        Commit::deserialize(oid, &bytes)
    }

    fn write_object(&self, kind: ObjKind, bytes: Vec<u8>) -> OrtResult<Oid> {
        let oid = Oid::hash_obj(kind.as_str(), &bytes);
        self.objects.borrow_mut().insert(oid, (kind, bytes));
        Ok(oid)
    }
}

bitflags! {
    #[derive(Default)]
    struct NodeFlags: u8 {
        const PARENT1 = 1 << 0;
        const PARENT2 = 1 << 1;
        const RESULT = 1 << 2;
        const STALE = 1 << 3;
    }
}

#[derive(Debug)]
struct CommitNode {
    oid: Oid,
    time: i64,
    parents: smallvec::SmallVec<[Oid; 2]>,
    index: usize,
}

impl PartialEq for CommitNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CommitNode {
}

impl PartialOrd for CommitNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitNode {
    // we want this cmp to suit a maxheap:
    // the most recent (largest timestamp) commit should be >= and ties go to the smallest index
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time).then_with(|| other.index.cmp(&self.index))
    }
}

struct MergeBaseCtxt<'o> {
    odb: &'o dyn Odb,
    candidates: Vec<Oid>,
    pqueue: BinaryHeap<CommitNode>,
    node_flags: FxHashMap<Oid, NodeFlags>,
    index: usize,
}

impl<'o> MergeBaseCtxt<'o> {
    fn still_interesting(&self) -> bool {
        // interesting if the pqueue still contains any non-stale nodes;
        // otherwise everything will be stale from here on so we can stop
        self.pqueue.iter().any(|node| !self.node_flags[&node.oid].contains(NodeFlags::STALE))
    }

    fn mk_node(&mut self, oid: Oid) -> OrtResult<CommitNode> {
        let commit = self.odb.parse_commit(oid)?;
        let index = self.index;
        self.index += 1;
        Ok(CommitNode { oid, time: commit.time, parents: commit.parents, index })
    }

    fn merge_bases_all(mut self, a: Oid, b: Oid) -> OrtResult<Vec<Oid>> {
        self.build_candidates(a, b)?;
        let node_flags = &self.node_flags;
        self.candidates.retain(|oid| !node_flags[oid].contains(NodeFlags::STALE));
        Ok(self.candidates)
    }

    fn build_candidates(&mut self, a: Oid, b: Oid) -> OrtResult<()> {
        for (oid, flags) in [(a, NodeFlags::PARENT1), (b, NodeFlags::PARENT2)] {
            let node = self.mk_node(oid)?;
            self.node_flags.entry(oid).or_default().insert(flags);
            self.pqueue.push(node);
        }

        while self.still_interesting() {
            let node = match self.pqueue.pop() {
                Some(node) => node,
                None => break,
            };

            let flags = self.node_flags.get_mut(&node.oid).unwrap();
            // unset the result bit, as we don't want to propagate the result flag
            let mut parent_flags = *flags & !NodeFlags::RESULT;

            if flags.contains(NodeFlags::PARENT1 | NodeFlags::PARENT2) {
                // parent nodes of a potential result node are stale and can be ruled out of the candidate set
                parent_flags.insert(NodeFlags::STALE);
                if !flags.intersects(NodeFlags::RESULT | NodeFlags::STALE) {
                    flags.insert(NodeFlags::RESULT);
                    self.candidates.push(node.oid);
                }
            }

            for &parent in &node.parents {
                let pflags = self.node_flags.entry(parent).or_default();
                if *pflags == parent_flags {
                    continue;
                }
                pflags.insert(parent_flags);
                let parent_node = self.mk_node(parent)?;
                self.pqueue.push(parent_node);
            }
        }
        Ok(())
    }
}

/// All best common ancestors of `a` and `b`, most recent first.
pub fn merge_bases(odb: &dyn Odb, a: Oid, b: Oid) -> OrtResult<Vec<Oid>> {
    MergeBaseCtxt {
        odb,
        candidates: Default::default(),
        pqueue: Default::default(),
        node_flags: Default::default(),
        index: Default::default(),
    }
    .merge_bases_all(a, b)
}

/// Is `ancestor` reachable from `descendant` (equality counts)?
pub fn in_merge_bases(odb: &dyn Odb, ancestor: Oid, descendant: Oid) -> OrtResult<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    Ok(merge_bases(odb, ancestor, descendant)?.contains(&ancestor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrtResultExt;

    fn commit(odb: &MemOdb, time: i64, parents: &[Oid]) -> Oid {
        let commit = Commit {
            tree: Oid::EMPTY_TREE,
            parents: parents.iter().copied().collect(),
            time,
            message: "generated commit".to_owned(),
        };
        odb.write_commit(&commit).unwrap()
    }

    #[test]
    fn missing_object_reads_are_typed_errors() {
        let odb = MemOdb::new();
        assert!(odb.read_blob(Oid::EMPTY_TREE).is_object_missing_err());
    }

    /// a - b - c
    ///      \
    ///       d
    #[test]
    fn simple_merge_base() -> OrtResult<()> {
        let odb = MemOdb::new();
        let a = commit(&odb, 1, &[]);
        let b = commit(&odb, 2, &[a]);
        let c = commit(&odb, 3, &[b]);
        let d = commit(&odb, 4, &[b]);

        assert_eq!(merge_bases(&odb, c, d)?, vec![b]);
        assert!(in_merge_bases(&odb, b, c)?);
        assert!(in_merge_bases(&odb, a, d)?);
        assert!(!in_merge_bases(&odb, c, d)?);
        Ok(())
    }

    // a - c
    //   X
    // b - d
    #[test]
    fn criss_cross_merge_bases() -> OrtResult<()> {
        let odb = MemOdb::new();
        let a = commit(&odb, 1, &[]);
        let b = commit(&odb, 2, &[]);
        let c = commit(&odb, 3, &[a, b]);
        let d = commit(&odb, 4, &[a, b]);

        let bases = merge_bases(&odb, c, d)?;
        assert_eq!(bases.len(), 2);
        assert!(bases.contains(&a));
        assert!(bases.contains(&b));
        Ok(())
    }
}
