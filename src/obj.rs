use crate::error::{OrtError, OrtGenericError, OrtResult};
use crate::hash::OID_SIZE;
use crate::path::OrtPath;
use num_enum::TryFromPrimitive;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::Write;
use std::str::FromStr;

pub use crate::hash::Oid;

#[derive(Copy, PartialEq, Eq, Clone, TryFromPrimitive, PartialOrd, Ord, Hash)]
#[repr(u32)]
// the derived `Ord` follows the numeric mode values, so `TREE` (0o40000)
// sorts below every blob variant; entry ordering within a tree does not rely
// on it, see `TreeEntry::cmp`
pub enum FileMode {
    REG     = 0o100644,
    EXEC    = 0o100755,
    LINK    = 0o120000,
    TREE    = 0o40000,
    GITLINK = 0o160000,
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let n = self.as_u32();
        if f.alternate() { write!(f, "{:o}", n) } else { write!(f, "{:06o}", n) }
    }
}

impl Debug for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FileMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_link(self) -> bool {
        matches!(self, FileMode::LINK)
    }

    pub fn is_file(self) -> bool {
        matches!(self, FileMode::EXEC | FileMode::REG)
    }

    pub fn is_blob(self) -> bool {
        matches!(self, FileMode::EXEC | FileMode::REG | FileMode::LINK)
    }

    pub fn is_tree(self) -> bool {
        matches!(self, FileMode::TREE)
    }

    pub fn is_gitlink(self) -> bool {
        matches!(self, FileMode::GITLINK)
    }

    pub fn new(u: u32) -> OrtResult<Self> {
        Self::try_from(u).map_err(|_| anyhow!("invalid filemode `{:06o}`", u))
    }

    /// object-type conflicts (regular vs symlink vs submodule) are a distinct
    /// conflict class from permission differences, so compare by type
    pub fn same_object_type(self, other: Self) -> bool {
        match (self, other) {
            (FileMode::REG | FileMode::EXEC, FileMode::REG | FileMode::EXEC) => true,
            _ => self == other,
        }
    }

    pub fn infer_obj_kind(self) -> ObjKind {
        match self {
            Self::TREE => ObjKind::Tree,
            Self::EXEC | Self::REG | Self::LINK => ObjKind::Blob,
            Self::GITLINK => ObjKind::Commit,
        }
    }
}

impl FromStr for FileMode {
    type Err = OrtGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(u32::from_str_radix(s, 8)?)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjKind {
    Blob,
    Tree,
    Commit,
}

impl ObjKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjKind::Blob => "blob",
            ObjKind::Tree => "tree",
            ObjKind::Commit => "commit",
        }
    }
}

impl Display for ObjKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct TreeEntry {
    pub mode: FileMode,
    /// basename within the containing tree
    pub name: OrtPath,
    pub oid: Oid,
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    // entries sort with a virtual trailing slash on directory names,
    // i.e. `index.rs` < `index/`; the slash is not stored in the entry itself
    fn cmp(&self, other: &Self) -> Ordering {
        fn name_byte(entry: &TreeEntry, i: usize) -> Option<u8> {
            let bytes = entry.name.as_bytes();
            match i.cmp(&bytes.len()) {
                Ordering::Less => Some(bytes[i]),
                Ordering::Equal if entry.mode.is_tree() => Some(b'/'),
                _ => None,
            }
        }

        for i in 0.. {
            match (name_byte(self, i), name_byte(other, i)) {
                (None, None) => break,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) => match x.cmp(&y) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
            }
        }
        // keep the ordering consistent with `Eq`
        self.mode.as_u32().cmp(&other.mode.as_u32()).then_with(|| self.oid.cmp(&other.oid))
    }
}

#[derive(PartialEq, Debug, Default, Clone)]
pub struct Tree {
    pub entries: BTreeSet<TreeEntry>,
}

impl Tree {
    pub fn serialize(&self, writer: &mut dyn Write) -> OrtResult<()> {
        for entry in &self.entries {
            // use the alternate display impl to not pad an extra 0
            write!(writer, "{:#}", entry.mode)?;
            writer.write_all(b" ")?;
            writer.write_all(entry.name.as_bytes())?;
            writer.write_all(b"\0")?;
            writer.write_all(entry.oid.as_bytes())?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> OrtResult<Vec<u8>> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        Ok(bytes)
    }

    pub fn deserialize(oid: Oid, bytes: &[u8]) -> OrtResult<Self> {
        let mut tree = Self::default();
        let mut rest = bytes;
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or(OrtError::MalformedTree(oid))?;
            let mode = std::str::from_utf8(&rest[..space])
                .ok()
                .and_then(|s| FileMode::from_str(s).ok())
                .ok_or(OrtError::MalformedTree(oid))?;
            rest = &rest[space + 1..];

            let nul = rest.iter().position(|&b| b == b'\0').ok_or(OrtError::MalformedTree(oid))?;
            let name = OrtPath::from_bytes(&rest[..nul]).map_err(|_| OrtError::MalformedTree(oid))?;
            rest = &rest[nul + 1..];

            if rest.len() < OID_SIZE {
                bail!(OrtError::MalformedTree(oid));
            }
            let mut hash = [0u8; OID_SIZE];
            hash.copy_from_slice(&rest[..OID_SIZE]);
            rest = &rest[OID_SIZE..];

            tree.entries.insert(TreeEntry { mode, name, oid: Oid::new(hash) });
        }
        Ok(tree)
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct Commit {
    pub tree: Oid,
    pub parents: SmallVec<[Oid; 2]>,
    /// commit timestamp, used to order the merge-base walk
    pub time: i64,
    pub message: String,
}

impl Commit {
    pub fn serialize(&self, writer: &mut dyn Write) -> OrtResult<()> {
        writeln!(writer, "tree {}", self.tree)?;
        for parent in &self.parents {
            writeln!(writer, "parent {}", parent)?;
        }
        writeln!(writer, "time {}", self.time)?;
        writeln!(writer)?;
        write!(writer, "{}", self.message)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> OrtResult<Vec<u8>> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        Ok(bytes)
    }

    pub fn deserialize(oid: Oid, bytes: &[u8]) -> OrtResult<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| OrtError::MalformedCommit(oid))?;
        let mut tree = None;
        let mut parents = smallvec![];
        let mut time = 0;
        let mut lines = text.lines();
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            let (field, value) = line.split_once(' ').ok_or(OrtError::MalformedCommit(oid))?;
            match field {
                "tree" => tree = Some(Oid::from_str(value).map_err(|_| OrtError::MalformedCommit(oid))?),
                "parent" => parents.push(Oid::from_str(value).map_err(|_| OrtError::MalformedCommit(oid))?),
                "time" => time = value.parse().map_err(|_| OrtError::MalformedCommit(oid))?,
                _ => bail!(OrtError::MalformedCommit(oid)),
            }
        }
        let message = lines.collect::<Vec<_>>().join("\n");
        Ok(Self { tree: tree.ok_or(OrtError::MalformedCommit(oid))?, parents, time, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_entry_ordering_sorts_files_before_directories() {
        let file = |name: &str| TreeEntry { mode: FileMode::REG, name: OrtPath::intern(name), oid: Oid::UNKNOWN };
        let dir = |name: &str| TreeEntry { mode: FileMode::TREE, name: OrtPath::intern(name), oid: Oid::UNKNOWN };

        let mut tree = Tree::default();
        tree.entries.insert(dir("foo"));
        tree.entries.insert(file("foo.txt"));
        tree.entries.insert(file("bar"));

        let names: Vec<_> = tree.entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "foo.txt", "foo"]);
    }

    #[test]
    fn serialize_then_deserialize_tree() -> OrtResult<()> {
        let mut tree = Tree::default();
        tree.entries.insert(TreeEntry {
            mode: FileMode::REG,
            name: OrtPath::intern("hello.txt"),
            oid: Oid::EMPTY_TREE,
        });
        tree.entries.insert(TreeEntry {
            mode: FileMode::TREE,
            name: OrtPath::intern("sub"),
            oid: Oid::EMPTY_TREE,
        });
        let bytes = tree.to_bytes()?;
        let parsed = Tree::deserialize(Oid::UNKNOWN, &bytes)?;
        assert_eq!(tree, parsed);
        Ok(())
    }

    #[test]
    fn serialize_then_deserialize_commit() -> OrtResult<()> {
        let commit = Commit {
            tree: Oid::EMPTY_TREE,
            parents: smallvec![Oid::EMPTY_TREE],
            time: 42,
            message: "some subject\n\nsome body".to_owned(),
        };
        let bytes = commit.to_bytes()?;
        let parsed = Commit::deserialize(Oid::UNKNOWN, &bytes)?;
        assert_eq!(commit, parsed);
        Ok(())
    }
}
