use crate::error::OrtResult;
use crate::obj::{FileMode, Oid, Tree, TreeEntry};
use crate::odb::{MemOdb, Odb};
use crate::path::OrtPath;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::ops::Range;

/// one entry of a declaratively-built tree
#[derive(Debug, Clone)]
pub enum TestEnt {
    File(&'static str),
    Exec(&'static str),
    Link(&'static str),
    Gitlink(Oid),
}

impl TestEnt {
    fn mode(&self) -> FileMode {
        match self {
            TestEnt::File(_) => FileMode::REG,
            TestEnt::Exec(_) => FileMode::EXEC,
            TestEnt::Link(_) => FileMode::LINK,
            TestEnt::Gitlink(_) => FileMode::GITLINK,
        }
    }
}

/// Write a whole tree of blobs into the store from `path -> content` pairs.
pub fn build_tree(odb: &MemOdb, files: &[(&str, &str)]) -> Oid {
    let ents: Vec<(String, TestEnt)> = files
        .iter()
        .map(|&(path, content)| {
            // contents get leaked so the helper enum can stay `&'static`;
            // only tests pay for this
            (path.to_owned(), TestEnt::File(Box::leak(content.to_owned().into_boxed_str())))
        })
        .collect();
    build_tree_ents(odb, &ents)
}

pub fn build_tree_ents(odb: &MemOdb, files: &[(String, TestEnt)]) -> Oid {
    let flat: BTreeMap<String, TestEnt> =
        files.iter().map(|(path, ent)| (path.clone(), ent.clone())).collect();
    write_nested(odb, &flat).expect("failed to build test tree")
}

fn write_nested(odb: &MemOdb, flat: &BTreeMap<String, TestEnt>) -> OrtResult<Oid> {
    let mut tree = Tree::default();
    let mut subdirs: BTreeMap<String, BTreeMap<String, TestEnt>> = BTreeMap::new();
    for (path, ent) in flat {
        match path.split_once('/') {
            Some((dir, rest)) => {
                subdirs.entry(dir.to_owned()).or_default().insert(rest.to_owned(), ent.clone());
            }
            None => {
                let oid = match ent {
                    TestEnt::File(content) | TestEnt::Exec(content) | TestEnt::Link(content) =>
                        odb.write_blob(content.as_bytes().to_vec())?,
                    TestEnt::Gitlink(oid) => *oid,
                };
                tree.entries.insert(TreeEntry { mode: ent.mode(), name: OrtPath::intern(path), oid });
            }
        }
    }
    for (dir, entries) in subdirs {
        let oid = write_nested(odb, &entries)?;
        tree.entries.insert(TreeEntry { mode: FileMode::TREE, name: OrtPath::intern(dir), oid });
    }
    odb.write_tree(&tree)
}

/// Flatten a stored tree back into sorted `path -> content` pairs; gitlinks
/// render as their commit id, symlinks as their target.
pub fn flatten_tree(odb: &MemOdb, oid: Oid) -> Vec<(String, String)> {
    let mut out = vec![];
    flatten_into(odb, oid, "", &mut out);
    out.sort();
    out
}

fn flatten_into(odb: &MemOdb, oid: Oid, prefix: &str, out: &mut Vec<(String, String)>) {
    let tree = odb.read_tree(oid).expect("failed to read tree");
    for entry in &tree.entries {
        let path = if prefix.is_empty() {
            entry.name.as_str().to_owned()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        match entry.mode {
            FileMode::TREE => flatten_into(odb, entry.oid, &path, out),
            FileMode::GITLINK => out.push((path, entry.oid.to_string())),
            _ => {
                let bytes = odb.read_blob(entry.oid).expect("failed to read blob");
                out.push((path, String::from_utf8_lossy(&bytes).into_owned()));
            }
        }
    }
}

pub fn tree_paths(odb: &MemOdb, oid: Oid) -> Vec<String> {
    flatten_tree(odb, oid).into_iter().map(|(path, _)| path).collect()
}

pub fn generate_random_string(range: Range<usize>) -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(range);
    (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// `tree_in!(odb: "a/foo" => "one\n", "b" => "two\n")`
macro_rules! tree_in {
    ($odb:ident) => {
        $crate::test_utils::build_tree(&$odb, &[])
    };
    ($odb:ident: $($path:literal => $content:expr),+ $(,)?) => {
        $crate::test_utils::build_tree(&$odb, &[$(($path, $content)),+])
    };
}
