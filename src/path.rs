use crate::error::OrtResult;
use crate::interner::with_path_interner;
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

/// An interned utf-8 path.
///
/// Interning gives us a `Copy` representation and, more importantly, the
/// guarantee that equal path strings are the same allocation: directory
/// identity checks are pointer compares (see [`OrtPath::ptr_eq`]).
/// Paths are relative, `/`-separated, and never begin or end with a slash;
/// the empty path denotes the root directory.
#[derive(Eq, Clone, Copy)]
pub struct OrtPath {
    path: &'static str,
}

impl OrtPath {
    pub const EMPTY: Self = Self { path: "" };

    pub(crate) const fn new(path: &'static str) -> Self {
        Self { path }
    }

    #[inline]
    pub fn intern(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        if s.is_empty() {
            return Self::EMPTY;
        }
        with_path_interner(|interner| interner.intern_path(s))
    }

    pub fn from_bytes(bytes: &[u8]) -> OrtResult<Self> {
        let s = std::str::from_utf8(bytes)?;
        Ok(Self::intern(s))
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        self.path
    }

    #[inline]
    pub fn as_bytes(self) -> &'static [u8] {
        self.path.as_bytes()
    }

    #[inline]
    pub fn len(self) -> usize {
        self.path.len()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.path.is_empty()
    }

    /// true iff `self` and `other` are the same interned allocation
    // this is an integer compare; sound because equal strings intern to one allocation
    #[inline]
    pub fn ptr_eq(self, other: Self) -> bool {
        std::ptr::eq(self.path, other.path)
    }

    #[inline]
    pub fn join(self, name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        if self.is_empty() { Self::intern(name) } else { Self::intern(format!("{}/{}", self.path, name)) }
    }

    /// the containing directory: `a/b/c` -> `a/b`, `a` -> `` (root), `` -> None
    pub fn parent(self) -> Option<Self> {
        if self.is_empty() {
            return None;
        }
        match self.path.rfind('/') {
            Some(idx) => Some(Self::intern(&self.path[..idx])),
            None => Some(Self::EMPTY),
        }
    }

    /// byte offset of the basename within the full path
    pub fn basename_offset(self) -> usize {
        self.path.rfind('/').map(|idx| idx + 1).unwrap_or(0)
    }

    pub fn file_name(self) -> &'static str {
        &self.path[self.basename_offset()..]
    }

    /// true iff `self` lives strictly below the directory `dir`
    pub fn is_inside(self, dir: OrtPath) -> bool {
        if dir.is_empty() {
            return !self.is_empty();
        }
        self.path.len() > dir.path.len()
            && self.path.as_bytes()[dir.path.len()] == b'/'
            && self.path.starts_with(dir.path)
    }

    /// ancestor directories from the immediate parent up to (and including) the root
    pub fn ancestors(self) -> impl Iterator<Item = OrtPath> {
        let mut cur = self.parent();
        std::iter::from_fn(move || {
            let next = cur?;
            cur = next.parent();
            Some(next)
        })
    }

    /// The order in which resolution wants paths: compare byte-wise but with a
    /// virtual trailing '/' appended to both strings, so that a directory sorts
    /// immediately before its own contents (`foo.txt` < `foo` < `foo/bar`).
    /// This must not be replaced with a plain lexicographic sort.
    pub fn traversal_cmp(self, other: Self) -> Ordering {
        fn key_byte(s: &[u8], i: usize) -> Option<u8> {
            match i.cmp(&s.len()) {
                Ordering::Less => Some(s[i]),
                Ordering::Equal => Some(b'/'),
                Ordering::Greater => None,
            }
        }

        let a = self.as_bytes();
        let b = other.as_bytes();
        for i in 0.. {
            match (key_byte(a, i), key_byte(b, i)) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) => match x.cmp(&y) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
            }
        }
        unreachable!()
    }
}

impl PartialEq for OrtPath {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(*other) || self.path == other.path
    }
}

impl PartialEq<str> for OrtPath {
    fn eq(&self, other: &str) -> bool {
        self.path == other
    }
}

impl<'a> PartialEq<&'a str> for OrtPath {
    fn eq(&self, other: &&str) -> bool {
        self.path == *other
    }
}

impl Hash for OrtPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state)
    }
}

impl PartialOrd for OrtPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrtPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(other.path)
    }
}

impl AsRef<str> for OrtPath {
    fn as_ref(&self) -> &str {
        self.path
    }
}

impl Display for OrtPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl Debug for OrtPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::cmp::Ordering;

    #[test]
    fn interned_paths_share_an_allocation() {
        let a = OrtPath::intern(String::from("some/dir/file"));
        let b = OrtPath::intern("some/dir/file");
        assert!(a.ptr_eq(b));
        assert!(a.parent().unwrap().ptr_eq(OrtPath::intern("some/dir")));
    }

    #[test]
    fn parent_and_basename() {
        let p = OrtPath::intern("a/b/c.txt");
        assert_eq!(p.parent().unwrap(), "a/b");
        assert_eq!(p.file_name(), "c.txt");
        assert_eq!(p.basename_offset(), 4);

        let top = OrtPath::intern("a");
        assert_eq!(top.parent().unwrap(), OrtPath::EMPTY);
        assert_eq!(top.basename_offset(), 0);
        assert!(OrtPath::EMPTY.parent().is_none());
    }

    #[test]
    fn is_inside_directories() {
        let p = OrtPath::intern("a/b/c");
        assert!(p.is_inside(OrtPath::intern("a/b")));
        assert!(p.is_inside(OrtPath::intern("a")));
        assert!(p.is_inside(OrtPath::EMPTY));
        assert!(!p.is_inside(OrtPath::intern("a/b/c")));
        // not a path-component prefix
        assert!(!OrtPath::intern("ab/c").is_inside(OrtPath::intern("a")));
    }

    #[test]
    fn traversal_order_puts_directories_next_to_their_children() {
        let mut paths =
            vec!["foo/bar", "foo.txt", "foo", "bar", "foo/aaa"].into_iter().map(OrtPath::intern).collect::<Vec<_>>();
        paths.sort_by(|a, b| a.traversal_cmp(*b));
        let sorted: Vec<_> = paths.iter().map(|p| p.as_str()).collect();
        assert_eq!(sorted, vec!["bar", "foo.txt", "foo", "foo/aaa", "foo/bar"]);
    }

    #[quickcheck]
    fn traversal_cmp_is_antisymmetric(a: String, b: String) -> bool {
        let a = OrtPath::intern(a);
        let b = OrtPath::intern(b);
        match a.traversal_cmp(b) {
            Ordering::Equal => b.traversal_cmp(a) == Ordering::Equal && a == b,
            Ordering::Less => b.traversal_cmp(a) == Ordering::Greater,
            Ordering::Greater => b.traversal_cmp(a) == Ordering::Less,
        }
    }
}
