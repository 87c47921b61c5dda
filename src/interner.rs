use crate::path::OrtPath;
use bumpalo::Bump as Arena;
use rustc_hash::FxHashMap;
use std::cell::RefCell;

// This interner deals with plain `str` rather than `Path` to avoid normalization issues:
// trailing slashes and embedded "." components must stay significant.
#[derive(Default)]
pub(crate) struct Interner {
    arena: Arena,
    map: FxHashMap<&'static str, OrtPath>,
}

impl Interner {
    pub fn intern_path(&mut self, s: &str) -> OrtPath {
        if let Some(&path) = self.map.get(s) {
            return path;
        }
        let ptr: &str = self.arena.alloc_str(s);
        // SAFETY it is safe to cast to &'static as we only hand it out while the
        // thread-local arena containing it is alive
        let interned = unsafe { &*(ptr as *const str) };
        let path = OrtPath::new(interned);
        self.map.insert(interned, path);
        path
    }
}

thread_local! {
    static INTERNER: RefCell<Interner> = RefCell::new(Interner::default());
}

pub(crate) fn with_path_interner<R>(f: impl FnOnce(&mut Interner) -> R) -> R {
    INTERNER.with(|interner| f(&mut *interner.borrow_mut()))
}
