use std::any::Any;
use std::sync::Arc;

pub(crate) type ArcAny = Arc<dyn Any + Send + Sync>;

/// `Entry` is one `TVar`'s record inside a journal.
///
/// The entry remembers which value container the var held when the attempt
/// first touched it. The container's identity is the var's version: as long
/// as the var still holds that exact `Arc`, the entry is valid. Local writes
/// go to `new_value` and stay invisible to other threads until commit.
#[derive(Clone)]
pub(crate) struct Entry {
    /// Container observed on first touch. Compared by identity, never by
    /// value.
    pub expected: ArcAny,

    /// Tentative value after local writes. Identical to `expected` until
    /// the first write.
    pub new_value: ArcAny,

    /// The var was created by the running attempt. It cannot be seen by any
    /// other thread yet, so it needs neither validation care nor a wake-up
    /// registration.
    pub is_new: bool,

    /// A write happened; commit must publish `new_value`.
    pub is_changed: bool,
}

impl Entry {
    /// Entry for a var first touched by a read or write.
    pub fn first_touch(current: ArcAny) -> Entry {
        Entry {
            expected: current.clone(),
            new_value: current,
            is_new: false,
            is_changed: false,
        }
    }

    /// Entry for a var created inside the running attempt.
    pub fn created(current: ArcAny) -> Entry {
        Entry {
            expected: current.clone(),
            new_value: current,
            is_new: true,
            is_changed: false,
        }
    }

    /// Read the var as seen by this attempt.
    pub fn read(&self) -> ArcAny {
        self.new_value.clone()
    }

    /// Record a local write. The container was freshly allocated by the
    /// caller, so a later commit installs a distinct version even when the
    /// value compares equal to the old one.
    pub fn write(&mut self, value: ArcAny) {
        self.new_value = value;
        self.is_changed = true;
    }
}

/// An untouched entry reads back the observed container.
#[test]
fn test_read_returns_observed() {
    let initial: ArcAny = Arc::new(42);
    let entry = Entry::first_touch(initial.clone());

    assert!(Arc::ptr_eq(&entry.read(), &initial));
    assert!(!entry.is_changed);
}

/// A write switches the entry to the new container but keeps the
/// expectation.
#[test]
fn test_write_keeps_expected() {
    let initial: ArcAny = Arc::new(1);
    let mut entry = Entry::first_touch(initial.clone());

    entry.write(Arc::new(2));

    assert!(entry.is_changed);
    assert!(Arc::ptr_eq(&entry.expected, &initial));
    assert!(!Arc::ptr_eq(&entry.new_value, &initial));
}

/// The snapshot copy taken for alternatives preserves identity of both
/// containers.
#[test]
fn test_clone_preserves_identity() {
    let initial: ArcAny = Arc::new(1);
    let mut entry = Entry::first_touch(initial.clone());
    entry.write(Arc::new(2));

    let copy = entry.clone();

    assert!(Arc::ptr_eq(&copy.expected, &entry.expected));
    assert!(Arc::ptr_eq(&copy.new_value, &entry.new_value));
    assert_eq!(copy.is_changed, entry.is_changed);
}
