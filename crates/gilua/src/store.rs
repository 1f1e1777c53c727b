//! Handle stores that stand between the interpreter and host values.
//!
//! Native objects never carry a host pointer. A userdata or closure upvalue
//! only holds a [`Handle`], and the value itself lives in one of the
//! process-wide stores below until the interpreter's collector finalizes the
//! object that owns the id.

use std::{
    any::Any,
    fmt,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;

use crate::{error::Error, function::HostFunction};

/// Which store a [`Handle`] belongs to. Ids are only unique within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandleKind {
    /// A host function behind a native closure.
    Function,
    /// A host value behind a userdata.
    Userdata,
    /// An error in flight through the interpreter.
    Error,
    /// An entry of a store created with [`Store::new`].
    Other,
}

/// Integer key into a [`Store`], tagged with the kind of store it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub(crate) kind: HandleKind,
    pub(crate) id: u64,
}

impl Handle {
    /// Raw id.
    pub fn id(self) -> u64 {
        self.id
    }

    pub fn kind(self) -> HandleKind {
        self.kind
    }

    /// Whether the function, userdata or error behind this handle has not
    /// been collected yet. Handles of [`HandleKind::Other`] stores are not
    /// tracked here; ask the store with [`Store::contains`].
    pub fn is_alive(self) -> bool {
        match self.kind {
            HandleKind::Function => FUNCTIONS.contains(self),
            HandleKind::Userdata => USERDATA.contains(self),
            HandleKind::Error => ERRORS.contains(self),
            HandleKind::Other => false,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.id)
    }
}

/// A lock-protected table mapping monotonically increasing ids to values.
///
/// Ids are never recycled, so a collected id can only ever look up as
/// absent. A handle of another kind never matches.
pub struct Store<T> {
    kind: HandleKind,
    /// Last id handed out.
    next_id: AtomicU64,
    /// Live entries.
    values: DashMap<u64, T>,
}

impl<T> Store<T> {
    /// Create an empty store handing out [`HandleKind::Other`] handles.
    pub fn new() -> Self {
        Self::with_kind(HandleKind::Other)
    }

    pub(crate) fn with_kind(kind: HandleKind) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(0),
            values: DashMap::new(),
        }
    }

    /// Insert a value and return its fresh handle.
    pub fn push(&self, value: T) -> Handle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.values.insert(id, value);
        Handle { kind: self.kind, id }
    }

    /// Remove an entry. Removing an absent id is a no-op returning `None`.
    pub fn pop(&self, handle: Handle) -> Option<T> {
        if handle.kind != self.kind {
            return None;
        }
        self.values.remove(&handle.id).map(|(_, value)| value)
    }

    /// Whether the handle is still live.
    pub fn contains(&self, handle: Handle) -> bool {
        handle.kind == self.kind && self.values.contains_key(&handle.id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no entry is live.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<T: Clone> Store<T> {
    /// Look up a value; `None` once the entry has been popped.
    pub fn get(&self, handle: Handle) -> Option<T> {
        if handle.kind != self.kind {
            return None;
        }
        self.values.get(&handle.id).map(|entry| entry.value().clone())
    }
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Host value carried by a full userdata.
pub type Userdata = Arc<dyn Any + Send + Sync>;

/// Opaque host values exposed as userdata.
pub(crate) static USERDATA: LazyLock<Store<Userdata>> =
    LazyLock::new(|| Store::with_kind(HandleKind::Userdata));

/// Host functions reachable from native closures.
pub(crate) static FUNCTIONS: LazyLock<Store<HostFunction>> =
    LazyLock::new(|| Store::with_kind(HandleKind::Function));

/// Errors in flight through the interpreter as error objects.
pub(crate) static ERRORS: LazyLock<Store<Error>> = LazyLock::new(|| Store::with_kind(HandleKind::Error));
