use std::{
    fmt,
    sync::{Arc, Weak},
};

use gilua::RegistryRef;

use crate::environment::Shared;

/// A script function pinned for later invocation from the host.
///
/// Cloning is cheap. The pin is released under the interpreter lock, the
/// next time any thread enters the environment after the last clone drops.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<Pinned>,
}

struct Pinned {
    reference: Option<RegistryRef>,
    env: Weak<Shared>,
}

impl Callback {
    pub(crate) fn new(reference: RegistryRef, env: Weak<Shared>) -> Self {
        Self {
            inner: Arc::new(Pinned {
                reference: Some(reference),
                env,
            }),
        }
    }

    pub(crate) fn reference(&self) -> Option<&RegistryRef> {
        self.inner.reference.as_ref()
    }

    pub(crate) fn belongs_to(&self, env: &Arc<Shared>) -> bool {
        Weak::ptr_eq(&self.inner.env, &Arc::downgrade(env))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("reference", &self.inner.reference)
            .finish()
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        if let (Some(reference), Some(env)) = (self.reference.take(), self.env.upgrade()) {
            env.release_later(reference);
        }
    }
}
