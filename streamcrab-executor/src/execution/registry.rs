use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

/// A resource that can be released from another thread.
///
/// `close` must unblock any thread currently blocked inside the resource and
/// must be idempotent.
pub trait Closeable: Send + Sync {
    fn close(&self) -> Result<()>;
}

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Handle returned by [`CloseableRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationKey(u64);

#[derive(Default)]
struct RegistryInner {
    closed: bool,
    next_key: u64,
    resources: BTreeMap<u64, ReleaseFn>,
}

/// Scoped registry of release callbacks.
///
/// Cancellation closes the registry, which runs every callback; a resource
/// registered afterwards is released immediately and the registration fails.
#[derive(Default)]
pub struct CloseableRegistry {
    inner: Mutex<RegistryInner>,
}

impl CloseableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, release: F) -> Result<RegistrationKey>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("closeable registry lock poisoned"))?;
        if inner.closed {
            drop(inner);
            if let Err(err) = release() {
                tracing::warn!("failed to release resource registered after close: {err:#}");
            }
            return Err(anyhow!("cannot register resource, registry is already closed"));
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.resources.insert(key, Box::new(release));
        Ok(RegistrationKey(key))
    }

    pub fn register_closeable<C>(&self, resource: Arc<C>) -> Result<RegistrationKey>
    where
        C: Closeable + ?Sized + 'static,
    {
        self.register(move || resource.close())
    }

    /// Forget a resource without releasing it. Returns false if it was unknown
    /// or has already been released.
    pub fn unregister(&self, key: RegistrationKey) -> bool {
        self.inner
            .lock()
            .expect("closeable registry poisoned")
            .resources
            .remove(&key.0)
            .is_some()
    }

    /// Release all registered resources, newest first. Idempotent.
    ///
    /// Every callback runs even if an earlier one fails; the first error is returned.
    pub fn close_all(&self) -> Result<()> {
        let resources = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| anyhow!("closeable registry lock poisoned"))?;
            inner.closed = true;
            std::mem::take(&mut inner.resources)
        };

        let mut first_err = None;
        for (_, release) in resources.into_iter().rev() {
            if let Err(err) = release() {
                tracing::warn!("failed to release resource: {err:#}");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("closeable registry poisoned").closed
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("closeable registry poisoned")
            .resources
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Closeable for CloseableRegistry {
    fn close(&self) -> Result<()> {
        self.close_all()
    }
}

/// Closes the wrapped registry when dropped, on every exit path of the owner.
pub struct CloseOnDrop(pub Arc<CloseableRegistry>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Err(err) = self.0.close_all() {
            tracing::warn!("error while releasing task resources: {err:#}");
        }
    }
}
