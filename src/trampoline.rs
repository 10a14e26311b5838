//! Pooled trampoline stubs and their ownership lifecycle.
//!
//! Every chain position owns a trampoline: a small invocable stub whose sole job is to
//! carry a redirect to the next position. Stubs are expensive for backends to mint, so
//! the pool recycles them by [`Signature`]: renting prefers a previously returned stub
//! of the same shape and only asks the runtime for a fresh one when the bucket is empty.
//!
//! Ownership is expressed by value. A [`Trampoline`] is not clonable; whoever holds it
//! owns the stub, and moving it is how the chain steals a removed detour's trampoline
//! out of its node. Dropping the handle returns the stub to the pool, so a steal must
//! keep the handle alive (queued on the target's gate) until no in-flight call can still
//! reach the stub.
//!
//! # Examples
//!
//! ```rust,ignore
//! let pool = TrampolinePool::new(runtime);
//! let trampoline = pool.rent(&signature)?;
//! let jump = factory.create_detour(trampoline.code(), next_entry, true)?;
//! ```

use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use dashmap::DashMap;

use crate::{
    runtime::{CodeRef, DetourRuntime, Signature},
    Result,
};

/// Signature-keyed recycling pool for trampoline stubs.
///
/// One pool is shared per [`DetourRegistry`](crate::DetourRegistry); all targets
/// registered through it rent from the same buckets.
pub struct TrampolinePool {
    /// Backref cloned into every rented handle for its drop-return.
    me: Weak<TrampolinePool>,
    runtime: Arc<dyn DetourRuntime>,
    free: DashMap<Signature, Vec<CodeRef>>,
    outstanding: AtomicUsize,
}

impl TrampolinePool {
    /// Creates an empty pool minting stubs through `runtime`.
    pub fn new(runtime: Arc<dyn DetourRuntime>) -> Arc<Self> {
        Arc::new_cyclic(|me| TrampolinePool {
            me: me.clone(),
            runtime,
            free: DashMap::new(),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Rents a stub with the given signature, recycling a returned one when possible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`](crate::Error::Backend) when the bucket is empty and
    /// the runtime fails to mint a fresh stub.
    pub fn rent(&self, signature: &Signature) -> Result<Trampoline> {
        let recycled = self
            .free
            .get_mut(signature)
            .and_then(|mut bucket| bucket.pop());
        let stub = match recycled {
            Some(stub) => stub,
            None => self.runtime.create_stub(signature)?,
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(Trampoline {
            stub,
            pool: self.me.clone(),
        })
    }

    fn recycle(&self, stub: CodeRef) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.free
            .entry(stub.signature().clone())
            .or_default()
            .push(stub);
    }

    /// Number of rented trampolines not yet returned.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Number of stubs currently waiting in the pool for reuse.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.free.iter().map(|bucket| bucket.value().len()).sum()
    }
}

impl fmt::Debug for TrampolinePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolinePool")
            .field("outstanding", &self.outstanding())
            .field("pooled", &self.pooled())
            .finish()
    }
}

/// Owned handle to a rented trampoline stub.
///
/// Dropping the handle returns the stub to its pool. The holder must undo any redirect
/// sourced at the stub first; the pool hands recycled stubs out as pristine.
pub struct Trampoline {
    stub: CodeRef,
    pool: Weak<TrampolinePool>,
}

impl Trampoline {
    /// The stub carried by this handle.
    #[must_use]
    pub fn code(&self) -> &CodeRef {
        &self.stub
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(self.stub.clone());
        }
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trampoline({:?})", self.stub)
    }
}

/// Per-signature cache of the stubs that stolen trampolines are re-pointed at.
///
/// A stale next-delegate reference held by user code after its hook was removed lands
/// in one of these stubs and fails loud instead of jumping into recycled code. One stub
/// per signature is enough for a whole registry, so they are minted once and kept.
pub(crate) struct RemovedStubCache {
    runtime: Arc<dyn DetourRuntime>,
    stubs: DashMap<Signature, CodeRef>,
}

impl RemovedStubCache {
    pub(crate) fn new(runtime: Arc<dyn DetourRuntime>) -> Arc<Self> {
        Arc::new(RemovedStubCache {
            runtime,
            stubs: DashMap::new(),
        })
    }

    /// The removed stub for `signature`, minting it on first use.
    pub(crate) fn get(&self, signature: &Signature) -> Result<CodeRef> {
        if let Some(stub) = self.stubs.get(signature) {
            return Ok(stub.value().clone());
        }
        let minted = self.runtime.create_removed_stub(signature)?;
        // Two racing minters both succeed; the first insert wins and the loser's stub
        // is simply never handed out.
        Ok(self
            .stubs
            .entry(signature.clone())
            .or_insert(minted)
            .value()
            .clone())
    }
}

impl fmt::Debug for RemovedStubCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovedStubCache")
            .field("signatures", &self.stubs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    fn sig(text: &str) -> Signature {
        Signature::new(text)
    }

    #[test]
    fn test_rent_mints_when_pool_empty() {
        let runtime = MockRuntime::new();
        let pool = TrampolinePool::new(runtime.clone());

        let trampoline = pool.rent(&sig("() -> ()")).unwrap();

        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.pooled(), 0);
        assert_eq!(runtime.stubs_minted(), 1);
        drop(trampoline);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_rent_recycles_same_signature() {
        let runtime = MockRuntime::new();
        let pool = TrampolinePool::new(runtime.clone());

        let first = pool.rent(&sig("(i32) -> i32")).unwrap();
        let stub = first.code().clone();
        drop(first);

        let second = pool.rent(&sig("(i32) -> i32")).unwrap();
        assert_eq!(second.code(), &stub);
        assert_eq!(runtime.stubs_minted(), 1);
    }

    #[test]
    fn test_signatures_pool_separately() {
        let runtime = MockRuntime::new();
        let pool = TrampolinePool::new(runtime.clone());

        let unit = pool.rent(&sig("() -> ()")).unwrap();
        drop(unit);
        let other = pool.rent(&sig("(u8) -> u8")).unwrap();

        assert_eq!(runtime.stubs_minted(), 2);
        assert_eq!(pool.pooled(), 1);
        drop(other);
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn test_drop_after_pool_is_gone_is_harmless() {
        let runtime = MockRuntime::new();
        let pool = TrampolinePool::new(runtime);
        let trampoline = pool.rent(&sig("() -> ()")).unwrap();
        drop(pool);
        drop(trampoline);
    }

    #[test]
    fn test_removed_stubs_minted_once_per_signature() {
        let runtime = MockRuntime::new();
        let cache = RemovedStubCache::new(runtime.clone());

        let first = cache.get(&sig("() -> ()")).unwrap();
        let again = cache.get(&sig("() -> ()")).unwrap();
        let other = cache.get(&sig("(u8) -> u8")).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(runtime.removed_stubs_minted(), 2);
    }
}
