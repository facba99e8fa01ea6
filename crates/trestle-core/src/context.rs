//! Thread-local provider context.
//!
//! Dispatch pipelines often look up shared services (serializers, registries,
//! configuration) from an ambient context instead of threading them through
//! every call. The bridge pushes the configured [`ProviderContext`] for the
//! duration of each dispatch; code running on that thread reads it back with
//! [`ProviderContext::current_as`].

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static STACK: RefCell<Vec<ProviderContext>> = const { RefCell::new(Vec::new()) };
}

/// A shareable, type-erased value made ambient during dispatch.
///
/// # Example
///
/// ```
/// use trestle_core::ProviderContext;
///
/// struct Registry(&'static str);
///
/// let context = ProviderContext::new(Registry("main"));
/// {
///     let _guard = context.push();
///     let current = ProviderContext::current_as::<Registry>().unwrap();
///     assert_eq!(current.0, "main");
/// }
/// assert!(ProviderContext::current().is_none());
/// ```
#[derive(Clone)]
pub struct ProviderContext {
    value: Arc<dyn Any + Send + Sync>,
}

impl ProviderContext {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// Wraps an already shared value.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self { value }
    }

    /// Returns the value if it has type `T`.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Makes this context current on the calling thread until the guard drops.
    #[must_use = "the context is popped when the guard is dropped"]
    pub fn push(&self) -> ContextGuard {
        let depth = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(self.clone());
            stack.len()
        });
        ContextGuard {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Returns the innermost context on the calling thread.
    #[must_use]
    pub fn current() -> Option<Self> {
        STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Returns the innermost context's value if it has type `T`.
    #[must_use]
    pub fn current_as<T: Any + Send + Sync>() -> Option<Arc<T>> {
        Self::current().and_then(|context| context.downcast::<T>())
    }

    /// Returns how many contexts are pushed on the calling thread.
    #[must_use]
    pub fn depth() -> usize {
        STACK.with(|stack| stack.borrow().len())
    }
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext").finish_non_exhaustive()
    }
}

/// Pops a pushed [`ProviderContext`] when dropped, including during unwinding.
///
/// The guard is tied to the thread it was created on.
#[derive(Debug)]
pub struct ContextGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() != self.depth {
                tracing::warn!(expected = self.depth, actual = stack.len(), "provider contexts popped out of order");
            }
            stack.truncate(self.depth.saturating_sub(1));
        });
    }
}
