//! Handle for admitted work.

use crate::context::EntryContext;
use crate::error::BoxError;
use crate::resource::ResourceWrapper;
use crate::slot_chain::SlotChain;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// An admitted entry. Exit it when the guarded work finishes; dropping it exits too.
///
/// Exit runs at most once: registered exit handlers, then the chain's completion hooks, then
/// the context goes back to the pool. Later calls are no-ops.
pub struct SentinelEntry {
    resource: ResourceWrapper,
    ctx: Mutex<Option<EntryContext>>,
    chain: Arc<SlotChain>,
}

impl fmt::Debug for SentinelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelEntry")
            .field("resource", &self.resource)
            .field("exited", &self.is_exited())
            .finish()
    }
}

impl SentinelEntry {
    pub(crate) fn new(resource: ResourceWrapper, ctx: EntryContext, chain: Arc<SlotChain>) -> Self {
        Self { resource, ctx: Mutex::new(Some(ctx)), chain }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        &self.resource
    }

    pub fn is_exited(&self) -> bool {
        self.ctx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Run `f` against the live context; `None` once exited.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut EntryContext) -> R) -> Option<R> {
        self.ctx.lock().unwrap_or_else(|e| e.into_inner()).as_mut().map(f)
    }

    /// Record a business error without exiting. Ignored after exit.
    pub fn trace_error(&self, err: impl Into<BoxError>) {
        let err = err.into();
        if self.with_context(|ctx| ctx.set_error(err)).is_none() {
            tracing::debug!(resource = %self.resource.name(), "error traced after exit");
        }
    }

    /// Register a handler run at exit, before the completion hooks.
    pub fn when_exit<F>(&self, handler: F)
    where
        F: FnOnce(&EntryContext) -> Result<(), BoxError> + Send + 'static,
    {
        if self.with_context(|ctx| ctx.when_exit(handler)).is_none() {
            tracing::debug!(resource = %self.resource.name(), "exit handler registered after exit");
        }
    }

    pub fn exit(&self) {
        let Some(mut ctx) = self.ctx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        for handler in ctx.take_exit_handlers() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(resource = %self.resource.name(), error = %err, "exit handler failed");
                }
                Err(_) => {
                    tracing::error!(resource = %self.resource.name(), "exit handler panicked");
                }
            }
        }
        self.chain.exit(&mut ctx);
        self.chain.refurbish_context(ctx);
    }

    /// Trace `err` and exit.
    pub fn exit_with_error(&self, err: impl Into<BoxError>) {
        self.trace_error(err);
        self.exit();
    }
}

impl Drop for SentinelEntry {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceType, TrafficType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(chain: &Arc<SlotChain>) -> SentinelEntry {
        let resource = ResourceWrapper::new("e", ResourceType::Common, TrafficType::Outbound);
        let mut ctx = chain.get_pooled_context();
        ctx.set_resource(resource.clone());
        SentinelEntry::new(resource, ctx, chain.clone())
    }

    #[test]
    fn exit_runs_handlers_once_and_returns_context() {
        let chain = Arc::new(SlotChain::with_pool_capacity(4));
        let runs = Arc::new(AtomicUsize::new(0));
        let e = entry(&chain);
        let r = runs.clone();
        e.when_exit(move |ctx| {
            assert_eq!(ctx.resource().map(|r| r.name()), Some("e"));
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        e.exit();
        e.exit();
        assert!(e.is_exited());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(chain.pool().idle(), 1);
        drop(e);
        assert_eq!(chain.pool().idle(), 1);
    }

    #[test]
    fn failing_handler_does_not_stop_exit() {
        let chain = Arc::new(SlotChain::with_pool_capacity(4));
        let after = Arc::new(AtomicUsize::new(0));
        let e = entry(&chain);
        e.when_exit(|_| Err("handler failed".into()));
        let a = after.clone();
        e.when_exit(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        e.exit();
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn traced_error_visible_to_handlers() {
        let chain = Arc::new(SlotChain::with_pool_capacity(4));
        let seen = Arc::new(Mutex::new(None));
        let e = entry(&chain);
        let s = seen.clone();
        e.when_exit(move |ctx| {
            *s.lock().unwrap() = ctx.error().map(|e| e.to_string());
            Ok(())
        });
        e.exit_with_error("db down");
        assert_eq!(seen.lock().unwrap().as_deref(), Some("db down"));
    }

    #[test]
    fn drop_exits() {
        let chain = Arc::new(SlotChain::with_pool_capacity(4));
        {
            let _e = entry(&chain);
        }
        assert_eq!(chain.pool().idle(), 1);
    }
}
