use std::cell::RefCell;

use tracing::debug;

use crate::errors::{Error, Result};
use crate::graph::Graph;
use crate::storage::Registry;

/// Owns the two engine singletons (compute graph and storage registry) plus
/// the gradient-mode default used at leaf creation.
///
/// The engine is single-threaded by design: one context lives per thread
/// and the convenience API below operates on the calling thread's context.
pub struct Context {
    pub graph: Graph,
    pub registry: Registry,
    grad_enabled: bool,
}

impl Context {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            registry: Registry::new(),
            grad_enabled: true,
        }
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    pub fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Installs a fresh context for this thread. Must be called exactly once
/// before any other API use; there is no lazy initialization.
pub fn init() -> Result<()> {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::InvalidOperation(
                "engine already initialized".to_string(),
            ));
        }
        *slot = Some(Context::new());
        debug!("engine initialized");
        Ok(())
    })
}

/// Tears the thread's context down, force-releasing whatever the caller
/// left behind, and verifies the registry drained.
pub fn cleanup() -> Result<()> {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let mut cx = slot.take().ok_or(Error::NotInitialized)?;
        cx.graph.clear(&mut cx.registry);
        cx.registry.teardown()?;
        debug!("engine cleaned up");
        Ok(())
    })
}

/// Runs `f` against this thread's context. Calls must not nest.
pub fn with<R>(f: impl FnOnce(&mut Context) -> Result<R>) -> Result<R> {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let cx = slot.as_mut().ok_or(Error::NotInitialized)?;
        f(cx)
    })
}

/// Newly created leaves default to carrying gradients.
pub fn enable_grad() -> Result<()> {
    with(|cx| {
        cx.set_grad_enabled(true);
        Ok(())
    })
}

/// Newly created leaves default to not carrying gradients.
pub fn disable_grad() -> Result<()> {
    with(|cx| {
        cx.set_grad_enabled(false);
        Ok(())
    })
}

pub fn is_grad_enabled() -> Result<bool> {
    with(|cx| Ok(cx.grad_enabled()))
}

/// DOT dump of the thread's whole graph.
pub fn graph_dot() -> Result<String> {
    with(|cx| Ok(cx.graph.to_dot()))
}
