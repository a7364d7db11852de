//! Interruption handling for a training run
//!
//! Translates SIGINT/SIGTERM into a deterministic shutdown sequence:
//! - an idempotent `interrupted` flag that training code polls
//! - an ordered registry of finalize hooks, run most-recent-first
//! - exactly one hook pass, whether triggered by a signal or by scope exit
//!
//! The handler is an explicit value owned by whoever creates it (normally the
//! run context). Only the OS listener task installed by [`SignalHandler::install`]
//! touches process-wide signal state.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// Zero-argument finalize callback, invoked at most once
pub type FinalizeHook = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
struct Registry {
    hooks: Vec<(String, FinalizeHook)>,
    finalized: bool,
}

#[derive(Default)]
struct Inner {
    interrupted: AtomicBool,
    registry: Mutex<Registry>,
    /// Held for the whole hook pass; re-entrant so a hook may call back in
    pass: ReentrantMutex<()>,
}

/// Interruption flag plus finalize hook registry
///
/// Cloning yields another handle to the same flag and registry.
#[derive(Clone, Default)]
pub struct SignalHandler {
    inner: Arc<Inner>,
}

impl SignalHandler {
    /// Create a handler with an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a finalize hook
    ///
    /// Hooks run in reverse registration order. A hook registered after the
    /// finalize pass already happened runs immediately.
    pub fn register<F>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let mut registry = self.inner.registry.lock();
        if registry.finalized {
            drop(registry);
            warn!(hook = %name, "Hook registered after finalize pass, running it now");
            run_hook(&name, Box::new(hook));
            return;
        }
        debug!(hook = %name, position = registry.hooks.len(), "Registered finalize hook");
        registry.hooks.push((name, Box::new(hook)));
    }

    /// Whether an interruption has been received
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Whether the finalize pass has run (or is running)
    pub fn is_finalized(&self) -> bool {
        self.inner.registry.lock().finalized
    }

    /// Number of hooks waiting for the finalize pass
    pub fn pending_hooks(&self) -> usize {
        self.inner.registry.lock().hooks.len()
    }

    /// Record an interruption and run the finalize pass
    ///
    /// Only the call that sets the flag runs hooks; later interruptions are
    /// observable through [`is_interrupted`](Self::is_interrupted) alone.
    /// Returns true if this call triggered the pass.
    pub fn interrupt(&self) -> bool {
        if self.inner.interrupted.swap(true, Ordering::SeqCst) {
            debug!("Interruption already recorded, ignoring");
            return false;
        }
        warn!("Run interrupted, running finalize hooks");
        self.run_hooks();
        true
    }

    /// Run every registered hook exactly once
    ///
    /// Concurrent callers block until the pass in flight completes and then
    /// find the registry empty. Hook failures and panics are logged, never
    /// propagated. Returns the number of hooks this call ran.
    pub fn run_hooks(&self) -> usize {
        let _pass = self.inner.pass.lock();
        let hooks = {
            let mut registry = self.inner.registry.lock();
            registry.finalized = true;
            std::mem::take(&mut registry.hooks)
        };

        let count = hooks.len();
        if count > 0 {
            info!(count, "Running finalize hooks");
        }
        for (name, hook) in hooks.into_iter().rev() {
            run_hook(&name, hook);
        }
        count
    }

    /// Listen for SIGINT (and SIGTERM on unix) on the current Tokio runtime
    ///
    /// Each received signal calls [`interrupt`](Self::interrupt). The listener
    /// stops when the returned guard is dropped.
    ///
    /// Tokio never restores a signal's default disposition once it has
    /// registered a handler for it. After the guard is dropped, SIGINT and
    /// SIGTERM are still caught and ignored for the rest of the process, so
    /// Ctrl-C no longer terminates it. Callers that outlive the run and need
    /// the default behavior back must exit or install their own listener.
    pub fn install(&self) -> Result<SignalListener> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::Internal {
            message: format!("Signal listener requires a Tokio runtime: {}", e),
        })?;

        let handler = self.clone();
        let task = runtime.spawn(async move {
            loop {
                match shutdown_signal().await {
                    Ok(name) => {
                        info!(signal = name, "Received shutdown signal");
                        let handler = handler.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || handler.interrupt()).await {
                            error!(error = %e, "Interruption task failed");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to listen for shutdown signals");
                        break;
                    }
                }
            }
        });

        debug!("Signal listener installed");
        Ok(SignalListener { task: Some(task) })
    }
}

impl std::fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandler")
            .field("interrupted", &self.is_interrupted())
            .field("pending_hooks", &self.pending_hooks())
            .finish()
    }
}

/// Guard for the OS signal listener task
#[derive(Debug)]
pub struct SignalListener {
    task: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// Stop listening for signals
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Signal listener stopped");
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.abort();
    }
}

fn run_hook(name: &str, hook: FinalizeHook) {
    match std::panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => debug!(hook = name, "Finalize hook completed"),
        Ok(Err(e)) => error!(hook = name, error = %e, "Finalize hook failed"),
        Err(_) => error!(hook = name, "Finalize hook panicked"),
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}
