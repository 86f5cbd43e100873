//! Thin wrapper around the async runtime backing the whole swarm.
//!
//! Only a `tokio` backend is carried: the original feature-gated
//! `async_runtime_tokio`/`async_runtime_async_std` split is collapsed since
//! the rest of the transport stack (`communication::socket`) is tokio-only.

mod tokio;

use std::cell::UnsafeCell;

use crate::bft::error::*;

pub use self::tokio::JoinHandle;

struct GlobalRuntime(UnsafeCell<Option<tokio::Runtime>>);

unsafe impl Sync for GlobalRuntime {}

static RUNTIME: GlobalRuntime = GlobalRuntime(UnsafeCell::new(None));

/// Builds and installs the global async runtime with `num_threads` worker
/// threads. Must be called once, before any `spawn`.
pub fn init(num_threads: usize) -> Result<()> {
    let runtime = tokio::init(num_threads).simple(ErrorKind::AsyncRuntime)?;
    unsafe {
        *RUNTIME.0.get() = Some(runtime);
    }
    Ok(())
}

/// Tears down the global async runtime.
pub fn drop() -> Result<()> {
    unsafe {
        *RUNTIME.0.get() = None;
    }
    Ok(())
}

fn handle() -> ::tokio::runtime::Handle {
    unsafe {
        match &*RUNTIME.0.get() {
            Some(runtime) => runtime.handle().clone(),
            // Falls back to an ambient runtime, e.g. inside `#[tokio::test]`.
            None => ::tokio::runtime::Handle::current(),
        }
    }
}

/// Spawns a future onto the swarm's async runtime.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    handle().spawn(future)
}

/// Blocks the current thread until `future` completes.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    handle().block_on(future)
}
