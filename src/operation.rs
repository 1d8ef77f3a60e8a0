//! The caller-supplied unit of work.
//!
//! The engine never looks inside an operation; it only times it, classifies its error and routes
//! its result. Implementations must tolerate concurrent invocation from many workers.

use crate::context::Context;
use async_trait::async_trait;
use std::future::Future;

/// Async operation from `I` to `O`, failing with `E`.
///
/// Implemented for every `Fn(Context, I) -> impl Future<Output = Result<O, E>>`, so plain async
/// closures work directly:
///
/// ```rust
/// use bulkline::{Context, Operation};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let double = |_ctx: Context, n: u32| async move { Ok::<_, std::io::Error>(n * 2) };
/// assert_eq!(double.call(Context::new(), 21).await.unwrap(), 42);
/// # });
/// ```
#[async_trait]
pub trait Operation<I, O, E>: Send + Sync {
    async fn call(&self, ctx: Context, input: I) -> Result<O, E>;
}

#[async_trait]
impl<I, O, E, F, Fut> Operation<I, O, E> for F
where
    F: Fn(Context, I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, E>> + Send,
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    async fn call(&self, ctx: Context, input: I) -> Result<O, E> {
        self(ctx, input).await
    }
}
