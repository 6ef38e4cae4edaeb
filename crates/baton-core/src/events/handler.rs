use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;

use super::EventEnvelope;

/// A subscriber callback.
///
/// Errors are logged and counted by the bus; they never reach the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<EventEnvelope>) -> anyhow::Result<()>;
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Adapter that turns an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure returning a future as a handler.
///
/// ```rust
/// use baton_core::events::handler_fn;
///
/// let handler = handler_fn(|event| async move {
///     println!("saw {}", event.id);
///     Ok::<(), anyhow::Error>(())
/// });
/// # drop(handler);
/// ```
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: Arc<EventEnvelope>) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}
