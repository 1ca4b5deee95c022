//! Message handlers and their acknowledgement decisions.

use std::future::Future;
use std::panic;
use std::sync::Arc;

/// What to do with a delivery once its handler has looked at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Processed. The broker removes the message.
    Ack,
    /// Not processed now, try again later. The broker redelivers it.
    NackRequeue,
    /// Never going to be processed. The broker routes it to the
    /// dead-letter exchange.
    NackDiscard,
}

impl AckType {
    /// Whether the delivery goes back to its queue.
    pub fn requeues(self) -> bool {
        matches!(self, Self::NackRequeue)
    }
}

/// Processes decoded messages of type `T`.
///
/// A subscription calls its handler once per delivery, strictly one at a
/// time and in delivery order; the next delivery is not looked at until
/// the previous one has been settled. The handler must return a decision
/// for every message it is given. A handler that takes longer than the
/// configured handler timeout gets its delivery requeued and ends the
/// subscription.
///
/// Any `Fn(T) -> AckType` closure is a handler. It runs on Tokio's
/// blocking pool, so it may block without holding up other subscriptions,
/// and the handler timeout applies to it. A timed-out closure keeps running
/// on its thread until it returns; its decision is ignored. Wrap closures
/// returning a future in [`AsyncHandler`].
pub trait Handler<T>: Send + Sync + 'static {
    /// Decides what happens to one message.
    fn handle(self: Arc<Self>, message: T) -> impl Future<Output = AckType> + Send;
}

impl<T, F> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> AckType + Send + Sync + 'static,
{
    fn handle(self: Arc<Self>, message: T) -> impl Future<Output = AckType> + Send {
        async move {
            match tokio::task::spawn_blocking(move || (*self)(message)).await {
                Ok(decision) => decision,
                // Re-raise in the subscription task, which ends it as failed.
                Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
                // Runtime shutdown; let the broker redeliver.
                Err(_) => AckType::NackRequeue,
            }
        }
    }
}

/// Adapts an async closure into a [`Handler`].
///
/// ```rust
/// use peril_protocol::PlayingState;
/// use peril_pubsub::{AckType, AsyncHandler};
///
/// let handler = AsyncHandler(|state: PlayingState| async move {
///     if state.is_paused {
///         tracing::info!("game paused");
///     }
///     AckType::Ack
/// });
/// # let _ = handler;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AsyncHandler<F>(pub F);

impl<T, F, Fut> Handler<T> for AsyncHandler<F>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckType> + Send,
{
    fn handle(self: Arc<Self>, message: T) -> impl Future<Output = AckType> + Send {
        (self.0)(message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    async fn run<T, H: Handler<T>>(handler: &Arc<H>, message: T) -> AckType {
        Arc::clone(handler).handle(message).await
    }

    #[tokio::test]
    async fn test_plain_closure_is_a_handler() {
        let handler = Arc::new(|n: u32| {
            if n % 2 == 0 { AckType::Ack } else { AckType::NackDiscard }
        });
        assert_eq!(run(&handler, 2).await, AckType::Ack);
        assert_eq!(run(&handler, 3).await, AckType::NackDiscard);
    }

    #[tokio::test]
    async fn test_async_closure_is_a_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler = Arc::new(AsyncHandler(move |_: String| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                AckType::NackRequeue
            }
        }));
        assert_eq!(run(&handler, "x".to_string()).await, AckType::NackRequeue);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_closure_does_not_hold_the_runtime() {
        // Current-thread runtime: the ticker only advances if the closure
        // is off this thread.
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let handler = Arc::new(|_: u32| {
            std::thread::sleep(Duration::from_millis(200));
            AckType::Ack
        });
        assert_eq!(run(&handler, 1).await, AckType::Ack);
        ticker.abort();
        assert!(ticks.load(Ordering::SeqCst) > 2);
    }

    #[tokio::test]
    async fn test_blocking_closure_is_bounded_by_timeout() {
        let handler = Arc::new(|_: u32| {
            std::thread::sleep(Duration::from_millis(300));
            AckType::Ack
        });
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), Arc::clone(&handler).handle(1)).await;
        assert!(outcome.is_err());
    }

    #[test]
    fn test_only_nack_requeue_requeues() {
        assert!(!AckType::Ack.requeues());
        assert!(AckType::NackRequeue.requeues());
        assert!(!AckType::NackDiscard.requeues());
    }
}
