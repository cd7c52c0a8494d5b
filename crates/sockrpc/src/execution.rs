//! How a resolved handler future is driven to completion.

use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;

use crate::error::HandlerError;
use crate::route::HandlerFuture;

/// Closed set of handler execution modes, picked per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// Await the handler inside the dispatch task.
    #[default]
    Inline,
    /// Offload the handler to the runtime's worker pool and join it.
    Spawned,
}

impl ExecutionStrategy {
    /// Drive `future` to completion. A panicking handler becomes a
    /// formatted error, never a crashed dispatch task.
    pub(crate) async fn invoke(self, future: HandlerFuture) -> Result<Value, HandlerError> {
        match self {
            ExecutionStrategy::Inline => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(panic_error(&panic)),
            },
            ExecutionStrategy::Spawned => match tokio::spawn(future).await {
                Ok(outcome) => outcome,
                Err(join) if join.is_panic() => Err(panic_error(&join.into_panic())),
                Err(join) => Err(HandlerError::new("InternalError", join.to_string())),
            },
        }
    }
}

fn panic_error(panic: &(dyn std::any::Any + Send)) -> HandlerError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    };
    HandlerError::new("InternalError", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ready(value: Value) -> HandlerFuture {
        Box::pin(async move { Ok(value) })
    }

    #[tokio::test]
    async fn inline_awaits_the_handler() {
        let out = ExecutionStrategy::Inline.invoke(ready(json!(1))).await;
        assert_eq!(out.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn spawned_joins_the_handler() {
        let out = ExecutionStrategy::Spawned.invoke(ready(json!(2))).await;
        assert_eq!(out.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn inline_contains_panics() {
        let future: HandlerFuture = Box::pin(async { panic!("boom") });
        let err = ExecutionStrategy::Inline.invoke(future).await.unwrap_err();
        assert_eq!(err.kind, "InternalError");
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn spawned_contains_panics() {
        let future: HandlerFuture = Box::pin(async { panic!("boom") });
        let err = ExecutionStrategy::Spawned.invoke(future).await.unwrap_err();
        assert_eq!(err.kind, "InternalError");
        assert_eq!(err.message, "boom");
    }
}
