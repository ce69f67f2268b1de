//! Handlers: the callbacks events are dispatched to.
//!
//! [`Handler`] is implemented for async functions taking 0-16 parameters that
//! implement [`FromContext`] and returning a type that implements
//! [`HandlerResponse`], similar to Axum's handler system:
//!
//! ```rust,ignore
//! // No parameters, no response
//! async fn ping() {}
//!
//! // Returned strings are sent back to the event's chat
//! async fn echo(Text(text): Text) -> String {
//!     text
//! }
//!
//! // Errors fail the event and are reported by the dispatcher
//! async fn ban(cmd: CommandArgs, bot: BoxedBot) -> Result<(), ApiError> {
//!     bot.call_api("messages.removeChatUser", json!({ "member_id": cmd.args })).await?;
//!     Ok(())
//! }
//! ```
//!
//! Handlers are stored type-erased as [`BoxedHandler`]. Any `tower::Service`
//! over `Arc<Context>` can be used as a handler through [`from_service`], and
//! every [`BoxedHandler`] can be driven as a service through
//! [`HandlerService`].

use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tower::{BoxError, Service, ServiceExt};

use crate::context::Context;
use crate::error::HandlerError;
use crate::extractor::FromContext;

// ============================================================================
// HandlerResponse
// ============================================================================

/// A type that can be returned from handlers.
#[async_trait]
pub trait HandlerResponse: Send + 'static {
    /// Performs the response's side effects and reports whether the handler
    /// succeeded.
    async fn into_result(self, ctx: &Context) -> Result<(), HandlerError>;
}

#[async_trait]
impl HandlerResponse for () {
    async fn into_result(self, _ctx: &Context) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Sends the string to the event's chat.
#[async_trait]
impl HandlerResponse for String {
    async fn into_result(self, ctx: &Context) -> Result<(), HandlerError> {
        ctx.reply(&self).await?;
        Ok(())
    }
}

#[async_trait]
impl HandlerResponse for &'static str {
    async fn into_result(self, ctx: &Context) -> Result<(), HandlerError> {
        ctx.reply(self).await?;
        Ok(())
    }
}

/// On `Some` the inner response is handled; on `None` nothing happens.
#[async_trait]
impl<T: HandlerResponse> HandlerResponse for Option<T> {
    async fn into_result(self, ctx: &Context) -> Result<(), HandlerError> {
        match self {
            Some(t) => t.into_result(ctx).await,
            None => Ok(()),
        }
    }
}

/// On `Err` the event fails with [`HandlerError::Failed`].
#[async_trait]
impl<T: HandlerResponse, E: Display + Send + 'static> HandlerResponse for Result<T, E> {
    async fn into_result(self, ctx: &Context) -> Result<(), HandlerError> {
        match self {
            Ok(t) => t.into_result(ctx).await,
            Err(e) => Err(HandlerError::Failed(e.to_string())),
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// An event handler.
///
/// Automatically implemented for async functions whose parameters implement
/// [`FromContext`] and whose return type implements [`HandlerResponse`]. If a
/// parameter cannot be extracted the function is not called and the call
/// fails with [`HandlerError::Extract`].
#[async_trait]
pub trait Handler<T>: Clone + Send + Sync + 'static {
    async fn call(self, ctx: Arc<Context>) -> Result<(), HandlerError>;
}

/// A type-erased handler that can be stored in the registry.
pub type BoxedHandler =
    Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Converts a handler function into a [`BoxedHandler`].
pub fn into_handler<F, T>(f: F) -> BoxedHandler
where
    F: Handler<T>,
    T: 'static,
{
    Arc::new(move |ctx| f.clone().call(ctx))
}

macro_rules! impl_handler {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_variables)]
        #[async_trait]
        impl<F, Fut, Res, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: FnOnce($($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: HandlerResponse,
            $( $ty: FromContext + Send + 'static, )*
        {
            async fn call(self, ctx: Arc<Context>) -> Result<(), HandlerError> {
                $(
                    let $ty = $ty::from_context(&ctx)?;
                )*

                let res = (self)($($ty,)*).await;
                res.into_result(&ctx).await
            }
        }
    };
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);
impl_handler!(T1, T2, T3, T4, T5);
impl_handler!(T1, T2, T3, T4, T5, T6);
impl_handler!(T1, T2, T3, T4, T5, T6, T7);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14);
impl_handler!(
    T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15
);
impl_handler!(
    T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15, T16
);

// ============================================================================
// tower interop
// ============================================================================

/// Uses a `tower::Service` as a handler.
///
/// Each event drives a clone of the service to readiness and calls it once.
/// Service errors fail the event with [`HandlerError::Failed`].
pub fn from_service<S>(service: S) -> BoxedHandler
where
    S: Service<Arc<Context>, Response = ()> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    Arc::new(move |ctx| {
        let svc = service.clone();
        async move {
            svc.oneshot(ctx)
                .await
                .map_err(|e| HandlerError::Failed(e.into().to_string()))
        }
        .boxed()
    })
}

/// A [`BoxedHandler`] exposed as a `tower::Service`, so it can be wrapped in
/// tower layers before being registered again with [`from_service`].
#[derive(Clone)]
pub struct HandlerService {
    handler: BoxedHandler,
}

impl HandlerService {
    pub fn new(handler: BoxedHandler) -> Self {
        Self { handler }
    }
}

impl Service<Arc<Context>> for HandlerService {
    type Response = ();
    type Error = HandlerError;
    type Future = BoxFuture<'static, Result<(), HandlerError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: Arc<Context>) -> Self::Future {
        (self.handler)(ctx)
    }
}

/// A handler that accepts every event and does nothing.
pub fn noop() -> BoxedHandler {
    from_service(tower::service_fn(|_ctx: Arc<Context>| async {
        Ok::<_, Infallible>(())
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::extractor::{ChatId, Text};
    use crate::limiter::RateLimiter;
    use gramflow_core::{DetachedBot, Event};

    fn ctx(event: Event) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(event),
            Arc::new(DetachedBot),
            RateLimiter::default(),
        ))
    }

    #[tokio::test]
    async fn test_extractors_feed_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = into_handler(move |Text(text): Text, ChatId(chat): ChatId| {
            let counter = counter.clone();
            async move {
                assert_eq!(text, "hello");
                assert_eq!(chat, 5);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        handler(ctx(Event::message(5, "hello").build())).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extraction_failure_skips_call() {
        async fn needs_text(_: Text) {
            panic!("must not run");
        }
        let result = into_handler(needs_text)(ctx(Event::callback(1).build())).await;
        assert!(matches!(result, Err(HandlerError::Extract(_))));
    }

    #[tokio::test]
    async fn test_error_response() {
        async fn fails() -> Result<(), String> {
            Err("boom".into())
        }
        let result = into_handler(fails)(ctx(Event::message(1, "x").build())).await;
        assert!(matches!(result, Err(HandlerError::Failed(msg)) if msg == "boom"));
    }

    #[tokio::test]
    async fn test_string_reply_propagates_api_error() {
        async fn reply() -> String {
            "pong".to_string()
        }
        // DetachedBot cannot send
        let result = into_handler(reply)(ctx(Event::message(1, "x").build())).await;
        assert!(matches!(result, Err(HandlerError::Api(_))));
    }

    #[tokio::test]
    async fn test_tower_round_trip() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let inner = into_handler(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let handler = from_service(HandlerService::new(inner));
        handler(ctx(Event::message(1, "x").build())).await.unwrap();
        noop()(ctx(Event::message(1, "x").build())).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
