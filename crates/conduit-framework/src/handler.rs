//! Handler system for Conduit.
//!
//! [`Handler`] is implemented for async functions taking up to twelve
//! [`FromContext`] arguments and returning anything that implements
//! [`IntoSettlement`], similar to Axum's handler system. Handlers are stored
//! type-erased as [`BoxedHandler`].
//!
//! # Settlement
//!
//! A handler settles its result at most once, either by returning a value or
//! through [`Context::reply`]. Returning `()` or `None` settles nothing; the
//! result is then whatever the handler replied, or `null` once every handle
//! to the gate is gone.
//!
//! ```rust,ignore
//! // Returned value settles
//! async fn hello(Params(name): Params<String>) -> Value {
//!     json!(format!("Hello, {name}!"))
//! }
//!
//! // Delegates to the next handler and returns its result
//! async fn logged(ctx: Context) -> Outcome {
//!     ctx.next(ctx.params().clone()).await
//! }
//!
//! // Settles from a spawned task
//! async fn later(responder: Responder) {
//!     tokio::spawn(async move {
//!         let _ = responder.reply(json!("done"));
//!     });
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use conduit_core::{BoxError, BusError, HandlerError, Outcome};

use crate::context::Context;
use crate::extractor::FromContext;

// =============================================================================
// IntoSettlement
// =============================================================================

/// Converts a handler return value into an optional settlement.
///
/// `None` means the return value settles nothing.
pub trait IntoSettlement: Send {
    fn into_settlement(self) -> Option<Outcome>;
}

impl IntoSettlement for () {
    fn into_settlement(self) -> Option<Outcome> {
        None
    }
}

impl IntoSettlement for Value {
    fn into_settlement(self) -> Option<Outcome> {
        Some(Ok(self))
    }
}

impl IntoSettlement for String {
    fn into_settlement(self) -> Option<Outcome> {
        Some(Ok(Value::String(self)))
    }
}

impl IntoSettlement for &'static str {
    fn into_settlement(self) -> Option<Outcome> {
        Some(Ok(Value::from(self)))
    }
}

impl IntoSettlement for bool {
    fn into_settlement(self) -> Option<Outcome> {
        Some(Ok(Value::Bool(self)))
    }
}

impl IntoSettlement for i64 {
    fn into_settlement(self) -> Option<Outcome> {
        Some(Ok(Value::from(self)))
    }
}

impl IntoSettlement for f64 {
    fn into_settlement(self) -> Option<Outcome> {
        Some(Ok(Value::from(self)))
    }
}

impl IntoSettlement for BusError {
    fn into_settlement(self) -> Option<Outcome> {
        Some(Err(self))
    }
}

/// `Some` settles through the inner value, `None` settles nothing.
impl<T: IntoSettlement> IntoSettlement for Option<T> {
    fn into_settlement(self) -> Option<Outcome> {
        self.and_then(IntoSettlement::into_settlement)
    }
}

/// `Err` always settles as a failure. Bus errors keep their variant.
impl<T, E> IntoSettlement for Result<T, E>
where
    T: IntoSettlement,
    E: Into<BoxError> + Send,
{
    fn into_settlement(self) -> Option<Outcome> {
        match self {
            Ok(value) => value.into_settlement(),
            Err(err) => Some(Err(BusError::from_boxed(err.into()))),
        }
    }
}

/// Serializes any `T` into the settled value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize + Send> IntoSettlement for Json<T> {
    fn into_settlement(self) -> Option<Outcome> {
        Some(
            serde_json::to_value(self.0)
                .map_err(|e| BusError::Handler(HandlerError::from_error(e))),
        )
    }
}

// =============================================================================
// Handler Trait
// =============================================================================

/// An async function usable as a bus handler.
#[async_trait]
pub trait Handler<T>: Clone + Send + Sync + 'static {
    /// Runs the handler; the return value is the implicit settlement.
    async fn call(self, ctx: Context) -> Option<Outcome>;
}

/// A type-erased handler as stored in the registry.
pub type BoxedHandler = Arc<dyn Fn(Context) -> BoxFuture<'static, Option<Outcome>> + Send + Sync>;

/// Converts a handler function into a boxed handler.
pub fn into_handler<H, T>(handler: H) -> BoxedHandler
where
    H: Handler<T>,
    T: 'static,
{
    Arc::new(move |ctx| handler.clone().call(ctx))
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
            Res: IntoSettlement + 'static,
            $( $ty: FromContext + Send + 'static, )*
        {
            async fn call(self, ctx: Context) -> Option<Outcome> {
                $(
                    let $ty = match $ty::from_context(&ctx) {
                        Ok(value) => value,
                        Err(err) => return Some(Err(err.into())),
                    };
                )*

                (self)($($ty,)*).await.into_settlement()
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("custom failure")]
    struct Custom;

    #[test]
    fn test_unit_and_none_settle_nothing() {
        assert!(().into_settlement().is_none());
        assert!(None::<Value>.into_settlement().is_none());
        assert!(Ok::<(), Custom>(()).into_settlement().is_none());
    }

    #[test]
    fn test_values_settle() {
        assert_eq!(json!(1).into_settlement().unwrap().unwrap(), json!(1));
        assert_eq!("hi".into_settlement().unwrap().unwrap(), json!("hi"));
        assert_eq!(
            Json(vec![1, 2]).into_settlement().unwrap().unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            Some(String::from("x")).into_settlement().unwrap().unwrap(),
            json!("x")
        );
    }

    #[test]
    fn test_errors_settle_as_failures() {
        let err = Err::<Value, _>(Custom).into_settlement().unwrap().unwrap_err();
        assert_eq!(err.kind(), "handler");
        assert_eq!(err.to_string(), "custom failure");

        let err = Err::<Value, _>(BusError::no_handlers("x"))
            .into_settlement()
            .unwrap()
            .unwrap_err();
        assert!(err.is_no_handlers());
    }
}
