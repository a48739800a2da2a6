//! Extractor system for Conduit handlers.
//!
//! Handler functions declare what they need as arguments; every argument
//! type implements [`FromContext`] and is pulled out of the [`Context`]
//! before the handler body runs. A failed extraction settles the handler
//! with [`BusError::Extract`](conduit_core::BusError::Extract).
//!
//! ```rust,ignore
//! #[derive(Deserialize)]
//! struct Sum { a: i64, b: i64 }
//!
//! async fn add(Params(sum): Params<Sum>) -> Value {
//!     json!(sum.a + sum.b)
//! }
//!
//! async fn audit(ctx: Context, Payload(raw): Payload) -> Outcome {
//!     tracing::info!(?raw, "audit");
//!     ctx.next(raw).await
//! }
//! ```

use std::any::type_name;
use std::ops::Deref;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use conduit_core::{Event, Meta};

use crate::bus::Bus;
use crate::cascade::Next;
use crate::context::{Context, Responder};
use crate::error::{ExtractError, ExtractResult};

/// A type that can be extracted from a [`Context`].
pub trait FromContext: Sized {
    /// Attempts to extract this type from the given context.
    fn from_context(ctx: &Context) -> ExtractResult<Self>;
}

impl FromContext for Context {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        Ok(ctx.clone())
    }
}

/// The lineage event of the current dispatch.
impl FromContext for Arc<Event> {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx.event()))
    }
}

impl FromContext for Bus {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        Ok(ctx.bus().clone())
    }
}

/// The continuation; fails for the last handler of a cascade.
///
/// Use `Option<Next>` to accept both.
impl FromContext for Next {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        ctx.continuation().cloned().ok_or(ExtractError::NoNext)
    }
}

impl FromContext for Responder {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        Ok(ctx.responder())
    }
}

impl<T: FromContext> FromContext for Option<T> {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        Ok(T::from_context(ctx).ok())
    }
}

// =============================================================================
// Params
// =============================================================================

/// Params deserialized into `T`.
#[derive(Debug, Clone)]
pub struct Params<T>(pub T);

impl<T: DeserializeOwned> FromContext for Params<T> {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        serde_json::from_value(ctx.params().clone())
            .map(Params)
            .map_err(|e| ExtractError::Params {
                expected: type_name::<T>(),
                reason: e.to_string(),
            })
    }
}

impl<T> Deref for Params<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// The raw params value.
#[derive(Debug, Clone)]
pub struct Payload(pub Value);

impl FromContext for Payload {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        Ok(Payload(ctx.params().clone()))
    }
}

/// Metadata of the registration being invoked.
#[derive(Debug, Clone)]
pub struct HandlerMeta(pub Meta);

impl FromContext for HandlerMeta {
    fn from_context(ctx: &Context) -> ExtractResult<Self> {
        Ok(HandlerMeta(ctx.handler_meta().clone()))
    }
}
