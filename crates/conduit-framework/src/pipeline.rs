//! Handler pipeline layers.
//!
//! Registrations can wrap their handler in [`tower_layer::Layer`]s over
//! [`BoxedHandler`]. Layers are applied at subscribe time; the first layer
//! added is the outermost one and sees the call first.
//!
//! ```rust,ignore
//! bus.route("user.create")
//!     .layer(DefaultParamsLayer::new(json!({ "role": "guest" })))
//!     .layer(ValidateLayer::new(|p| {
//!         p.get("name").map(|_| ()).ok_or_else(|| "name is required".into())
//!     }))
//!     .handler(create_user)?;
//! ```

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::{Map, Value};
use tower_layer::Layer;

use conduit_core::{BusError, HandlerError, Outcome};

use crate::context::Context;
use crate::handler::BoxedHandler;

/// A type-erased handler layer.
pub type BoxedLayer = Arc<dyn Layer<BoxedHandler, Service = BoxedHandler> + Send + Sync>;

/// Wraps `handler` in `layers`, the first layer outermost.
pub fn apply(handler: BoxedHandler, layers: &[BoxedLayer]) -> BoxedHandler {
    layers
        .iter()
        .rev()
        .fold(handler, |inner, layer| layer.layer(inner))
}

// =============================================================================
// DefaultParamsLayer
// =============================================================================

/// Fills in missing top-level params keys.
///
/// Object params are merged shallowly over the defaults; `null` params are
/// replaced by the defaults; other params pass through untouched.
#[derive(Debug, Clone)]
pub struct DefaultParamsLayer {
    defaults: Map<String, Value>,
}

impl DefaultParamsLayer {
    /// Non-object defaults are treated as empty.
    pub fn new(defaults: Value) -> Self {
        let defaults = match defaults {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { defaults }
    }

    fn merge(&self, params: &Value) -> Value {
        match params {
            Value::Object(given) => {
                let mut merged = self.defaults.clone();
                merged.extend(given.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(merged)
            }
            Value::Null => Value::Object(self.defaults.clone()),
            other => other.clone(),
        }
    }
}

impl Layer<BoxedHandler> for DefaultParamsLayer {
    type Service = BoxedHandler;

    fn layer(&self, inner: BoxedHandler) -> BoxedHandler {
        let this = self.clone();
        Arc::new(move |ctx: Context| {
            let params = this.merge(ctx.params());
            inner(ctx.with_params(params))
        })
    }
}

// =============================================================================
// ValidateLayer
// =============================================================================

type Check = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Rejects params before the handler runs.
///
/// A failed check settles the handler with a [`HandlerError`] carrying the
/// returned message; the wrapped handler is not called.
#[derive(Clone)]
pub struct ValidateLayer {
    check: Check,
}

impl ValidateLayer {
    pub fn new(check: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        Self {
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for ValidateLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidateLayer").finish_non_exhaustive()
    }
}

impl Layer<BoxedHandler> for ValidateLayer {
    type Service = BoxedHandler;

    fn layer(&self, inner: BoxedHandler) -> BoxedHandler {
        let check = Arc::clone(&self.check);
        Arc::new(
            move |ctx: Context| -> BoxFuture<'static, Option<Outcome>> {
                match check(ctx.params()) {
                    Ok(()) => inner(ctx),
                    Err(reason) => {
                        future::ready(Some(Err(BusError::Handler(HandlerError::new(reason)))))
                            .boxed()
                    }
                }
            },
        )
    }
}
