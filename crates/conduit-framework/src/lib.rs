//! # Conduit Framework
//!
//! The in-process half of the Conduit message bus.
//!
//! This layer provides:
//! - [`Bus`]: subscribe, dispatch, publish, lookup and lifecycle hooks
//! - The [`Handler`] trait for Axum-style argument extraction
//! - The cascade engine with its [`Next`] continuation and settlement rules
//! - Handler pipeline layers built on `tower-layer`
//!
//! Topic grammar, registry, messages and the settlement gate come from
//! `conduit-core`.

pub mod bus;
pub mod cascade;
pub mod context;
pub mod error;
pub mod extractor;
pub mod handler;
pub mod hooks;
pub mod lookup;
pub mod pipeline;

pub use bus::{Bus, DispatchRequest, Middleware, RouteBuilder, Subscription};
pub use cascade::{HandlerQueue, Next};
pub use context::{Context, Lineage, Responder};
pub use error::{ExtractError, ExtractResult};
pub use extractor::{FromContext, HandlerMeta, Params, Payload};
pub use handler::{BoxedHandler, Handler, IntoSettlement, Json, into_handler};
pub use hooks::{AfterDispatch, BeforeDispatch, ErrorReport, SubscriptionChange};
pub use lookup::{Lookup, Method};
pub use pipeline::{BoxedLayer, DefaultParamsLayer, ValidateLayer};
