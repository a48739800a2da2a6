//! The cascade engine.
//!
//! A dispatch resolves to an immutable, priority ordered queue of
//! registrations. The cascade invokes the first one with a [`Next`]
//! continuation bound to the rest of the queue; handler N+1 only starts when
//! handler N calls `next`. Each handler owns a settlement gate and the
//! caller of a position receives whatever that handler settled.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, trace};

use conduit_core::{
    BusError, BusResult, Event, HandlerError, Outcome, Registration, Settlement,
};

use crate::bus::Bus;
use crate::context::{Context, Lineage};
use crate::handler::BoxedHandler;
use crate::hooks::ErrorReport;

/// Snapshot of the registrations a dispatch runs through.
pub type HandlerQueue = Arc<[Arc<Registration<BoxedHandler>>]>;

// =============================================================================
// Next
// =============================================================================

/// Continuation to the remaining handlers of a cascade.
///
/// The queue is a snapshot, so running the same continuation twice runs the
/// remaining handlers twice.
#[derive(Clone)]
pub struct Next {
    queue: HandlerQueue,
    index: usize,
    lineage: Lineage,
    bus: Bus,
}

impl Next {
    /// Runs the next handler with `params` and resolves with its settlement.
    pub async fn run(&self, params: Value) -> Outcome {
        run(
            Arc::clone(&self.queue),
            self.index,
            params,
            self.lineage.clone(),
            self.bus.clone(),
        )
        .await
    }

    /// Number of handlers left, including the next one.
    pub fn remaining(&self) -> usize {
        self.queue.len().saturating_sub(self.index)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &self.remaining())
            .finish()
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Runs the handler at `index` and resolves with its settlement.
///
/// Past the end of the queue the params are returned unchanged.
pub(crate) fn run(
    queue: HandlerQueue,
    index: usize,
    params: Value,
    lineage: Lineage,
    bus: Bus,
) -> BoxFuture<'static, Outcome> {
    async move {
        let Some(registration) = queue.get(index).map(Arc::clone) else {
            return Ok(params);
        };

        let event = Arc::clone(&lineage.event);
        event.record_call(params.clone(), registration.meta().clone());

        let next = (index + 1 < queue.len()).then(|| Next {
            queue: Arc::clone(&queue),
            index: index + 1,
            lineage: lineage.clone(),
            bus: bus.clone(),
        });

        let (gate, receiver) = Settlement::channel();
        let ctx = Context::new(
            params,
            registration.meta().clone(),
            lineage,
            Arc::clone(&gate),
            next,
            bus.clone(),
        );

        trace!(
            position = index,
            priority = registration.priority(),
            matcher = %registration.matcher(),
            "Invoking handler"
        );

        let handler = Arc::clone(registration.handler());
        let returned = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            Ok(returned) => returned,
            Err(payload) => {
                let err = HandlerError::from_panic(payload);
                error!(error = %err, matcher = %registration.matcher(), "Handler panicked");
                Some(Err(BusError::Handler(err)))
            }
        };

        if let Some(outcome) = returned {
            if let Err(err) = settle(&gate, outcome, &bus, &event) {
                error!(
                    matcher = %registration.matcher(),
                    "Handler returned a result after it was already settled"
                );
                bus.hooks().emit_error(&ErrorReport {
                    error: err,
                    event: Some(event),
                });
            }
        }

        // Only outstanding responders keep the gate open from here on.
        drop(gate);
        receiver.await
    }
    .boxed()
}

/// Runs a single registration without a continuation.
pub(crate) fn run_single(
    registration: Arc<Registration<BoxedHandler>>,
    params: Value,
    lineage: Lineage,
    bus: Bus,
) -> BoxFuture<'static, Outcome> {
    run(Arc::from(vec![registration]), 0, params, lineage, bus)
}

/// Settles a gate and mirrors failures onto the error channel.
pub(crate) fn settle(
    gate: &Settlement,
    outcome: Outcome,
    bus: &Bus,
    event: &Arc<Event>,
) -> BusResult<()> {
    let failure = outcome.as_ref().err().cloned();
    gate.settle(outcome)?;

    if let Some(err) = failure {
        debug!(error = %err, uid = %event.uid(), "Handler settled with an error");
        bus.hooks().emit_error(&ErrorReport {
            error: err,
            event: Some(Arc::clone(event)),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::extractor::Payload;
    use crate::handler::Json;
    use conduit_core::Regex;

    fn text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn append(bus: &Bus, priority: i64, token: &'static str) {
        bus.subscribe_with_priority("test", priority, move |ctx: Context| async move {
            let params = format!("{} {token}", text(ctx.params()));
            ctx.next(json!(params)).await
        })
        .unwrap();
    }

    fn collect_errors(bus: &Bus) -> (Arc<Mutex<Vec<String>>>, conduit_core::ListenerHandle) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handle = bus.on_error(move |report| sink.lock().push(report.error.kind().to_string()));
        (errors, handle)
    }

    #[tokio::test]
    async fn test_priorities_run_highest_first() {
        let bus = Bus::new();
        append(&bus, 100, "3");
        append(&bus, 10, "4");
        append(&bus, 5, "5");
        append(&bus, 1000, "2");
        append(&bus, 10000, "1");

        let result = bus.dispatch("test", json!(0)).await.unwrap();
        assert_eq!(result, json!("0 1 2 3 4 5"));
    }

    #[tokio::test]
    async fn test_patterns_and_ties() {
        let bus = Bus::new();
        let pattern = Regex::new("st$").unwrap();

        bus.subscribe(Regex::new("^te").unwrap(), || async { "works" })
            .unwrap();
        bus.subscribe("test", |ctx: Context| async move {
            let rest = ctx.next(Value::Null).await?;
            Ok::<_, BusError>(json!(format!("still {}", text(&rest))))
        })
        .unwrap();
        bus.subscribe(pattern.clone(), |ctx: Context| async move {
            let rest = ctx.next(Value::Null).await?;
            Ok::<_, BusError>(json!(format!("t {}", text(&rest))))
        })
        .unwrap();
        bus.subscribe(pattern, |ctx: Context| async move {
            let rest = ctx.next(Value::Null).await?;
            Ok::<_, BusError>(json!(format!("i{}", text(&rest))))
        })
        .unwrap();

        // Exact and pattern registrations share one tie order
        assert_eq!(
            bus.dispatch("test", Value::Null).await.unwrap(),
            json!("it still works")
        );
    }

    #[tokio::test]
    async fn test_last_handler_has_no_next() {
        let bus = Bus::new();
        bus.subscribe("test", |ctx: Context| async move { ctx.has_next() })
            .unwrap();
        bus.subscribe_with_priority("test", 2, |ctx: Context| async move {
            let last_has_next = ctx.next(Value::Null).await?;
            Ok::<_, BusError>(json!([ctx.has_next(), last_has_next]))
        })
        .unwrap();

        let result = bus.dispatch("test", Value::Null).await.unwrap();
        assert_eq!(result, json!([true, false]));
    }

    #[tokio::test]
    async fn test_reply_then_return_reports_double_settlement() {
        let bus = Bus::new();
        let (errors, _guard) = collect_errors(&bus);
        bus.subscribe("test", |ctx: Context| async move {
            ctx.reply("first").unwrap();
            "second"
        })
        .unwrap();

        assert_eq!(bus.dispatch("test", Value::Null).await.unwrap(), json!("first"));
        assert_eq!(*errors.lock(), ["double_settlement"]);
    }

    #[tokio::test]
    async fn test_second_reply_is_rejected() {
        let bus = Bus::new();
        let second = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&second);
        bus.subscribe("test", move |ctx: Context| {
            let seen = Arc::clone(&seen);
            async move {
                ctx.reply(json!(1)).unwrap();
                *seen.lock() = Some(ctx.reply(json!(2)));
            }
        })
        .unwrap();

        assert_eq!(bus.dispatch("test", Value::Null).await.unwrap(), json!(1));
        assert!(matches!(
            second.lock().take(),
            Some(Err(BusError::DoubleSettlement))
        ));
    }

    #[tokio::test]
    async fn test_reply_with_error_rejects() {
        let bus = Bus::new();
        let (errors, _guard) = collect_errors(&bus);
        bus.subscribe("test", |ctx: Context| async move {
            ctx.reply(Err::<Value, _>(BusError::handler("it doesn't work!")))
                .unwrap();
        })
        .unwrap();

        let err = bus.dispatch("test", Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "it doesn't work!");
        assert_eq!(*errors.lock(), ["handler"]);
    }

    #[tokio::test]
    async fn test_error_stops_the_cascade() {
        let bus = Bus::new();
        let reached = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reached);
        bus.subscribe("test", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        bus.subscribe_with_priority("test", 5, || async {
            Err::<Value, _>(std::io::Error::other("disk full"))
        })
        .unwrap();

        let err = bus.dispatch("test", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "handler");
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_settles_with_error() {
        let bus = Bus::new();
        bus.subscribe("test", |Payload(params): Payload| async move {
            if params.is_null() {
                panic!("boom");
            }
        })
        .unwrap();

        let err = bus.dispatch("test", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "handler");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_silent_handler_resolves_null() {
        let bus = Bus::new();
        bus.subscribe("test", || async {}).unwrap();
        assert_eq!(bus.dispatch("test", json!(1)).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_responder_settles_from_another_task() {
        let bus = Bus::new();
        bus.subscribe("test", |ctx: Context| async move {
            let responder = ctx.responder();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                responder.reply(Json(vec!["late"])).unwrap();
            });
        })
        .unwrap();

        assert_eq!(
            bus.dispatch("test", Value::Null).await.unwrap(),
            json!(["late"])
        );
    }

    #[tokio::test]
    async fn test_next_twice_reruns_the_rest() {
        let bus = Bus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.subscribe("test", move || {
            let counter = Arc::clone(&counter);
            async move { json!(counter.fetch_add(1, Ordering::SeqCst) + 1) }
        })
        .unwrap();
        bus.subscribe_with_priority("test", 2, |ctx: Context| async move {
            let first = ctx.next(Value::Null).await?;
            let second = ctx.next(Value::Null).await?;
            Ok::<_, BusError>(json!([first, second]))
        })
        .unwrap();

        let result = bus.dispatch("test", Value::Null).await.unwrap();
        assert_eq!(result, json!([1, 2]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_self_calls_are_recorded() {
        let bus = Bus::new();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        let _after = bus
            .on_after("test", move |after| {
                sink.lock().extend(after.event.self_calls());
            })
            .unwrap();

        bus.route("test")
            .meta("name", "inner")
            .handler(|| async { "done" })
            .unwrap();
        bus.route("test")
            .priority(3)
            .meta("name", "outer")
            .handler(|ctx: Context| async move { ctx.next(json!({"step": 2})).await })
            .unwrap();

        bus.dispatch("test", json!({"step": 1})).await.unwrap();

        let calls = recorded.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].handler_meta["name"], "outer");
        assert_eq!(calls[0].params, json!({"step": 1}));
        assert_eq!(calls[1].handler_meta["name"], "inner");
        assert_eq!(calls[1].params, json!({"step": 2}));
    }
}
