//! Calculator Example
//!
//! Serves a handful of `math.*` handlers below the `calc` namespace and calls
//! them both in-process and through the service bus.
//!
//! # Cascades
//!
//! `math.div` is guarded by a higher-priority handler that rejects a zero
//! divisor and otherwise hands the params on with `next`:
//!
//! ```text
//! math.div ─▶ guard (priority 10) ──next──▶ divide (priority 0)
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --package calculator
//! ```

use anyhow::Result;
use conduit::prelude::*;
use tracing::{error, info};

// ============================================================================
// Handler Functions
// ============================================================================

async fn add(Params(items): Params<Vec<f64>>) -> f64 {
    items.iter().sum()
}

async fn mul(Params(items): Params<Vec<f64>>) -> f64 {
    items.iter().product()
}

/// Rejects a zero divisor before the division runs.
async fn guard_div(ctx: Context) -> Result<Value, BusError> {
    let (_, divisor): (f64, f64) = ctx.params_as()?;
    if divisor == 0.0 {
        return Err(BusError::handler("division by zero"));
    }
    ctx.next(ctx.params().clone()).await
}

async fn div(Params((a, b)): Params<(f64, f64)>) -> f64 {
    a / b
}

/// Squares through the bus, so the nested call shows up as a child event.
async fn square(ctx: Context, Params(x): Params<f64>) -> Result<Value, BusError> {
    ctx.dispatch("math.mul", json!([x, x])).await
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let runtime = ConduitRuntime::builder().build()?;
    let bus = runtime.bus();

    bus.subscribe("math.add", add)?;
    bus.subscribe("math.mul", mul)?;
    bus.subscribe_with_priority("math.div", 10, guard_div)?;
    bus.subscribe("math.div", div)?;
    bus.subscribe("math.square", square)?;

    let _after = bus.on_after(Regex::new(r"^math\.")?, |after| {
        info!(
            topic = %after.event.identifier(),
            ok = after.outcome.is_ok(),
            "Dispatched"
        );
    })?;

    let sum = bus.dispatch("math.add", json!([1, 2, 3])).await?;
    info!(%sum, "In-process call");

    let math = runtime.service().extract("math")?;
    let square = math.call("square", json!(7)).await?;
    info!(%square, "Service call");

    match math.call("div", json!([1, 0])).await {
        Ok(value) => info!(%value, "Divided"),
        Err(e) => error!(error = %e, "Division failed"),
    }

    runtime.shutdown();
    Ok(())
}
