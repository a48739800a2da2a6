//! At-most-once settlement gate.
//!
//! A [`Settlement`] moves from `Pending` to `Settled` exactly once through an
//! atomic compare-and-set. The first attempt resolves the paired
//! [`SettlementReceiver`]; every later attempt fails with
//! [`BusError::DoubleSettlement`] and changes nothing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{BusError, BusResult, Outcome};

const PENDING: u8 = 0;
const SETTLED: u8 = 1;

/// Observable state of a settlement gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Pending,
    Settled,
}

/// The write half of a one-shot result.
#[derive(Debug)]
pub struct Settlement {
    state: AtomicU8,
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Settlement {
    /// Creates a gate and the receiver it resolves.
    pub fn channel() -> (Arc<Settlement>, SettlementReceiver) {
        let (tx, rx) = oneshot::channel();
        let gate = Arc::new(Settlement {
            state: AtomicU8::new(PENDING),
            tx: Mutex::new(Some(tx)),
        });
        (gate, SettlementReceiver { rx })
    }

    /// Settles the gate.
    ///
    /// Only the first call wins. A receiver that was already dropped does not
    /// make the call fail.
    pub fn settle(&self, outcome: Outcome) -> BusResult<()> {
        if self
            .state
            .compare_exchange(PENDING, SETTLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Rejected second settlement");
            return Err(BusError::DoubleSettlement);
        }

        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> SettlementState {
        match self.state.load(Ordering::Acquire) {
            PENDING => SettlementState::Pending,
            _ => SettlementState::Settled,
        }
    }

    /// Returns `true` once the gate has been settled.
    pub fn is_settled(&self) -> bool {
        self.state() == SettlementState::Settled
    }
}

/// The read half of a settlement gate.
///
/// Resolves with the settled outcome, or with `null` when every handle to
/// the gate was dropped without settling.
#[derive(Debug)]
pub struct SettlementReceiver {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for SettlementReceiver {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Ok(Value::Null)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let (gate, rx) = Settlement::channel();
        assert_eq!(gate.state(), SettlementState::Pending);

        assert_ok!(gate.settle(Ok(json!("first"))));
        let second = gate.settle(Ok(json!("second")));
        assert!(matches!(second, Err(BusError::DoubleSettlement)));
        assert!(gate.is_settled());

        assert_eq!(rx.await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_error_then_value_is_rejected() {
        let (gate, rx) = Settlement::channel();
        assert_ok!(gate.settle(Err(BusError::handler("nope"))));
        assert_err!(gate.settle(Ok(json!(1))));

        let err = rx.await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn test_dropped_gate_resolves_null() {
        let (gate, rx) = Settlement::channel();
        drop(gate);
        assert_eq!(rx.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_settle_after_receiver_dropped() {
        let (gate, rx) = Settlement::channel();
        drop(rx);
        assert_ok!(gate.settle(Ok(json!(1))));
        assert_err!(gate.settle(Ok(json!(2))));
    }

    #[tokio::test]
    async fn test_concurrent_settlers_one_winner() {
        let (gate, rx) = Settlement::channel();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move { gate.settle(Ok(json!(i))).is_ok() }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(rx.await.is_ok());
    }
}
