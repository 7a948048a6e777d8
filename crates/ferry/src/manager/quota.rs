//! Storage-quota negotiation.
//!
//! When the persistent chunk store refuses a write the manager asks a
//! [`QuotaHandler`] whether to give up or to keep going with process memory.
//! The answer is requested at most once per manager: concurrent failures wait
//! for the same pending answer, and every later failure reuses it. The handler
//! runs on its own task, so a waiter that gives up does not withdraw the
//! question.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};

/// What to do once persistent storage is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum QuotaDecision {
    /// Fail the affected downloads.
    Abort,
    /// Keep downloading into process memory for the rest of the session.
    ContinueInMemory,
}

/// Details handed to a [`QuotaHandler`].
#[derive(Debug, Clone)]
pub struct QuotaContext {
    /// Download that hit the failure first.
    pub url: String,
    /// Whether the store reported an exhausted quota rather than another failure.
    pub quota_exceeded: bool,
    pub reason: String,
}

/// Decides how to proceed when persistent storage is unavailable, usually by
/// asking the user.
#[async_trait]
pub trait QuotaHandler: Send + Sync {
    async fn decide(&self, context: QuotaContext) -> QuotaDecision;
}

/// A fixed answer.
#[async_trait]
impl QuotaHandler for QuotaDecision {
    async fn decide(&self, _context: QuotaContext) -> QuotaDecision {
        *self
    }
}

#[derive(Default)]
pub(crate) struct QuotaNegotiator {
    handler: RwLock<Option<Arc<dyn QuotaHandler>>>,
    /// Set once the handler has been asked; resolves to the decision.
    decision: Mutex<Option<watch::Receiver<Option<QuotaDecision>>>>,
}

impl QuotaNegotiator {
    pub(crate) fn set_handler(&self, handler: Arc<dyn QuotaHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn decision(&self) -> Option<QuotaDecision> {
        self.decision
            .lock()
            .as_ref()
            .and_then(|receiver| *receiver.borrow())
    }

    /// The sticky decision, asking the handler if none was made yet.
    ///
    /// Returns `None` when no handler is registered; nothing is recorded then,
    /// so a handler registered later is still consulted.
    pub(crate) async fn negotiate(&self, context: QuotaContext) -> Option<QuotaDecision> {
        let mut receiver = {
            let mut pending = self.decision.lock();
            match pending.as_ref() {
                Some(receiver) => receiver.clone(),
                None => {
                    let handler = self.handler.read().clone()?;
                    let receiver = ask(handler, context);
                    *pending = Some(receiver.clone());
                    receiver
                }
            }
        };

        let outcome = receiver.wait_for(Option::is_some).await.map(|decision| *decision);
        match outcome {
            Ok(decision) => decision,
            Err(_) => {
                // The handler task died without answering; allow asking again.
                warn!("Storage quota handler gave no decision");
                let mut pending = self.decision.lock();
                if pending.as_ref().is_some_and(|current| current.same_channel(&receiver)) {
                    *pending = None;
                }
                None
            }
        }
    }
}

/// Run `handler` on its own task and publish its answer.
fn ask(
    handler: Arc<dyn QuotaHandler>,
    context: QuotaContext,
) -> watch::Receiver<Option<QuotaDecision>> {
    let (sender, receiver) = watch::channel(None);
    tokio::spawn(async move {
        let url = context.url.clone();
        let decision = handler.decide(context).await;
        info!(url = %url, ?decision, "Storage quota decision made");
        sender.send_replace(Some(decision));
    });
    receiver
}
