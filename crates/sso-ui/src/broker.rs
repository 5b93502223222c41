use crate::connection::UiAgentConnection;
use sso_dictionary::Dictionary;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// The stable opaque id a caller is routed by. Per spec.md §9's Open
/// Question, the original routes refresh signals by the caller's type
/// name; we use a stable opaque id instead (recorded as a decision in
/// DESIGN.md), since whether an existing UI agent depends on the
/// type-name form specifically is left unclear by the source.
pub type CallerId = String;

/// Delivered to whichever session is waiting on a `query`'s result.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Final(Dictionary),
    Refresh(Dictionary),
}

struct Pending {
    caller: CallerId,
    data: Dictionary,
    sender: mpsc::UnboundedSender<BrokerEvent>,
}

struct State {
    active: Option<Pending>,
    queue: VecDeque<Pending>,
}

const IDLE_CLOSE: Duration = Duration::from_secs(10);

/// Serializes UI interactions across sessions (spec.md §4.5). At most
/// one request is active system-wide; further requests queue FIFO.
/// The connection to the UI agent is established lazily and torn down
/// after a 10-second idle timer once the queue drains.
pub struct UiBroker {
    agent: Arc<dyn UiAgentConnection>,
    state: Mutex<State>,
    close_generation: AtomicU64,
}

impl UiBroker {
    pub fn new(agent: Arc<dyn UiAgentConnection>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            state: Mutex::new(State {
                active: None,
                queue: VecDeque::new(),
            }),
            close_generation: AtomicU64::new(0),
        })
    }

    /// Enqueues a UI request on behalf of `caller`. If the broker is
    /// idle, dispatches immediately; otherwise the request waits its
    /// turn in FIFO order. Returns a channel on which the eventual
    /// `Final` response (or an interleaved `Refresh`, for callers that
    /// care) is delivered.
    pub async fn query(
        self: &Arc<Self>,
        caller: CallerId,
        data: Dictionary,
    ) -> mpsc::UnboundedReceiver<BrokerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.close_generation.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        let pending = Pending {
            caller,
            data,
            sender: tx,
        };
        if state.active.is_none() {
            self.dispatch(&mut state, pending).await;
        } else {
            state.queue.push_back(pending);
        }
        rx
    }

    async fn dispatch(&self, state: &mut State, pending: Pending) {
        if let Err(err) = self.agent.connect().await {
            tracing::warn!(caller = %pending.caller, %err, "ui agent connect failed");
            let _ = pending.sender.send(BrokerEvent::Final(Dictionary::new()));
            return;
        }
        if let Err(err) = self.agent.send(&pending.caller, &pending.data).await {
            tracing::warn!(caller = %pending.caller, %err, "ui agent send failed");
        }
        state.active = Some(pending);
    }

    /// Sends a refresh to the active request's caller. Allowed only if
    /// `caller` matches the active request; per spec.md §4.5, this
    /// fails silently (returns without error) if there is no matching
    /// active request.
    pub async fn refresh(&self, caller: &CallerId, data: Dictionary) {
        let state = self.state.lock().await;
        let Some(active) = &state.active else {
            tracing::debug!(%caller, "refresh with no active ui request, ignored");
            return;
        };
        if &active.caller != caller {
            tracing::warn!(
                %caller, active_caller = %active.caller,
                "refresh id does not match the active caller, discarded"
            );
            return;
        }
        if let Err(err) = self.agent.send(caller, &data).await {
            tracing::warn!(%caller, %err, "ui agent refresh send failed");
        }
    }

    /// Cancels `caller`'s request, whether active or still queued. A
    /// queued cancellation resolves with a synthetic canceled-final
    /// event on the caller's channel rather than ever reaching the UI
    /// agent; an active cancellation advances the queue immediately.
    pub async fn cancel(self: &Arc<Self>, caller: &CallerId) {
        let mut state = self.state.lock().await;

        if let Some(active) = &state.active {
            if &active.caller == caller {
                let active = state.active.take().unwrap();
                let _ = active.sender.send(BrokerEvent::Final(Dictionary::new()));
                self.advance(&mut state).await;
                return;
            }
        }

        if let Some(pos) = state.queue.iter().position(|p| &p.caller == caller) {
            let queued = state.queue.remove(pos).unwrap();
            let _ = queued.sender.send(BrokerEvent::Final(Dictionary::new()));
        }
    }

    /// Delivers the active request's final response and advances the
    /// queue. Called by whatever drives the raw UI agent connection
    /// (a D-Bus listener, a test harness) when the agent reports a
    /// result for the currently active caller.
    pub async fn deliver_final(self: &Arc<Self>, data: Dictionary) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.take() {
            let _ = active.sender.send(BrokerEvent::Final(data));
        }
        self.advance(&mut state).await;
    }

    /// Routes a refresh signal from the UI agent to the active
    /// caller, provided `caller_hint` (the opaque id the agent echoes
    /// back) matches. Mismatches are discarded with a warning per
    /// spec.md §4.5.
    pub async fn deliver_refresh(&self, caller_hint: &str, data: Dictionary) {
        let state = self.state.lock().await;
        match &state.active {
            Some(active) if active.caller == caller_hint => {
                let _ = active.sender.send(BrokerEvent::Refresh(data));
            }
            _ => {
                tracing::warn!(caller_hint, "refresh id does not match active caller, dropping");
            }
        }
    }

    async fn advance(self: &Arc<Self>, state: &mut State) {
        if let Some(next) = state.queue.pop_front() {
            self.dispatch(state, next).await;
            return;
        }

        let generation = self.close_generation.load(Ordering::SeqCst);
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(IDLE_CLOSE).await;
            // If a new query arrived in the meantime, `query` bumped
            // the generation counter; skip closing a connection that's
            // back in active use.
            if broker.close_generation.load(Ordering::SeqCst) == generation {
                let state = broker.state.lock().await;
                if state.active.is_none() && state.queue.is_empty() {
                    broker.agent.disconnect().await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NullUiAgent;

    fn dict() -> Dictionary {
        Dictionary::new()
    }

    #[tokio::test]
    async fn query_dispatches_immediately_when_idle() {
        let agent = Arc::new(NullUiAgent::new());
        let broker = UiBroker::new(agent.clone());
        let _rx = broker.query("s1".into(), dict()).await;
        assert!(agent.is_connected());
        assert_eq!(agent.last_sent().unwrap().0, "s1");
    }

    #[tokio::test]
    async fn second_query_waits_in_queue() {
        let agent = Arc::new(NullUiAgent::new());
        let broker = UiBroker::new(agent.clone());
        let _rx1 = broker.query("s1".into(), dict()).await;
        let _rx2 = broker.query("s2".into(), dict()).await;
        // s1 is still the one dispatched to the agent; s2 waits.
        assert_eq!(agent.last_sent().unwrap().0, "s1");
    }

    #[tokio::test]
    async fn final_response_advances_queue_in_order() {
        let agent = Arc::new(NullUiAgent::new());
        let broker = UiBroker::new(agent.clone());
        let mut rx1 = broker.query("s1".into(), dict()).await;
        let mut rx2 = broker.query("s2".into(), dict()).await;

        broker.deliver_final(dict()).await;
        let ev1 = rx1.recv().await.unwrap();
        assert_eq!(ev1, BrokerEvent::Final(dict()));
        assert_eq!(agent.last_sent().unwrap().0, "s2");

        broker.deliver_final(dict()).await;
        let ev2 = rx2.recv().await.unwrap();
        assert_eq!(ev2, BrokerEvent::Final(dict()));
    }

    #[tokio::test]
    async fn refresh_mismatched_caller_is_discarded() {
        let agent = Arc::new(NullUiAgent::new());
        let broker = UiBroker::new(agent.clone());
        let mut rx = broker.query("s1".into(), dict()).await;
        broker.deliver_refresh("wrong-caller", dict()).await;
        // nothing delivered; draining with a short timeout proves it.
        let res = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn refresh_matching_caller_is_delivered() {
        let agent = Arc::new(NullUiAgent::new());
        let broker = UiBroker::new(agent.clone());
        let mut rx = broker.query("s1".into(), dict()).await;
        broker.deliver_refresh("s1", dict()).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, BrokerEvent::Refresh(dict()));
    }

    #[tokio::test]
    async fn cancel_queued_request_synthesizes_final() {
        let agent = Arc::new(NullUiAgent::new());
        let broker = UiBroker::new(agent.clone());
        let _rx1 = broker.query("s1".into(), dict()).await;
        let mut rx2 = broker.query("s2".into(), dict()).await;

        broker.cancel(&"s2".to_string()).await;
        let ev = rx2.recv().await.unwrap();
        assert_eq!(ev, BrokerEvent::Final(dict()));
    }

    #[tokio::test]
    async fn cancel_active_request_advances_queue() {
        let agent = Arc::new(NullUiAgent::new());
        let broker = UiBroker::new(agent.clone());
        let mut rx1 = broker.query("s1".into(), dict()).await;
        let _rx2 = broker.query("s2".into(), dict()).await;

        broker.cancel(&"s1".to_string()).await;
        let ev = rx1.recv().await.unwrap();
        assert_eq!(ev, BrokerEvent::Final(dict()));
        assert_eq!(agent.last_sent().unwrap().0, "s2");
    }
}
