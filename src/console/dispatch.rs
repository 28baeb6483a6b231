//! Inbound message routing.
//!
//! The pump hands every console message to a dispatcher: an ordered chain of
//! handlers, each of which may consume the message, with an optional fallback
//! sink for whatever falls through. The file store's dispatcher falls back to
//! a tee of the agent's own listener and the worker fan-out (the latter
//! wrapped so the file-store pipeline cannot shut the fan-out down).

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::AgentResult;
use crate::sync::lock_unpoisoned;

use super::protocol::WireMessage;

pub(crate) trait MessageSink: Send + Sync {
    fn send(&self, message: &WireMessage) -> AgentResult<()>;

    fn shutdown(&self) {}
}

pub(crate) type MessageHandler = Box<dyn Fn(&WireMessage) -> AgentResult<bool> + Send + Sync>;

/// Chain of `(handler, ..., fallback)`. Handlers run in registration order;
/// the first to return `Ok(true)` consumes the message.
pub(crate) struct MessageDispatcher {
    handlers: Vec<MessageHandler>,
    fallback: Option<Box<dyn MessageSink>>,
}

impl MessageDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Vec::new(),
            fallback: None,
        }
    }

    pub(crate) fn add_handler(&mut self, handler: MessageHandler) {
        self.handlers.push(handler);
    }

    pub(crate) fn set_fallback(&mut self, sink: Box<dyn MessageSink>) {
        self.fallback = Some(sink);
    }
}

impl MessageSink for MessageDispatcher {
    fn send(&self, message: &WireMessage) -> AgentResult<()> {
        for handler in &self.handlers {
            if handler(message)? {
                return Ok(());
            }
        }
        if let Some(fallback) = &self.fallback {
            fallback.send(message)?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(fallback) = &self.fallback {
            fallback.shutdown();
        }
    }
}

/// Sends every message to both arms; shutdown reaches both arms too.
pub(crate) struct TeeSink {
    first: Box<dyn MessageSink>,
    second: Box<dyn MessageSink>,
}

impl TeeSink {
    pub(crate) fn new(first: Box<dyn MessageSink>, second: Box<dyn MessageSink>) -> Self {
        Self { first, second }
    }
}

impl MessageSink for TeeSink {
    fn send(&self, message: &WireMessage) -> AgentResult<()> {
        self.first.send(message)?;
        self.second.send(message)
    }

    fn shutdown(&self) {
        self.first.shutdown();
        self.second.shutdown();
    }
}

/// Forwards messages but swallows shutdown, so tearing down an enclosing
/// pipeline does not close the wrapped sink.
pub(crate) struct IgnoreShutdownSink<S> {
    inner: S,
}

impl<S> IgnoreShutdownSink<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> MessageSink for IgnoreShutdownSink<S>
where
    S: MessageSink,
{
    fn send(&self, message: &WireMessage) -> AgentResult<()> {
        self.inner.send(message)
    }

    fn shutdown(&self) {
        // Deliberately not forwarded.
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FanOutEvent {
    Message(WireMessage),
    Close,
}

/// Broadcasts control messages to every live worker's control stream.
///
/// Workers subscribe at creation; a subscription whose receiver is gone is
/// dropped on the next broadcast. `shutdown` closes every stream, which
/// workers treat as an instruction to exit.
#[derive(Debug, Default)]
pub(crate) struct FanOutSender {
    workers: Mutex<Vec<mpsc::UnboundedSender<FanOutEvent>>>,
}

impl FanOutSender {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<FanOutEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_unpoisoned(&self.workers).push(tx);
        rx
    }

    pub(crate) fn broadcast(&self, message: &WireMessage) {
        lock_unpoisoned(&self.workers)
            .retain(|worker| worker.send(FanOutEvent::Message(message.clone())).is_ok());
    }

    pub(crate) fn shutdown(&self) {
        let mut workers = lock_unpoisoned(&self.workers);
        for worker in workers.drain(..) {
            if worker.send(FanOutEvent::Close).is_err() {
                debug!("Worker control stream already gone during fan-out shutdown");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.workers).len()
    }
}

/// `MessageSink` adapter over a shared fan-out sender.
pub(crate) struct FanOutSink(pub(crate) std::sync::Arc<FanOutSender>);

impl MessageSink for FanOutSink {
    fn send(&self, message: &WireMessage) -> AgentResult<()> {
        self.0.broadcast(message);
        Ok(())
    }

    fn shutdown(&self) {
        self.0.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingSink {
        sent: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            })
        }
    }

    impl MessageSink for Arc<CountingSink> {
        fn send(&self, _message: &WireMessage) -> AgentResult<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn consumed_messages_do_not_reach_the_fallback() -> AgentResult<()> {
        let fallback = CountingSink::new();
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.add_handler(Box::new(|message| {
            Ok(matches!(message, WireMessage::Stop))
        }));
        dispatcher.set_fallback(Box::new(Arc::clone(&fallback)));

        dispatcher.send(&WireMessage::Stop)?;
        assert_eq!(fallback.sent.load(Ordering::SeqCst), 0);

        dispatcher.send(&WireMessage::Reset)?;
        assert_eq!(fallback.sent.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn tee_delivers_to_both_arms_and_ignore_shutdown_shields_one() -> AgentResult<()> {
        let left = CountingSink::new();
        let right = CountingSink::new();
        let tee = TeeSink::new(
            Box::new(Arc::clone(&left)),
            Box::new(IgnoreShutdownSink::new(Arc::clone(&right))),
        );

        tee.send(&WireMessage::Shutdown)?;
        assert_eq!(left.sent.load(Ordering::SeqCst), 1);
        assert_eq!(right.sent.load(Ordering::SeqCst), 1);

        tee.shutdown();
        assert_eq!(left.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(right.shutdowns.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn fan_out_drops_dead_subscribers_and_closes_on_shutdown() {
        let fan_out = FanOutSender::new();
        let mut live = fan_out.subscribe();
        let dead = fan_out.subscribe();
        drop(dead);

        fan_out.broadcast(&WireMessage::Stop);
        assert_eq!(fan_out.subscriber_count(), 1);
        assert!(matches!(
            live.try_recv(),
            Ok(FanOutEvent::Message(WireMessage::Stop))
        ));

        fan_out.shutdown();
        assert!(matches!(live.try_recv(), Ok(FanOutEvent::Close)));
        assert_eq!(fan_out.subscriber_count(), 0);
    }
}
