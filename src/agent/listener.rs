//! Buffers console messages the control loop cannot handle inline.

use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::console::dispatch::MessageDispatcher;
use crate::console::protocol::{StartMessage, WireMessage};
use crate::sync::{EventCondition, lock_unpoisoned};

/// Bit set classifying buffered console messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MessageMask(u32);

impl MessageMask {
    pub(crate) const NONE: MessageMask = MessageMask(0);
    pub(crate) const START: MessageMask = MessageMask(1);
    pub(crate) const RESET: MessageMask = MessageMask(1 << 1);
    pub(crate) const STOP: MessageMask = MessageMask(1 << 2);
    pub(crate) const SHUTDOWN: MessageMask = MessageMask(1 << 3);
    pub(crate) const ANY: MessageMask = MessageMask(0b1111);

    #[must_use]
    pub(crate) fn intersects(self, other: MessageMask) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MessageMask {
    type Output = MessageMask;

    fn bitor(self, other: MessageMask) -> MessageMask {
        MessageMask(self.0 | other.0)
    }
}

impl BitOrAssign for MessageMask {
    fn bitor_assign(&mut self, other: MessageMask) {
        self.0 |= other.0;
    }
}

impl BitAnd for MessageMask {
    type Output = MessageMask;

    fn bitand(self, other: MessageMask) -> MessageMask {
        MessageMask(self.0 & other.0)
    }
}

impl Not for MessageMask {
    type Output = MessageMask;

    fn not(self) -> MessageMask {
        MessageMask(!self.0 & MessageMask::ANY.0)
    }
}

#[derive(Debug)]
struct ListenerState {
    received: MessageMask,
    last_start: Option<StartMessage>,
    shutdown: bool,
}

impl Default for ListenerState {
    fn default() -> Self {
        Self {
            received: MessageMask::NONE,
            last_start: None,
            shutdown: false,
        }
    }
}

/// Classifies inbound console messages into [`MessageMask`] bits and keeps
/// the most recent start payload.
///
/// `received` is non-consuming; `check_for_message` consumes the intersecting
/// bits. All state changes are signalled on the shared event condition.
pub(crate) struct ConsoleListener {
    condition: Arc<EventCondition>,
    state: Mutex<ListenerState>,
}

impl ConsoleListener {
    pub(crate) fn new(condition: Arc<EventCondition>) -> Self {
        Self {
            condition,
            state: Mutex::new(ListenerState::default()),
        }
    }

    /// True iff any buffered message class intersects `mask`. Non-consuming.
    pub(crate) fn received(&self, mask: MessageMask) -> bool {
        lock_unpoisoned(&self.state).received.intersects(mask)
    }

    /// Consuming variant: clears and reports the intersecting bits.
    pub(crate) fn check_for_message(&self, mask: MessageMask) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        let intersection = state.received & mask;
        if intersection.is_empty() {
            return false;
        }
        state.received = state.received & !mask;
        true
    }

    /// Blocks until any message arrives or the listener is shut down.
    pub(crate) async fn wait_for_message(&self) {
        let mut waiter = self.condition.subscribe();
        loop {
            {
                let state = lock_unpoisoned(&self.state);
                if state.shutdown || !state.received.is_empty() {
                    return;
                }
            }
            waiter.wait().await;
        }
    }

    /// Returns the most recent start payload, clearing the `START` bit.
    pub(crate) fn last_start_message(&self) -> Option<StartMessage> {
        let mut state = lock_unpoisoned(&self.state);
        state.received = state.received & !MessageMask::START;
        state.last_start.clone()
    }

    /// Clears the bits in `mask`; a discarded `START` also drops its payload.
    pub(crate) fn discard_messages(&self, mask: MessageMask) {
        let mut state = lock_unpoisoned(&self.state);
        state.received = state.received & !mask;
        if mask.intersects(MessageMask::START) {
            state.last_start = None;
        }
    }

    /// Installs handlers that set the matching bit (and record the start
    /// payload) then signal the shared condition.
    pub(crate) fn register_message_handlers(self: &Arc<Self>, dispatcher: &mut MessageDispatcher) {
        let listener = Arc::clone(self);
        dispatcher.add_handler(Box::new(move |message| {
            let mask = match message {
                WireMessage::Start(start) => {
                    listener.record_start((**start).clone());
                    return Ok(true);
                }
                WireMessage::Reset => MessageMask::RESET,
                WireMessage::Stop => MessageMask::STOP,
                WireMessage::Shutdown => MessageMask::SHUTDOWN,
                _ => return Ok(false),
            };
            listener.raise(mask);
            Ok(true)
        }));
    }

    /// Marks the listener terminal; pending and future waits return
    /// immediately with the `SHUTDOWN` bit raised.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.shutdown = true;
            state.received |= MessageMask::SHUTDOWN;
        }
        debug!("Console listener shut down");
        self.condition.signal();
    }

    fn record_start(&self, start: StartMessage) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.received |= MessageMask::START;
            state.last_start = Some(start);
        }
        self.condition.signal();
    }

    fn raise(&self, mask: MessageMask) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.received |= mask;
        }
        self.condition.signal();
    }
}
