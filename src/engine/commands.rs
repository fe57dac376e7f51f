//! Engine Events
//!
//! Notifications that flow from the engine (usually the audio thread) to the
//! control side. They travel through an rtrb ring buffer so that sending never
//! blocks on the receiver.

use std::sync::Arc;

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

/// Default capacity of the event queue.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Events sent from the engine to the control thread.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Informational message for the user.
    Inform(String),

    /// A machine's `execute` failed and the period was replaced by silence.
    ExecuteFailed {
        /// Machine instance name.
        machine: String,
        /// Error message.
        message: String,
    },

    /// A machine reported a non-fatal failure through its services.
    PluginFailure {
        /// Machine instance name.
        machine: String,
        /// Reported message.
        message: String,
    },

    /// A condition that terminates the engine.
    Fatal(String),

    /// Audio processing started.
    Started,

    /// Audio processing stopped.
    Stopped,
}

/// Creates a connected sender/receiver pair.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        EventSender {
            producer: Arc::new(Mutex::new(producer)),
        },
        EventReceiver { consumer },
    )
}

/// Sending side, cloneable so that the render path and the fatal handler can share it.
#[derive(Clone)]
pub struct EventSender {
    producer: Arc<Mutex<Producer<EngineEvent>>>,
}

impl EventSender {
    /// Send an event, dropping it if the buffer is full.
    ///
    /// Returns false when the event was dropped.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.producer.lock().push(event).is_ok()
    }

    /// Check how many events can still be queued.
    pub fn slots_available(&self) -> usize {
        self.producer.lock().slots()
    }
}

/// Receiving side, held by the control thread.
pub struct EventReceiver {
    consumer: Consumer<EngineEvent>,
}

impl EventReceiver {
    /// Receive an event, if one is pending.
    pub fn recv(&mut self) -> Option<EngineEvent> {
        self.consumer.pop().ok()
    }

    /// Drain all pending events.
    pub fn drain(&mut self) -> impl Iterator<Item = EngineEvent> + '_ {
        std::iter::from_fn(|| self.recv())
    }
}
