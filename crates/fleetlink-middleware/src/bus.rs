//! In-process event bus between the wire layer and the runtime.
//!
//! One [`tokio::sync::broadcast`] channel per [`Topic`]; every subscriber of
//! a topic sees every event on it, and a slow subscriber only hurts itself
//! (it observes `Lagged` and skips ahead).
//!
//! # Topics
//!
//! | Topic | Payloads |
//! |---|---|
//! | [`Topic::Telemetry`] | `DeviceState`, `Factsheet` |
//! | [`Topic::Connection`] | `Connection` |
//! | [`Topic::StatusUpdates`] | `DeviceStatusChanged` |
//! | [`Topic::CommandResults`] | `CommandResult` |

use fleetlink_types::{Event, EventPayload};
use tokio::sync::broadcast;

/// Events buffered per topic before a slow subscriber starts lagging.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    Connection,
    StatusUpdates,
    CommandResults,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::Telemetry,
        Topic::Connection,
        Topic::StatusUpdates,
        Topic::CommandResults,
    ];

    /// The topic a payload is carried on.
    pub fn of(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::DeviceState(_) | EventPayload::Factsheet { .. } => Topic::Telemetry,
            EventPayload::Connection(_) => Topic::Connection,
            EventPayload::DeviceStatusChanged { .. } => Topic::StatusUpdates,
            EventPayload::CommandResult(_) => Topic::CommandResults,
        }
    }

    fn index(self) -> usize {
        match self {
            Topic::Telemetry => 0,
            Topic::Connection => 1,
            Topic::StatusUpdates => 2,
            Topic::CommandResults => 3,
        }
    }
}

/// Cloning shares the channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    senders: [broadcast::Sender<Event>; 4],
}

impl EventBus {
    /// `capacity` applies to each topic independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Topic::ALL.map(|_| broadcast::channel(capacity).0),
        }
    }

    /// Publish on the topic the payload belongs to.  Returns how many
    /// subscribers were handed the event; zero just means nobody listens.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::of(&event.payload);
        self.publish_to(topic, event)
    }

    /// Publish on an explicit topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        self.senders[topic.index()].send(event).unwrap_or(0)
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.senders[topic.index()].subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.senders[topic.index()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving end of one topic, from [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Next event on the topic.  `Lagged(n)` means `n` events were skipped;
    /// `Closed` means every sender is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
