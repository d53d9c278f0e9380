//! Dispatch of incoming publishes to subscription callbacks.
//!
//! The router keeps one callback per topic filter and walks all
//! registered filters for every incoming publish. Callbacks run
//! synchronously on the loop thread and get a [`LoopControl`] handle to
//! request a disconnect once the current dispatch finishes.

use crate::codec::{topic::matches, Publish, QoS};

use bytes::Bytes;
use std::collections::HashMap;

/// An incoming application message, handed to subscription callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Message {
        Message {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// Handle for callbacks to influence the run loop. Requests are deferred
/// until the current dispatch completes, so calling disconnect from
/// inside a callback never re-enters the loop.
#[derive(Debug, Default)]
pub struct LoopControl {
    disconnect: bool,
}

impl LoopControl {
    pub(crate) fn new() -> LoopControl {
        LoopControl { disconnect: false }
    }

    /// Asks the run loop to send DISCONNECT and return after the current
    /// dispatch
    pub fn disconnect(&mut self) {
        self.disconnect = true;
    }

    pub(crate) fn disconnect_requested(&self) -> bool {
        self.disconnect
    }
}

/// Subscription callback. Errors are logged and the loop continues.
pub type Callback = Box<dyn FnMut(&mut LoopControl, &Message) -> Result<(), Box<dyn std::error::Error>>>;

struct Subscription {
    callback: Callback,
}

/// Topic filter to callback registry
#[derive(Default)]
pub struct Router {
    subscriptions: HashMap<String, Subscription>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            subscriptions: HashMap::new(),
        }
    }

    /// Registers a callback for the filter. Registering a filter twice
    /// replaces its callback.
    pub fn add(&mut self, filter: String, callback: Callback) {
        self.subscriptions.insert(filter, Subscription { callback });
    }

    /// Drops the filter's registration. Returns false when the filter
    /// wasn't registered.
    pub fn remove(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Dispatches the message to every matching callback and returns the
    /// number of callbacks that ran. Unmatched messages are dropped.
    pub fn route(&mut self, control: &mut LoopControl, message: &Message) -> usize {
        let mut delivered = 0;
        for (filter, subscription) in self.subscriptions.iter_mut() {
            if !matches(&message.topic, filter) {
                continue;
            }

            delivered += 1;
            if let Err(e) = (subscription.callback)(control, message) {
                error!("Callback failed for topic = {}, error = {}", message.topic, e);
            }
        }

        if delivered == 0 {
            trace!("No subscription matched topic = {}", message.topic);
        }

        delivered
    }
}
