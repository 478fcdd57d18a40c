//! In-process pub/sub hub for protocol frames.
//!
//! Two bus instances exist per connection: one for inbound frames, one for
//! outbound notifications.  Handlers run synchronously on the publishing
//! task in subscription order; a failing handler is logged and skipped so
//! later handlers still observe the frame and ordering is preserved.

use rtlink_protocol::ProtocolMessage;
use tracing::warn;

use crate::error::{Error, Result};

/// The only valid event name on either bus.
pub const PROTOCOL_MESSAGE_EVENT: &str = "protocol_message";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type Handler = Box<dyn FnMut(&ProtocolMessage) -> std::result::Result<(), HandlerError> + Send>;

/// Returned by [`MessageBus::subscribe`]; identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

pub struct MessageBus {
    /// `"incoming"` or `"outgoing"`, for log context only.
    name: &'static str,
    handlers: Vec<(u64, Handler)>,
    next_token: u64,
}

impl MessageBus {
    pub fn new(name: &'static str) -> Self {
        MessageBus {
            name,
            handlers: Vec::new(),
            next_token: 0,
        }
    }

    pub fn subscribe(&mut self, event: &str, handler: Handler) -> Result<SubscriptionToken> {
        Self::check_event(event)?;
        let token = self.next_token;
        self.next_token += 1;
        self.handlers.push((token, handler));
        Ok(SubscriptionToken(token))
    }

    /// Remove a subscription.  Returns false if the token was already gone.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(t, _)| *t != token.0);
        self.handlers.len() != before
    }

    /// Invoke every handler with `msg`, in subscription order.
    ///
    /// Handler failures are logged and swallowed; they never reorder frames
    /// or prevent later handlers from running.
    pub fn publish(&mut self, event: &str, msg: &ProtocolMessage) -> Result<()> {
        Self::check_event(event)?;
        for (token, handler) in &mut self.handlers {
            if let Err(e) = handler(msg) {
                warn!(bus = self.name, token = *token, error = %e, "bus handler failed");
            }
        }
        Ok(())
    }

    fn check_event(event: &str) -> Result<()> {
        if event == PROTOCOL_MESSAGE_EVENT {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "unknown bus event: {event:?}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtlink_protocol::Action;
    use std::sync::{Arc, Mutex};

    fn frame() -> ProtocolMessage {
        ProtocolMessage::heartbeat()
    }

    #[test]
    fn rejects_unknown_event_names() {
        let mut bus = MessageBus::new("incoming");
        assert!(matches!(
            bus.subscribe("message", Box::new(|_| Ok(()))),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            bus.publish("connected", &frame()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new("incoming");
        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(
                PROTOCOL_MESSAGE_EVENT,
                Box::new(move |_| {
                    order.lock().unwrap().push(i);
                    Ok(())
                }),
            )
            .unwrap();
        }
        bus.publish(PROTOCOL_MESSAGE_EVENT, &frame()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_handler_does_not_block_later_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new("incoming");
        bus.subscribe(PROTOCOL_MESSAGE_EVENT, Box::new(|_| Err("boom".into())))
            .unwrap();
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(
                PROTOCOL_MESSAGE_EVENT,
                Box::new(move |m| {
                    seen.lock().unwrap().push(m.action);
                    Ok(())
                }),
            )
            .unwrap();
        }
        bus.publish(PROTOCOL_MESSAGE_EVENT, &frame()).unwrap();
        bus.publish(PROTOCOL_MESSAGE_EVENT, &frame()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Action::Heartbeat; 2]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let count = Arc::new(Mutex::new(0usize));
        let mut bus = MessageBus::new("outgoing");
        let token = {
            let count = Arc::clone(&count);
            bus.subscribe(
                PROTOCOL_MESSAGE_EVENT,
                Box::new(move |_| {
                    *count.lock().unwrap() += 1;
                    Ok(())
                }),
            )
            .unwrap()
        };
        bus.publish(PROTOCOL_MESSAGE_EVENT, &frame()).unwrap();
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        bus.publish(PROTOCOL_MESSAGE_EVENT, &frame()).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
