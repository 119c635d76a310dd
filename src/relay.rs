//! Reply policy for received messages.
//!
//! A [`Responder`] is consulted by the receive loop after each message has
//! been delivered to the sink. Whatever it returns is sent back on the same
//! channel before the next read, so it must be quick.

use crate::event::TextMessage;

/// Prefix of the server's default reply.
pub const GREETING_PREFIX: &str = "Hello from the server! Received message: ";

/// Decides whether and how to answer a received message.
pub trait Responder: Send + Sync + 'static {
    fn respond(&self, message: &TextMessage) -> Option<String>;
}

impl<F> Responder for F
where
    F: Fn(&TextMessage) -> Option<String> + Send + Sync + 'static,
{
    fn respond(&self, message: &TextMessage) -> Option<String> {
        self(message)
    }
}

/// Answers every message with [`GREETING_PREFIX`] followed by its payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct Greeting;

impl Responder for Greeting {
    fn respond(&self, message: &TextMessage) -> Option<String> {
        Some(format!("{GREETING_PREFIX}{}", message.payload()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Side;

    #[test]
    fn test_greeting() {
        let message = TextMessage::new(Side::Initiator, "ping\n");
        assert_eq!(
            Greeting.respond(&message).as_deref(),
            Some("Hello from the server! Received message: ping")
        );
    }

    #[test]
    fn test_closure_responder() {
        let quiet = |message: &TextMessage| {
            (message.payload() != "hush").then(|| message.payload().to_uppercase())
        };
        assert_eq!(
            quiet.respond(&TextMessage::new(Side::Acceptor, "hi")).as_deref(),
            Some("HI")
        );
        assert!(quiet.respond(&TextMessage::new(Side::Acceptor, "hush")).is_none());
    }
}
