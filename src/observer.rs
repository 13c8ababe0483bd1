use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Features found on a connected peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub led_supported: bool,
    pub button_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(CapabilitySet),
    Disconnected,
    ButtonChanged { pressed: bool },
    LedChanged { on: bool },
}

impl SessionEvent {
    pub fn dispatch<O: SessionObserver + ?Sized>(self, observer: &mut O) {
        match self {
            SessionEvent::Connected(capabilities) => observer.connected(capabilities),
            SessionEvent::Disconnected => observer.disconnected(),
            SessionEvent::ButtonChanged { pressed } => observer.button_changed(pressed),
            SessionEvent::LedChanged { on } => observer.led_changed(on),
        }
    }
}

/// Receiver of session callbacks.
pub trait SessionObserver {
    fn connected(&mut self, capabilities: CapabilitySet);
    fn disconnected(&mut self);
    fn button_changed(&mut self, pressed: bool);
    fn led_changed(&mut self, on: bool);
}

/// Ordered stream of events emitted by one [`Session`](crate::Session).
///
/// Ends once the session has been dropped and every queued event was consumed.
pub struct SessionEvents {
    inner: UnboundedReceiverStream<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn new(receiver: UnboundedReceiver<SessionEvent>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(receiver),
        }
    }

    /// Delivers every event to `observer` on the calling task until the session
    /// is gone. Run this on the task that owns presentation state.
    pub async fn forward_to<O: SessionObserver + ?Sized>(mut self, observer: &mut O) {
        while let Some(event) = self.next().await {
            event.dispatch(observer);
        }
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl SessionObserver for Recorder {
        fn connected(&mut self, capabilities: CapabilitySet) {
            self.0.push(format!(
                "connected led={} button={}",
                capabilities.led_supported, capabilities.button_supported
            ));
        }

        fn disconnected(&mut self) {
            self.0.push("disconnected".into());
        }

        fn button_changed(&mut self, pressed: bool) {
            self.0.push(format!("button {}", pressed));
        }

        fn led_changed(&mut self, on: bool) {
            self.0.push(format!("led {}", on));
        }
    }

    #[tokio::test]
    async fn forwards_events_in_order_until_closed() {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let events = SessionEvents::new(receiver);

        sender
            .send(SessionEvent::Connected(CapabilitySet {
                led_supported: true,
                button_supported: false,
            }))
            .unwrap();
        sender.send(SessionEvent::LedChanged { on: true }).unwrap();
        sender
            .send(SessionEvent::ButtonChanged { pressed: false })
            .unwrap();
        sender.send(SessionEvent::Disconnected).unwrap();
        drop(sender);

        let mut recorder = Recorder::default();
        events.forward_to(&mut recorder).await;

        assert_eq!(
            recorder.0,
            vec![
                "connected led=true button=false",
                "led true",
                "button false",
                "disconnected"
            ]
        );
    }
}
