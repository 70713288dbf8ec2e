use crate::message::LineEvent;
use crate::mutex::lock;
use std::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Fan-out of line events to any number of subscribers. Subscribers whose
/// receiver was dropped are pruned on the next emit.
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    senders: Mutex<Vec<UnboundedSender<LineEvent>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> UnboundedReceiver<LineEvent> {
        let (tx, rx) = unbounded_channel();
        lock(&self.senders).push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: LineEvent) {
        let mut senders = lock(&self.senders);
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EventSource, LineEventKind};

    fn event(kind: LineEventKind) -> LineEvent {
        LineEvent {
            kind,
            source: EventSource::Mixer {
                driver: "Test".to_string(),
            },
            frame_position: 0,
        }
    }

    #[test]
    fn every_live_subscriber_receives_events() {
        let hub = EventHub::default();
        let mut first = hub.subscribe();
        let second = hub.subscribe();
        drop(second);
        hub.emit(event(LineEventKind::Open));
        hub.emit(event(LineEventKind::Start));
        assert_eq!(first.try_recv().unwrap().kind, LineEventKind::Open);
        assert_eq!(first.try_recv().unwrap().kind, LineEventKind::Start);
        assert_eq!(lock(&hub.senders).len(), 1);
    }
}
