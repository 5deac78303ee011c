//! Progress event bus.
//!
//! The coordinator publishes events; observers register a channel and
//! get every subsequent event. Unsubscribing is by token, and dead
//! receivers are dropped lazily on the next emit, so a vanished
//! observer never wedges a run.

use crate::job::JobEvent;
use crate::state::RunSummary;
use crate::watcher::WatchEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted { run_id: String, total_files: usize },
    Job(JobEvent),
    RunCompleted(Box<RunSummary>),
    Watch(WatchEvent),
}

#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
pub struct ProgressBus {
    subscribers: Mutex<Vec<(u64, Sender<EngineEvent>)>>,
    next_token: AtomicU64,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (SubscriptionToken, Receiver<EngineEvent>) {
        let (tx, rx) = channel();
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tx));
        (SubscriptionToken(id), rx)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != token.0);
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_receives_events() {
        let bus = ProgressBus::new();
        let (_token, rx) = bus.subscribe();
        bus.emit(EngineEvent::RunStarted {
            run_id: "r1".into(),
            total_files: 3,
        });
        match rx.recv().unwrap() {
            EngineEvent::RunStarted { run_id, total_files } => {
                assert_eq!(run_id, "r1");
                assert_eq!(total_files, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = ProgressBus::new();
        let (token, rx) = bus.subscribe();
        bus.unsubscribe(token);
        bus.emit(EngineEvent::RunStarted {
            run_id: "r1".into(),
            total_files: 0,
        });
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_receiver_pruned_on_emit() {
        let bus = ProgressBus::new();
        let (_token, rx) = bus.subscribe();
        drop(rx);
        bus.emit(EngineEvent::RunStarted {
            run_id: "r1".into(),
            total_files: 0,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_multiple_subscribers_all_receive() {
        let bus = ProgressBus::new();
        let (_t1, rx1) = bus.subscribe();
        let (_t2, rx2) = bus.subscribe();
        bus.emit(EngineEvent::RunStarted {
            run_id: "r".into(),
            total_files: 1,
        });
        assert!(rx1.recv().is_ok());
        assert!(rx2.recv().is_ok());
    }
}
