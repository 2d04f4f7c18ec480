use std::collections::VecDeque;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub sender: String,
    pub message: String,
}

impl Notification {
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
        }
    }
}

/// FIFO inbox of notifications addressed to one agent.
#[derive(Debug, Default)]
pub struct NotifQueue {
    pending: Mutex<VecDeque<Notification>>,
}

impl NotifQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notif: Notification) {
        self.pending.lock().push_back(notif);
    }

    /// Removes and returns everything queued, oldest first.
    pub fn drain(&self) -> Vec<Notification> {
        self.pending.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{NotifQueue, Notification};

    #[test]
    fn drain_is_fifo_and_empties_queue() {
        let queue = NotifQueue::new();
        queue.push(Notification::new("Agent1", "first"));
        queue.push(Notification::new("Agent2", "second"));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                Notification::new("Agent1", "first"),
                Notification::new("Agent2", "second"),
            ]
        );
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
