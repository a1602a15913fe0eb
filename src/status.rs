use log::debug;
use std::time::SystemTime;
use tokio::sync::watch;

/// A timestamped, human-readable status line. Each update fully replaces
/// the previous one; consumers never see partial edits.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub text: String,
    pub at: SystemTime,
}

impl Status {
    fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            at: SystemTime::now(),
        }
    }
}

/// Write side of an observable status line. The manager holds the feed;
/// callers get `watch::Receiver`s and react to changes or just read the
/// latest value.
pub struct StatusFeed {
    label: &'static str,
    tx: watch::Sender<Status>,
}

impl StatusFeed {
    pub fn new(label: &'static str, initial: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(Status::new(initial));
        Self { label, tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    pub fn set(&self, text: impl Into<String>) {
        let status = Status::new(text);
        debug!("{}: {}", self.label, status.text);
        // send_replace never fails, even with no receivers attached.
        self.tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_replaces_value() {
        let feed = StatusFeed::new("signaller", "disconnected");
        let mut rx = feed.subscribe();
        assert_eq!(rx.borrow().text, "disconnected");

        feed.set("connected");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().text, "connected");

        feed.set("registered 42");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().text, "registered 42");
    }

    #[test]
    fn test_set_without_receivers_is_harmless() {
        let feed = StatusFeed::new("stream", "idle");
        feed.set("streaming");
        assert_eq!(feed.subscribe().borrow().text, "streaming");
    }

    #[tokio::test]
    async fn test_timestamps_are_monotonic_enough() {
        let feed = StatusFeed::new("stream", "idle");
        let first = feed.subscribe().borrow().at;
        feed.set("streaming");
        let second = feed.subscribe().borrow().at;
        assert!(second >= first);
    }
}
