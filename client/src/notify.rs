//! Wake-up hints from whatever watches the local database
//!
//! A hint only says that something new may be available. Samples and images
//! are always read back from the store, so lost or duplicate hints are
//! harmless; the transmit timer catches anything missed.

use bytes::Bytes;
use tokio::sync::mpsc;
use wxpush_protocol::{Code, FieldList};

/// Pending hints beyond this are dropped by `try_notify`
pub const DEFAULT_CAPACITY: usize = 256;

/// Current conditions from a station, forwarded as soon as possible and
/// never retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveReading {
    pub station: Code,
    pub field_list: FieldList,
    pub field_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// New samples were stored for a station
    Sample(Code),
    Live(LiveReading),
    /// A new image was stored
    Image,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Queue a hint without waiting. Returns false if the uploader is busy or
    /// gone, in which case the hint is dropped.
    pub fn try_notify(&self, notification: Notification) -> bool {
        self.tx.try_send(notification).is_ok()
    }

    pub async fn notify(&self, notification: Notification) -> bool {
        self.tx.send(notification).await.is_ok()
    }
}

pub fn channel(capacity: usize) -> (Notifier, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Notifier { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_channel_drops_hints() {
        let (notifier, mut rx) = channel(1);
        let code = Code::new("rua").unwrap();
        assert!(notifier.try_notify(Notification::Sample(code.clone())));
        assert!(!notifier.try_notify(Notification::Image));

        assert_eq!(rx.recv().await, Some(Notification::Sample(code)));
        drop(rx);
        assert!(!notifier.notify(Notification::Image).await);
    }
}
