//! Consumer handles for non-tunneling front ends.

use bytes::Bytes;
use proto::ConsumerClass;
use tokio::sync::mpsc;

/// Telegrams buffered per consumer before backpressure kicks in
pub(crate) const CONSUMER_BUFFER: usize = 64;

/// One bus telegram handed to a consumer class
#[derive(Debug, Clone)]
pub struct Telegram {
    /// Queue serial, monotonic per multiplexer
    pub serial: u64,
    /// Raw cEMI frame bytes
    pub cemi: Bytes,
}

/// Receiving end of a consumer-class subscription
///
/// Created by [`crate::Multiplexer::register_consumer`]. Each telegram from
/// the bus is delivered at most once per class; dropping the handle
/// unsubscribes the class and releases anything it still owed.
pub struct Consumer {
    class: ConsumerClass,
    rx: mpsc::Receiver<Telegram>,
}

impl Consumer {
    pub(crate) fn new(class: ConsumerClass, rx: mpsc::Receiver<Telegram>) -> Self {
        Self { class, rx }
    }

    /// The class this handle is subscribed as
    pub fn class(&self) -> ConsumerClass {
        self.class
    }

    /// The next telegram for this class
    ///
    /// `None` once the multiplexer has shut down.
    pub async fn recv(&mut self) -> Option<Telegram> {
        self.rx.recv().await
    }
}
