//! # Stream Utilities
//!
//! [`EventStream`] turns an [`EventBus`] subscription into an async
//! [`Stream`]. The bus handler pushes into an unbounded channel; the stream
//! drains it. Dropping the stream detaches the handler, so there is nothing
//! to clean up by hand.
//!
//! ```rust
//! use futures_util::StreamExt;
//! use mindwave::events::EventBus;
//! use mindwave::headset::{HeadsetEvent, HeadsetEventKind};
//! use mindwave::streams::EventStream;
//!
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .build()
//!     .unwrap();
//!
//! rt.block_on(async {
//!     let bus = EventBus::<HeadsetEvent>::new();
//!     let mut quality = EventStream::new(&bus, Some(HeadsetEventKind::SignalQuality), |event| {
//!         match event {
//!             HeadsetEvent::SignalQuality(q) => Some(*q),
//!             _ => None,
//!         }
//!     });
//!
//!     bus.publish(&HeadsetEvent::SignalQuality(87.0));
//!     assert_eq!(quality.next().await, Some(87.0));
//!
//!     drop(quality);
//!     assert!(bus.is_empty());
//! });
//! ```

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::events::{BusEvent, EventBus, Subscription};

/// Async stream of values extracted from bus events.
///
/// Items are buffered without bound, so a consumer that stops polling keeps
/// accumulating values until the stream is dropped.
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    subscription: Subscription,
}

impl<T: Send + 'static> EventStream<T> {
    /// Subscribe to `kind` (or every kind when `None`) and yield whatever
    /// `extract` returns for each event. Events mapped to `None` are skipped.
    pub fn new<E, F>(bus: &EventBus<E>, kind: Option<E::Kind>, extract: F) -> Self
    where
        E: BusEvent,
        F: Fn(&E) -> Option<T> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = move |event: &E| {
            if let Some(item) = extract(event) {
                // The receiver only goes away together with the subscription.
                let _ = tx.send(item);
            }
        };
        let subscription = match kind {
            Some(kind) => bus.subscribe(kind, forward),
            None => bus.subscribe_all(forward),
        };
        Self { rx, subscription }
    }
}

impl<T> EventStream<T> {
    /// The underlying bus subscription.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.subscription.detach();
    }
}

impl<T> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
