//! Caller-owned stream sinks
//!
//! Streams are single-producer single-consumer: the producer awaits
//! [`EventSink::send`] for every item, so a sink that is slow to return
//! applies backpressure all the way to the network reader. A sink error stops
//! the producer.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{RagoError, RagoResult};

#[async_trait]
pub trait EventSink<T: Send + 'static>: Send {
    async fn send(&mut self, item: T) -> RagoResult<()>;
}

#[async_trait]
impl<T: Send + 'static> EventSink<T> for mpsc::Sender<T> {
    async fn send(&mut self, item: T) -> RagoResult<()> {
        mpsc::Sender::send(self, item)
            .await
            .map_err(|_| RagoError::cancelled().with_source(SinkClosed))
    }
}

#[async_trait]
impl<T, S> EventSink<T> for &mut S
where
    T: Send + 'static,
    S: EventSink<T> + ?Sized,
{
    async fn send(&mut self, item: T) -> RagoResult<()> {
        (**self).send(item).await
    }
}

/// Adapts a synchronous callback into a sink
pub struct FnSink<F>(pub F);

#[async_trait]
impl<T, F> EventSink<T> for FnSink<F>
where
    T: Send + 'static,
    F: FnMut(T) -> RagoResult<()> + Send,
{
    async fn send(&mut self, item: T) -> RagoResult<()> {
        (self.0)(item)
    }
}

/// Collects every item; mostly useful in tests
#[derive(Debug, Default)]
pub struct VecSink<T> {
    pub items: Vec<T>,
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }
}

#[async_trait]
impl<T: Send + 'static> EventSink<T> for VecSink<T> {
    async fn send(&mut self, item: T) -> RagoResult<()> {
        self.items.push(item);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("stream receiver dropped")]
struct SinkClosed;
