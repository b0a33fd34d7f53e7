//! Fan-out router from the `main` ingress stream to subscriber streams.
//!
//! The broker is the sole subscriber of `main`. It reads frames in raw mode
//! (no decode), peeks the event type out of the frame header, resolves the
//! interested streams through the registry, and republishes the frame
//! verbatim onto each. Frames keep their ingress partition key, so per-key
//! order survives the fan-out.
//!
//! Multiple broker instances form one consumer group on `main` and split
//! its partitions; registry lookups should go through a cached registry in
//! that setup.

use std::sync::Arc;

use futures::FutureExt;
use tracing::warn;

use arque_core::peek_event_type;
use arque_infra::{
    Delivery, DeliveryHandler, EventBus, MAIN_STREAM, RawStreamBatch, StreamRegistry, Subscriber,
    SubscribeOptions,
};

use crate::error::RuntimeError;

pub struct Broker {
    bus: Arc<dyn EventBus>,
    registry: Arc<dyn StreamRegistry>,
}

/// Handle to a running broker; `stop` finishes the in-flight fan-out.
pub struct BrokerHandle {
    subscriber: Subscriber,
}

impl BrokerHandle {
    pub async fn stop(self) {
        self.subscriber.stop().await;
    }
}

impl Broker {
    pub fn new(bus: Arc<dyn EventBus>, registry: Arc<dyn StreamRegistry>) -> Self {
        Self { bus, registry }
    }

    pub async fn start(&self) -> Result<BrokerHandle, RuntimeError> {
        let bus = self.bus.clone();
        let registry = self.registry.clone();

        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let bus = bus.clone();
            let registry = registry.clone();

            async move {
                let Delivery::Raw(message) = delivery else {
                    return Ok(());
                };

                let event_type = peek_event_type(&message.frame)?;
                let streams = registry.find_streams(event_type).await?;
                if streams.is_empty() {
                    warn!(event_type, "no subscriber streams registered, dropping event");
                    return Ok(());
                }

                let batches = streams
                    .into_iter()
                    .map(|stream| RawStreamBatch { stream, messages: vec![message.clone()] })
                    .collect();
                bus.send_raw(batches).await?;
                Ok(())
            }
            .boxed()
        });

        let subscriber = self.bus.subscribe(MAIN_STREAM, handler, SubscribeOptions::raw()).await?;
        Ok(BrokerHandle { subscriber })
    }
}
