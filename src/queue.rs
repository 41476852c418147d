//! Hands accepted messages to the transport.

use std::sync::Arc;

use crate::config::Config;
use crate::filter::{Pipeline, Stage};
use crate::id;
use crate::mail::Mail;
use crate::outcome::Halt;
use crate::storage::Storage;
use crate::transport::{Delivery, Transport};

pub struct QueueProcessor {
    pipeline: Arc<Pipeline>,
    transport: Transport,
    storage: Storage,
}

impl QueueProcessor {
    pub fn new(config: &Config, pipeline: Arc<Pipeline>) -> anyhow::Result<Self> {
        Ok(QueueProcessor {
            pipeline,
            transport: Transport::new(config)?,
            storage: Storage::new(config.storage_dir()),
        })
    }

    /// Runs the `queued` stage, delivers the message and removes its queue
    /// file. A failed delivery leaves the queue file in place.
    pub async fn process(&self, mut mail: Mail) -> anyhow::Result<Delivery> {
        match self.pipeline.run(Stage::Queued, &mut mail).await {
            Ok(()) => {}
            Err(Halt::Outcome(outcome)) => {
                log::info!("Outcome at {}: {outcome}", Stage::Queued);
                mail.set_final_destination(outcome.kind().destination());
            }
            Err(Halt::Failed(e)) => return Err(e.context("queued stage failed")),
        }

        let delivery = self.transport.send(&mut mail).await?;

        let queue_id = mail.queue_id().to_string();
        let path = format!("queue/{}/{queue_id}", id::shard(&queue_id));
        if self.storage.delete(&path)? {
            log::debug!("Removed {path}");
        }
        Ok(delivery)
    }

    /// Like [`process`](Self::process), with failures logged instead of
    /// returned.
    pub async fn run(&self, mail: Mail) {
        let queue_id = mail.existing_queue_id().unwrap_or("-").to_string();
        match self.process(mail).await {
            Ok(delivery) => log::info!("{queue_id}: {delivery:?}"),
            Err(e) => log::error!("{queue_id}: delivery failed: {e:#}"),
        }
    }
}
