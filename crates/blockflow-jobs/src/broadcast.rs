//! Progress fan-out.

use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::TRACING_TARGET;
use crate::progress::JobSnapshot;

/// One broadcast channel per job with live subscribers.
///
/// Channels are created by the first subscriber and dropped once the job's
/// terminal snapshot has been sent.
#[derive(Debug)]
pub struct ProgressBroadcaster {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<JobSnapshot>>>,
    capacity: usize,
}

impl ProgressBroadcaster {
    /// Creates a broadcaster buffering `capacity` snapshots per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Attaches a receiver to the job's channel, creating it on demand.
    pub async fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<JobSnapshot> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(&job_id) {
                return sender.subscribe();
            }
        }

        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(&job_id) {
            return sender.subscribe();
        }

        let (sender, receiver) = broadcast::channel(self.capacity);
        channels.insert(job_id, sender);

        tracing::trace!(
            target: TRACING_TARGET,
            job_id = %job_id,
            "Created progress channel"
        );
        receiver
    }

    /// Sends a snapshot to current subscribers, if any.
    pub async fn publish(&self, snapshot: JobSnapshot) {
        let job_id = snapshot.job_id;
        let terminal = snapshot.is_terminal();

        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(&job_id) {
                let _ = sender.send(snapshot);
            }
        }

        if terminal {
            self.release(job_id).await;
        }
    }

    /// Drops the job's channel. Existing receivers still drain buffered snapshots.
    pub async fn release(&self, job_id: Uuid) {
        if self.channels.write().await.remove(&job_id).is_some() {
            tracing::trace!(
                target: TRACING_TARGET,
                job_id = %job_id,
                "Released progress channel"
            );
        }
    }

    /// Number of jobs with an open channel.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}
