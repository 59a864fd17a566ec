use crate::types::PipelineEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out channel for run progress.
///
/// The executor publishes every task state transition; any number of
/// subscribers (the CLI renderer, tests) receive the full stream.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget: a send error only means nobody is subscribed.
    pub fn publish(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("pipeline event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
