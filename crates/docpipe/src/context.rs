//! Shared handles passed to admission, consumers and the reconciler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broadcast::JobEventBroadcaster;
use crate::model::Stage;
use crate::queue::WorkQueue;
use crate::store::RecordStore;

/// Built once at startup and cloned into each component.
#[derive(Clone)]
pub struct PipelineContext {
    store: Arc<dyn RecordStore>,
    queues: HashMap<Stage, Arc<dyn WorkQueue>>,
    events: JobEventBroadcaster,
}

impl PipelineContext {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            queues: HashMap::new(),
            events: JobEventBroadcaster::default(),
        }
    }

    pub fn with_queue(mut self, stage: Stage, queue: Arc<dyn WorkQueue>) -> Self {
        self.queues.insert(stage, queue);
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn queue(&self, stage: Stage) -> Option<&Arc<dyn WorkQueue>> {
        self.queues.get(&stage)
    }

    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }
}
