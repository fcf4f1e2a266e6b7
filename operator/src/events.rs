use async_trait::async_trait;
use coral_types::Cluster;
use kube::{
    Client, Resource,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use std::sync::Arc;

/// Best-effort event publication: failures are logged and never block or
/// fail the reconcile cycle.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, cluster: &Cluster, event_type: EventType, reason: &str, note: String);
}

pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Arc<dyn EventSink> {
        let reporter = Reporter {
            controller: "coral-operator".to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Arc::new(KubeEventSink {
            recorder: Recorder::new(client, reporter),
        })
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, cluster: &Cluster, event_type: EventType, reason: &str, note: String) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&event, &cluster.object_ref(&()))
            .await
        {
            eprintln!("failed to publish {} event: {}", reason, e);
        }
    }
}
