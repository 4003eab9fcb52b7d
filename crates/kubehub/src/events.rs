use kfn_api::{ChildEvent, EventRecorder, StoreResult};
use kfn_core::Function;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::{store_error, CONTROLLER_NAME};

/// Publishes child writes as `Normal` events on the owning Function.
#[derive(Clone)]
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter { controller: CONTROLLER_NAME.into(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }
}

pub(crate) fn to_event(event: ChildEvent) -> Event {
    Event {
        type_: EventType::Normal,
        reason: event.reason(),
        note: Some(event.note()),
        action: "Reconcile".into(),
        secondary: None,
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(&self, function: &Function, event: ChildEvent) -> StoreResult<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), function.object_ref(&()));
        recorder.publish(to_event(event)).await.map_err(store_error)
    }
}
