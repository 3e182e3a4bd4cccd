use ota_agent_core::config::Config;
use ota_agent_core::jobs;
use rumqttc::QoS;
use tracing::debug;

use crate::events::Event;
use crate::machine::Context;
use crate::states::State;

/// Waits passively for new executions to be announced on the notify topic.
pub(crate) struct MonitorState {
    notify_topic: String,
}

impl MonitorState {
    pub(crate) fn new(cfg: &Config) -> Self {
        MonitorState {
            notify_topic: jobs::pending_jobs_response(&cfg.broker.thing_name),
        }
    }
}

impl State for MonitorState {
    fn on_enter(&mut self, ctx: &Context) {
        ctx.bus.subscribe(&self.notify_topic, QoS::AtLeastOnce);
    }

    fn on_exit(&mut self, ctx: &Context) {
        ctx.bus.unsubscribe(&self.notify_topic);
    }

    fn handle(&mut self, ctx: &Context, event: &Event) {
        let Event::MqttMessageReceived { topic, payload } = event else {
            return;
        };
        if !jobs::topic_matches(&self.notify_topic, topic) {
            return;
        }
        let Some(mut pending) = jobs::parse_notify(payload) else {
            return;
        };
        pending.retain_ours();
        if !pending.is_empty() {
            debug!("job executions available");
            ctx.publish_event(Event::JobsAvailable { summaries: pending });
        }
    }
}
