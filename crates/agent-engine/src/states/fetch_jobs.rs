use ota_agent_core::config::Config;
use ota_agent_core::jobs;
use rumqttc::QoS;
use tracing::{debug, warn};

use crate::events::Event;
use crate::machine::Context;
use crate::states::State;

/// Asks the broker for pending executions: subscribe to the get response,
/// publish the get request once subscribed, and decide between `monitor`
/// and `select_job` from the answer.
pub(crate) struct FetchJobsState {
    response_topic: String,
}

impl FetchJobsState {
    pub(crate) fn new(cfg: &Config) -> Self {
        FetchJobsState {
            response_topic: jobs::get_pending_job_executions_response(
                &cfg.broker.thing_name,
                None,
            ),
        }
    }
}

impl State for FetchJobsState {
    fn on_enter(&mut self, ctx: &Context) {
        ctx.bus.subscribe(&self.response_topic, QoS::AtLeastOnce);
    }

    fn on_exit(&mut self, _ctx: &Context) {}

    fn handle(&mut self, ctx: &Context, event: &Event) {
        match event {
            Event::MqttSubscribed { topic } if jobs::topic_matches(&self.response_topic, topic) => {
                ctx.bus.publish(
                    jobs::get_pending_job_executions(&ctx.cfg.broker.thing_name),
                    Vec::new(),
                );
            }
            Event::MqttMessageReceived { topic, payload }
                if jobs::topic_matches(&self.response_topic, topic) =>
            {
                match jobs::parse_pending_jobs(payload) {
                    Some(pending) if !pending.is_empty() => {
                        debug!("job executions available");
                        ctx.publish_event(Event::JobsAvailable { summaries: pending });
                    }
                    Some(_) => {
                        debug!("no pending job executions available");
                        ctx.publish_event(Event::NoJobsPending);
                    }
                    None => warn!("unparseable pending job executions response"),
                }
            }
            _ => {}
        }
    }
}
