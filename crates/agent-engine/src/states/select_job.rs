use ota_agent_core::jobs::{self, JobProgressStatus, JobStatus, PendingJobs};
use rumqttc::QoS;
use tracing::{error, info, warn};

use crate::events::Event;
use crate::machine::Context;
use crate::states::State;

/// Chooses the execution to run out of the pending summaries: a single
/// in-progress job resumes, otherwise the oldest queued job starts. The full
/// job document is then requested through DescribeJobExecution.
pub(crate) struct SelectJobState {
    summaries: PendingJobs,
    current_job_id: Option<String>,
    describe_response_topic: Option<String>,
}

impl SelectJobState {
    pub(crate) fn new(summaries: PendingJobs) -> Self {
        SelectJobState {
            summaries,
            current_job_id: None,
            describe_response_topic: None,
        }
    }
}

impl State for SelectJobState {
    fn on_enter(&mut self, ctx: &Context) {
        self.summaries.retain_ours();

        if !self.summaries.in_progress.is_empty() {
            if self.summaries.in_progress.len() == 1 {
                let job_id = self.summaries.in_progress[0].job_id.clone();
                info!(%job_id, "job execution in progress");
                self.current_job_id = Some(job_id);
            } else {
                // More than one job in progress violates the protocol; fail
                // every offender and refetch.
                let ids: Vec<&str> = self
                    .summaries
                    .in_progress
                    .iter()
                    .map(|job| job.job_id.as_str())
                    .collect();
                let reason = format!(
                    "Invalid: more than one job execution in progress: {}",
                    ids.join(", ")
                );
                error!("{reason}");
                for job_id in ids {
                    ctx.update_job(
                        job_id,
                        JobStatus::Failed,
                        JobProgressStatus::ErrorMultipleInProgress.as_str(),
                        Some(&reason),
                    );
                }
                ctx.publish_event(Event::SelectJobInterrupted);
            }
        } else if let Some(oldest) = self.summaries.oldest_queued() {
            info!(job_id = %oldest.job_id, "starting queued job execution");
            self.current_job_id = Some(oldest.job_id.clone());
        } else {
            warn!("no job executions pending");
            ctx.publish_event(Event::SelectJobInterrupted);
        }

        if let Some(job_id) = &self.current_job_id {
            let topic = jobs::describe_job_execution_response(
                &ctx.cfg.broker.thing_name,
                job_id,
                None,
            );
            ctx.bus.subscribe(&topic, QoS::AtLeastOnce);
            self.describe_response_topic = Some(topic);
        }
    }

    fn on_exit(&mut self, _ctx: &Context) {}

    fn handle(&mut self, ctx: &Context, event: &Event) {
        let Some(job_id) = self.current_job_id.clone() else {
            return;
        };

        match event {
            Event::MqttSubscribed { topic } => {
                let subscribed = self
                    .describe_response_topic
                    .as_deref()
                    .is_some_and(|response| jobs::topic_matches(response, topic));
                if subscribed {
                    ctx.bus.publish(
                        jobs::describe_job_execution(&ctx.cfg.broker.thing_name, &job_id),
                        Vec::new(),
                    );
                }
            }
            Event::MqttMessageReceived { topic, payload } => {
                let thing_name = &ctx.cfg.broker.thing_name;
                let accepted = jobs::describe_job_execution_response(
                    thing_name,
                    &job_id,
                    Some(jobs::ACCEPTED),
                );
                let rejected = jobs::describe_job_execution_response(
                    thing_name,
                    &job_id,
                    Some(jobs::REJECTED),
                );

                if jobs::topic_matches(&accepted, topic) {
                    match jobs::parse_describe_response(payload) {
                        Some(job) => ctx.publish_event(Event::JobSelected { job }),
                        None => {
                            warn!(%job_id, "describe response without a usable job document");
                            ctx.publish_event(Event::SelectJobInterrupted);
                        }
                    }
                } else if jobs::topic_matches(&rejected, topic) {
                    warn!(message = %jobs::rejection_message(payload), "job description rejected");
                    ctx.publish_event(Event::SelectJobInterrupted);
                }
            }
            _ => {}
        }
    }
}
