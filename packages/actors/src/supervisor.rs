//! Supervisor actor for managing all queue actors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jobs_core::{Clock, JobEvent, QueueError, QueueName, SchedulerConfig};
use jobs_db::{Database, JobRepository};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;

use crate::handler::HandlerRegistry;
use crate::messages::{QueueMessage, SupervisorMessage};
use crate::queue_actor::{QueueActor, QueueActorArgs};

/// How long shutdown waits for each queue actor to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub db: Database,
    pub config: SchedulerConfig,
    pub handlers: Arc<HandlerRegistry>,
    pub clock: Arc<dyn Clock>,
    pub events: broadcast::Sender<JobEvent>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    /// One scheduler per configured queue.
    queues: BTreeMap<QueueName, ActorRef<QueueMessage>>,
    config: Arc<SchedulerConfig>,
    handlers: Arc<HandlerRegistry>,
    db: Database,
    jobs: JobRepository,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<JobEvent>,
    shutting_down: bool,
}

impl SupervisorState {
    fn queue(&self, queue: QueueName) -> Result<&ActorRef<QueueMessage>, QueueError> {
        self.queues
            .get(&queue)
            .ok_or_else(|| QueueError::Actor(format!("queue {} is not running", queue)))
    }

    /// Forward a message carrying its own reply port to a queue actor.
    ///
    /// If the queue actor is gone the port is dropped and the caller sees a
    /// sender error.
    fn forward(&self, queue: QueueName, message: QueueMessage) {
        match self.queue(queue) {
            Ok(actor) => {
                if let Err(e) = actor.send_message(message) {
                    tracing::warn!(%queue, "Failed to forward message: {}", e);
                }
            }
            Err(e) => tracing::warn!(%queue, "{}", e),
        }
    }
}

async fn spawn_queue_actor(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    queue: QueueName,
) -> Result<ActorRef<QueueMessage>, ActorProcessingErr> {
    let args = QueueActorArgs {
        queue,
        scheduler: state.config.clone(),
        handlers: state.handlers.clone(),
        db: state.db.clone(),
        clock: state.clock.clone(),
        events: state.events.clone(),
    };

    let (actor, _handle) = Actor::spawn_linked(None, QueueActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn queue {}: {}", queue, e)))?;

    state.queues.insert(queue, actor.clone());

    Ok(actor)
}

/// Supervisor actor that owns every queue actor and routes requests.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(handlers = args.handlers.len(), "Starting job scheduler supervisor");

        let queue_names: Vec<QueueName> = args.config.queues.keys().copied().collect();
        let mut state = SupervisorState {
            queues: BTreeMap::new(),
            config: Arc::new(args.config),
            handlers: args.handlers,
            jobs: JobRepository::new(args.db.clone()),
            db: args.db,
            clock: args.clock,
            events: args.events,
            shutting_down: false,
        };

        for queue in queue_names {
            if let Err(e) = spawn_queue_actor(&myself, &mut state, queue).await {
                tracing::error!(%queue, "{}", e);
                return Err(e);
            }
        }

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Enqueue {
                kind,
                options,
                dedupe_key,
                reply,
            } => {
                let queue = kind.queue();
                state.forward(
                    queue,
                    QueueMessage::Enqueue {
                        kind,
                        options,
                        dedupe_key,
                        reply,
                    },
                );
            }

            SupervisorMessage::ScheduleAt { kind, at, reply } => {
                let queue = kind.queue();
                state.forward(queue, QueueMessage::ScheduleAt { kind, at, reply });
            }

            SupervisorMessage::Cancel { job_id, reply } => match state.jobs.find(job_id).await {
                Ok(Some(job)) => state.forward(job.queue, QueueMessage::Cancel { job_id, reply }),
                Ok(None) => {
                    let _ = reply.send(Ok(false));
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },

            SupervisorMessage::Retry { job_id, reply } => match state.jobs.find(job_id).await {
                Ok(Some(job)) => state.forward(job.queue, QueueMessage::Retry { job_id, reply }),
                Ok(None) => {
                    let _ = reply.send(Err(QueueError::JobNotFound(job_id)));
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },

            SupervisorMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.jobs.find(job_id).await.map_err(QueueError::from));
            }

            SupervisorMessage::Counts { queue, reply } => {
                state.forward(queue, QueueMessage::Counts { reply });
            }

            SupervisorMessage::ListFailed { queue, limit, reply } => {
                state.forward(queue, QueueMessage::ListFailed { limit, reply });
            }

            SupervisorMessage::Purge {
                queue,
                state: job_state,
                reply,
            } => {
                state.forward(
                    queue,
                    QueueMessage::Purge {
                        state: job_state,
                        reply,
                    },
                );
            }

            SupervisorMessage::Pause { queue, reply } => {
                state.forward(queue, QueueMessage::Pause { reply });
            }

            SupervisorMessage::Resume { queue, reply } => {
                state.forward(queue, QueueMessage::Resume { reply });
            }

            SupervisorMessage::Tick { queue, reply } => {
                state.forward(queue, QueueMessage::Tick { reply: Some(reply) });
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                state.shutting_down = true;
                for (queue, actor) in &state.queues {
                    if let Err(e) = actor
                        .stop_and_wait(Some("shutdown".to_string()), Some(SHUTDOWN_TIMEOUT))
                        .await
                    {
                        tracing::warn!(%queue, "Queue actor did not stop cleanly: {}", e);
                    }
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.shutting_down {
            return Ok(());
        }

        if let SupervisionEvent::ActorFailed(cell, reason) = message {
            let failed = state
                .queues
                .iter()
                .find(|(_, actor)| actor.get_id() == cell.get_id())
                .map(|(queue, _)| *queue);

            if let Some(queue) = failed {
                tracing::error!(%queue, "Queue actor failed, restarting: {}", reason);
                state.queues.remove(&queue);
                spawn_queue_actor(&myself, state, queue).await?;
            }
        }
        Ok(())
    }
}

/// Start the supervisor and one queue actor per configured queue.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(None, Supervisor, args).await
}
