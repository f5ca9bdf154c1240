//! Long polling for job activation.
//!
//! A single coordinator task owns all per-job-type state. Requests either go straight to
//! the dispatcher or, once a job type has produced enough empty responses in a row, are
//! parked until jobs become available, a probe picks them up, or their timer fires.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::availability::{JobAvailabilitySubscription, Notification};
use crate::config::{GatewayConfig, LongPollingConfig};
use crate::error::{BrokerError, Rejection};
use crate::gateway::dispatcher::{ActivationDispatcher, DispatchOutcome};
use crate::gateway::request::{
    ActivateJobsRequest, ActivateJobsResponse, ActivationSink, RequestProgress, RequestState,
};
use crate::partition::batch;

const RESPONSE_BUFFER: usize = 16;

/// Snapshot of the long-polling state of one job type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTypeStats {
    pub empty_responses: u32,
    pub blocked: usize,
    pub active: usize,
}

#[derive(Debug)]
pub enum CoordinatorMessage {
    Activate {
        id: u64,
        request: ActivateJobsRequest,
        sink: ActivationSink,
        progress: watch::Sender<RequestProgress>,
    },
    JobsAvailable(String),
    Stats {
        job_type: String,
        response_tx: oneshot::Sender<JobTypeStats>,
    },
}

/// Events produced by tasks the coordinator spawned.
#[derive(Debug)]
enum InternalEvent {
    DispatchCompleted {
        id: u64,
        job_type: String,
        outcome: DispatchOutcome,
    },
    TimerExpired {
        id: u64,
    },
}

/// Cloneable entry point for workers.
#[derive(Debug, Clone)]
pub struct LongPollingHandle {
    tx: mpsc::Sender<CoordinatorMessage>,
    next_id: Arc<AtomicU64>,
}

impl LongPollingHandle {
    /// Submit an activation. Fails fast with RESOURCE_EXHAUSTED when the coordinator's
    /// queue is full.
    pub fn activate_jobs(
        &self,
        request: ActivateJobsRequest,
    ) -> Result<ActivateJobsResponse, Status> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, rx) = mpsc::channel(RESPONSE_BUFFER);
        let (progress, progress_rx) = watch::channel(RequestProgress::default());

        self.tx
            .try_send(CoordinatorMessage::Activate {
                id,
                request,
                sink,
                progress,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    Status::resource_exhausted("Too many pending activation requests")
                }
                TrySendError::Closed(_) => Status::unavailable("Gateway is shutting down"),
            })?;

        Ok(ActivateJobsResponse::new(id, rx, progress_rx))
    }

    pub fn notify_jobs_available(&self, job_type: &str) {
        if self
            .tx
            .try_send(CoordinatorMessage::JobsAvailable(job_type.to_string()))
            .is_err()
        {
            tracing::debug!(job_type, "Dropped job availability notification");
        }
    }

    pub async fn stats(&self, job_type: &str) -> Result<JobTypeStats, Status> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::Stats {
                job_type: job_type.to_string(),
                response_tx,
            })
            .await
            .map_err(|_| Status::unavailable("Gateway is shutting down"))?;
        response_rx
            .await
            .map_err(|_| Status::unavailable("Gateway is shutting down"))
    }
}

struct InflightRequest {
    request: ActivateJobsRequest,
    sink: ActivationSink,
    progress: watch::Sender<RequestProgress>,
    state: RequestState,
    has_timer: bool,
    long_polling_disabled: bool,
    /// Cancelled when the request terminates; stops the timer and any further delivery.
    done: CancellationToken,
}

impl InflightRequest {
    fn set_state(&mut self, state: RequestState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_replace(RequestProgress {
            state: self.state,
            has_timer: self.has_timer,
        });
    }
}

struct JobTypeAvailability {
    empty_responses: u32,
    last_updated: Instant,
    blocked: VecDeque<u64>,
    active: HashSet<u64>,
    to_be_repeated: HashSet<u64>,
}

impl JobTypeAvailability {
    fn new() -> Self {
        Self {
            empty_responses: 0,
            last_updated: Instant::now(),
            blocked: VecDeque::new(),
            active: HashSet::new(),
            to_be_repeated: HashSet::new(),
        }
    }

    fn increment_empty_responses(&mut self) {
        self.empty_responses = self.empty_responses.saturating_add(1);
        self.last_updated = Instant::now();
    }

    fn decrement_empty_responses(&mut self) {
        self.empty_responses = self.empty_responses.saturating_sub(1);
        self.last_updated = Instant::now();
    }

    fn reset_empty_responses(&mut self) {
        self.empty_responses = 0;
        self.last_updated = Instant::now();
    }
}

pub struct LongPollingCoordinator {
    config: LongPollingConfig,
    dispatcher: Arc<ActivationDispatcher>,
    requests: HashMap<u64, InflightRequest>,
    job_types: HashMap<String, JobTypeAvailability>,
    cursors: HashMap<String, u32>,
    message_tx: mpsc::Sender<CoordinatorMessage>,
    next_id: Arc<AtomicU64>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: Option<mpsc::UnboundedReceiver<InternalEvent>>,
}

impl LongPollingCoordinator {
    pub fn new(
        config: &GatewayConfig,
        dispatcher: Arc<ActivationDispatcher>,
    ) -> (Self, mpsc::Receiver<CoordinatorMessage>) {
        let (message_tx, message_rx) = mpsc::channel(config.request_queue_capacity.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            config: config.long_polling.clone(),
            dispatcher,
            requests: HashMap::new(),
            job_types: HashMap::new(),
            cursors: HashMap::new(),
            message_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            internal_tx,
            internal_rx: Some(internal_rx),
        };

        (coordinator, message_rx)
    }

    pub fn handle(&self) -> LongPollingHandle {
        LongPollingHandle {
            tx: self.message_tx.clone(),
            next_id: self.next_id.clone(),
        }
    }

    /// Run the coordinator until `shutdown` fires.
    pub async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<CoordinatorMessage>,
        mut notifications: Option<JobAvailabilitySubscription>,
        shutdown: CancellationToken,
    ) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };
        let mut probe = tokio::time::interval(self.config.probe_timeout());
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        probe.tick().await;

        tracing::info!(
            enabled = self.config.enabled,
            timeout_ms = self.config.timeout_ms,
            probe_timeout_ms = self.config.probe_timeout_ms,
            min_empty_responses = self.config.min_empty_responses,
            "Long polling coordinator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Long polling coordinator shutting down");
                    break;
                }

                Some(msg) = message_rx.recv() => {
                    self.handle_message(msg);
                }

                Some(event) = internal_rx.recv() => {
                    match event {
                        InternalEvent::DispatchCompleted { id, job_type, outcome } => {
                            self.on_dispatch_completed(id, job_type, outcome);
                        }
                        InternalEvent::TimerExpired { id } => self.on_timer_expired(id),
                    }
                }

                notification = next_notification(&mut notifications) => {
                    match notification {
                        Some(Notification::JobsAvailable(job_type)) => self.jobs_available(&job_type),
                        Some(Notification::Missed(missed)) => {
                            tracing::debug!(missed, "Missed availability notifications, unblocking every job type");
                            let job_types: Vec<String> = self.job_types.keys().cloned().collect();
                            for job_type in job_types {
                                self.jobs_available(&job_type);
                            }
                        }
                        None => notifications = None,
                    }
                }

                _ = probe.tick() => {
                    self.probe();
                }
            }
        }

        for (_, request) in self.requests.drain() {
            request.done.cancel();
        }
    }

    fn handle_message(&mut self, msg: CoordinatorMessage) {
        match msg {
            CoordinatorMessage::Activate {
                id,
                request,
                sink,
                progress,
            } => {
                let long_polling_disabled = !self.config.enabled || request.long_polling_disabled();
                tracing::debug!(
                    request_id = id,
                    job_type = %request.job_type,
                    worker = %request.worker,
                    max_jobs = request.max_jobs_to_activate,
                    long_polling_disabled,
                    "Received activation request"
                );
                self.requests.insert(
                    id,
                    InflightRequest {
                        request,
                        sink,
                        progress,
                        state: RequestState::Pending,
                        has_timer: false,
                        long_polling_disabled,
                        done: CancellationToken::new(),
                    },
                );
                if let Some(rejection) = self.malformed(id) {
                    self.abort(id, Status::from(BrokerError::Rejected(rejection)));
                    return;
                }
                self.try_activate(id);
            }
            CoordinatorMessage::JobsAvailable(job_type) => self.jobs_available(&job_type),
            CoordinatorMessage::Stats {
                job_type,
                response_tx,
            } => {
                self.purge(&job_type);
                let stats = self
                    .job_types
                    .get(&job_type)
                    .map(|availability| JobTypeStats {
                        empty_responses: availability.empty_responses,
                        blocked: availability.blocked.len(),
                        active: availability.active.len(),
                    })
                    .unwrap_or_default();
                let _ = response_tx.send(stats);
            }
        }
    }

    /// A request no partition would accept is refused before it can touch the job type's
    /// empty streak.
    fn malformed(&self, id: u64) -> Option<Rejection> {
        let request = &self.requests.get(&id)?.request;
        batch::validate(&request.to_batch_request(request.max_jobs_to_activate))
    }

    /// Dispatch now, or park when the job type has been empty too often.
    fn try_activate(&mut self, id: u64) {
        if !self.is_live(id) {
            return;
        }
        let Some(request) = self.requests.get(&id) else {
            return;
        };
        let job_type = request.request.job_type.clone();
        let long_polling_disabled = request.long_polling_disabled;
        let threshold = self.config.min_empty_responses;
        let availability = self
            .job_types
            .entry(job_type)
            .or_insert_with(JobTypeAvailability::new);

        if long_polling_disabled || availability.empty_responses < threshold {
            self.dispatch(id);
        } else {
            self.block(id);
        }
    }

    fn dispatch(&mut self, id: u64) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        request.set_state(RequestState::Active);

        let job_type = request.request.job_type.clone();
        self.job_types
            .entry(job_type.clone())
            .or_insert_with(JobTypeAvailability::new)
            .active
            .insert(id);
        let start = self.cursors.get(&job_type).copied().unwrap_or(0);

        let dispatcher = self.dispatcher.clone();
        let activation = request.request.clone();
        let sink = request.sink.clone();
        let done = request.done.clone();
        let internal_tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(&activation, start, &sink, &done).await;
            let _ = internal_tx.send(InternalEvent::DispatchCompleted {
                id,
                job_type,
                outcome,
            });
        });
    }

    fn on_dispatch_completed(&mut self, id: u64, job_type: String, outcome: DispatchOutcome) {
        self.cursors.insert(job_type.clone(), outcome.cursor);
        let availability = self
            .job_types
            .entry(job_type.clone())
            .or_insert_with(JobTypeAvailability::new);
        availability.active.remove(&id);
        let repeat = availability.to_be_repeated.remove(&id);

        let Some(request) = self.requests.get(&id) else {
            // timed out or canceled while in flight
            return;
        };
        let long_polling_disabled = request.long_polling_disabled;
        let max_jobs = request.request.max_jobs_to_activate;

        if let Some(status) = outcome.error {
            self.abort(id, status);
            return;
        }
        if outcome.delivery_failed {
            self.abort(
                id,
                Status::aborted("Activated jobs could not be delivered to the worker"),
            );
            return;
        }
        if outcome.activated > 0 {
            tracing::debug!(
                request_id = id,
                job_type = %job_type,
                activated = outcome.activated,
                max_jobs,
                "Activation completed with jobs"
            );
            self.finish(id, RequestState::Completed);
            self.jobs_available(&job_type);
            return;
        }
        if outcome.resource_exhausted {
            self.abort(
                id,
                Status::resource_exhausted(format!(
                    "Expected to activate jobs of type '{job_type}', but no jobs available and at least one broker returned 'RESOURCE_EXHAUSTED'. Please try again later."
                )),
            );
            return;
        }
        if long_polling_disabled {
            self.finish(id, RequestState::Completed);
            return;
        }

        self.arm_timer(id);
        if repeat {
            tracing::trace!(request_id = id, job_type = %job_type, "Repeating activation");
            self.dispatch(id);
        } else {
            if let Some(availability) = self.job_types.get_mut(&job_type) {
                availability.increment_empty_responses();
            }
            self.block(id);
        }
    }

    fn block(&mut self, id: u64) {
        self.arm_timer(id);
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        request.set_state(RequestState::Pending);
        let job_type = request.request.job_type.clone();
        self.job_types
            .entry(job_type.clone())
            .or_insert_with(JobTypeAvailability::new)
            .blocked
            .push_back(id);
        tracing::trace!(request_id = id, job_type = %job_type, "Parked activation request");
    }

    /// Reset the empty streak, mark in-flight requests for one repeat, and retry every
    /// parked request in park order.
    fn jobs_available(&mut self, job_type: &str) {
        let Some(availability) = self.job_types.get_mut(job_type) else {
            return;
        };
        availability.reset_empty_responses();
        let active: Vec<u64> = availability.active.iter().copied().collect();
        availability.to_be_repeated.extend(active);
        let blocked: Vec<u64> = availability.blocked.drain(..).collect();

        if !blocked.is_empty() {
            tracing::debug!(job_type, unblocked = blocked.len(), "Jobs available, unblocking requests");
        }
        for id in blocked {
            self.try_activate(id);
        }
    }

    fn arm_timer(&mut self, id: u64) {
        let default_timeout = self.config.timeout();
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if request.has_timer {
            return;
        }
        request.has_timer = true;
        request.publish();

        let timeout = request.request.long_polling_timeout(default_timeout);
        let done = request.done.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = internal_tx.send(InternalEvent::TimerExpired { id });
                }
            }
        });
    }

    /// Long-poll timeout: the request completes with whatever it already received.
    fn on_timer_expired(&mut self, id: u64) {
        if self.requests.contains_key(&id) {
            tracing::debug!(request_id = id, "Activation request timed out");
            self.finish(id, RequestState::TimedOut);
        }
    }

    fn probe(&mut self) {
        let probe_timeout = self.config.probe_timeout();
        let now = Instant::now();
        let stale: Vec<String> = self
            .job_types
            .iter()
            .filter(|(_, availability)| now.duration_since(availability.last_updated) >= probe_timeout)
            .map(|(job_type, _)| job_type.clone())
            .collect();

        for job_type in stale {
            self.purge(&job_type);
            let Some(availability) = self.job_types.get_mut(&job_type) else {
                continue;
            };
            match availability.blocked.pop_front() {
                Some(id) => {
                    tracing::trace!(request_id = id, job_type = %job_type, "Probing with parked request");
                    self.dispatch(id);
                }
                None => availability.decrement_empty_responses(),
            }
        }
    }

    /// Drop parked entries whose request is gone or whose caller went away.
    fn purge(&mut self, job_type: &str) {
        let Some(blocked) = self
            .job_types
            .get(job_type)
            .map(|availability| availability.blocked.clone())
        else {
            return;
        };
        let live: VecDeque<u64> = blocked.into_iter().filter(|id| self.is_live(*id)).collect();
        if let Some(availability) = self.job_types.get_mut(job_type) {
            availability.blocked = live;
        }
    }

    /// Whether the request still exists; a request whose caller dropped the response is
    /// canceled here.
    fn is_live(&mut self, id: u64) -> bool {
        let closed = match self.requests.get(&id) {
            Some(request) => request.sink.is_closed(),
            None => return false,
        };
        if closed {
            tracing::debug!(request_id = id, "Activation request canceled by caller");
            self.finish(id, RequestState::Canceled);
            return false;
        }
        true
    }

    fn abort(&mut self, id: u64, status: Status) {
        let Some(sink) = self.requests.get(&id).map(|request| request.sink.clone()) else {
            return;
        };
        tracing::debug!(request_id = id, code = ?status.code(), message = status.message(), "Aborting activation request");
        self.finish(id, RequestState::Aborted);

        if let Err(TrySendError::Full(item)) = sink.try_send(Err(status)) {
            tokio::spawn(async move {
                let _ = sink.send(item).await;
            });
        }
    }

    fn finish(&mut self, id: u64, state: RequestState) {
        let Some(mut request) = self.requests.remove(&id) else {
            return;
        };
        request.done.cancel();
        request.has_timer = false;
        request.set_state(state);
    }
}

async fn next_notification(
    subscription: &mut Option<JobAvailabilitySubscription>,
) -> Option<Notification> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
