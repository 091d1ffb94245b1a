//! Queue polling engine: supervisor, workers, and autoscaler.
//!
//! The poller registers one or more encrypted queues with the
//! coordinator and long-polls each on a dedicated worker task. Inbound
//! envelopes are unwrapped, dispatched to typed handlers, and the
//! encrypted replies posted back. A 1-second scaler grows the worker set
//! when batches run full and shrinks it when they run empty. Shutdown
//! drains every worker within a bounded grace period and deletes its
//! queue at the coordinator.

mod github;
mod invoke;
mod ping;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use relay_api::ecies;
use relay_api::messages::{RunnerRequest, RunnerResponse};
use relay_api::p256;
use relay_api::types::{QueueMessage, RunnerQueue, RunnerQueueUpdate};
use relay_api::CoordinatorApi;

use crate::backoff::Backoff;
use crate::config::GithubInfo;
use crate::error::{Error, Result};
use crate::github::GithubClient;
use crate::runtime::RuntimeProvider;

/// Attempts for queue-management operations before giving up.
const MAX_RETRIES: usize = 5;

/// Nominal full-batch size used to normalize fill ratios.
const BATCH_CAPACITY: f64 = 10.0;

/// Long-poll duration requested from the coordinator.
const LONG_POLL_SECONDS: u32 = 30;

/// Idle time after which a draining worker exits.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

const SCALE_TICK: Duration = Duration::from_secs(1);
const SCALE_UP_WINDOW: Duration = Duration::from_secs(60);
const SCALE_DOWN_WINDOW: Duration = Duration::from_secs(120);
const SCALE_UP_THRESHOLD: f64 = 0.8;
const SCALE_DOWN_THRESHOLD: f64 = 0.4;

/// One live queue and its worker-local state.
struct Queue {
    queue_id: String,
    /// Ends all work on this queue; child of the supervisor scope.
    cancel: CancellationToken,
    /// Idempotent drain signal; cancelled means the worker is draining.
    drain: CancellationToken,
    /// This queue's cryptographic identity. Never shared across queues.
    secret_key: p256::SecretKey,
    /// Set when the coordinator reported the queue gone; skips deletion.
    skip_delete: AtomicBool,
}

impl Queue {
    fn generate(parent: &CancellationToken) -> Self {
        Self {
            queue_id: Uuid::new_v4().to_string(),
            cancel: parent.child_token(),
            drain: CancellationToken::new(),
            secret_key: ecies::generate_keypair(),
            skip_delete: AtomicBool::new(false),
        }
    }
}

/// Mutable supervisor state, guarded by one mutex that is never held
/// across I/O.
struct PollerState {
    queues: Vec<Arc<Queue>>,
    n_expected: i64,
    n_actual: i64,
    last_scale_event: Instant,
    measure_start: Instant,
    n_batches: u64,
    sum_batch_pct: f64,
}

impl PollerState {
    fn reset_stats(&mut self) {
        self.measure_start = Instant::now();
        self.n_batches = 0;
        self.sum_batch_pct = 0.0;
    }
}

/// Options for constructing a [`Poller`].
pub struct PollerOptions {
    /// Container runtime consumed by agent invocations.
    pub runtime: Option<Arc<dyn RuntimeProvider>>,
    /// GitHub connections indexed by connection id.
    pub connections: HashMap<String, GithubInfo>,
    /// Long-poll duration requested from the coordinator.
    pub max_wait_seconds: u32,
    /// Idle time after which a draining worker exits.
    pub drain_grace: Duration,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            runtime: None,
            connections: HashMap::new(),
            max_wait_seconds: LONG_POLL_SECONDS,
            drain_grace: DRAIN_GRACE,
        }
    }
}

/// Supervisor owning the queue workers and the autoscaler.
pub struct Poller {
    client: Arc<dyn CoordinatorApi>,
    tenant_id: String,
    runner_id: String,
    state: Mutex<PollerState>,
    tracker: TaskTracker,
    /// Supervisor scope; cancelling it is fatal to every task.
    root: CancellationToken,
    /// Scope of the scaler tick, cancelled on shutdown.
    scale_cancel: CancellationToken,
    queue_management_backoff: Backoff,
    batch_backoff: Backoff,
    runtime: Option<Arc<dyn RuntimeProvider>>,
    connection_idx: HashMap<String, GithubInfo>,
    github_clients: Mutex<HashMap<String, Arc<GithubClient>>>,
    max_wait_seconds: u32,
    drain_grace: Duration,
}

impl Poller {
    /// Start a poller with one initial queue worker and the autoscaler.
    pub fn new(
        client: Arc<dyn CoordinatorApi>,
        tenant_id: &str,
        runner_id: &str,
        options: PollerOptions,
    ) -> Arc<Self> {
        let poller = Self::build(client, tenant_id, runner_id, options);

        let initial = {
            let state = poller.state.lock().unwrap();
            Arc::clone(&state.queues[0])
        };

        let scaler = Arc::clone(&poller);
        poller.tracker.spawn(async move { scaler.run_scaler().await });
        poller.spawn_worker(initial);

        info!(
            tenant_id = %poller.tenant_id,
            runner_id = %poller.runner_id,
            "poller started"
        );
        poller
    }

    /// Construct the supervisor without spawning any tasks.
    fn build(
        client: Arc<dyn CoordinatorApi>,
        tenant_id: &str,
        runner_id: &str,
        options: PollerOptions,
    ) -> Arc<Self> {
        let root = CancellationToken::new();
        let scale_cancel = root.child_token();
        let queue = Arc::new(Queue::generate(&root));

        Arc::new(Self {
            client,
            tenant_id: tenant_id.to_string(),
            runner_id: runner_id.to_string(),
            state: Mutex::new(PollerState {
                queues: vec![queue],
                n_expected: 1,
                n_actual: 0,
                last_scale_event: Instant::now(),
                measure_start: Instant::now(),
                n_batches: 0,
                sum_batch_pct: 0.0,
            }),
            tracker: TaskTracker::new(),
            root,
            scale_cancel,
            queue_management_backoff: Backoff::new(
                Duration::from_millis(10),
                Duration::from_secs(5),
            ),
            batch_backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(50)),
            runtime: options.runtime,
            connection_idx: options.connections,
            github_clients: Mutex::new(HashMap::new()),
            max_wait_seconds: options.max_wait_seconds,
            drain_grace: options.drain_grace,
        })
    }

    fn spawn_worker(self: &Arc<Self>, queue: Arc<Queue>) {
        let poller = Arc::clone(self);
        self.tracker
            .spawn(async move { poller.run_worker(queue).await });
    }

    // --- autoscaler ---

    async fn run_scaler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SCALE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.scale_cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.do_scale();
        }
    }

    fn do_scale(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        // The previous scale operation has not quiesced yet.
        if state.n_expected != state.n_actual {
            return;
        }

        // Less than one minute of utilization data.
        if now.duration_since(state.measure_start) < SCALE_UP_WINDOW {
            return;
        }

        // Less than one minute since the last scale event.
        if now.duration_since(state.last_scale_event) < SCALE_UP_WINDOW {
            return;
        }

        if state.n_batches == 0 {
            return;
        }

        let mean = state.sum_batch_pct / state.n_batches as f64;
        if mean >= SCALE_UP_THRESHOLD {
            // Batches have averaged >= 80% full for at least a minute.
            self.scale_up(&mut state);
            return;
        }

        // Scale-down needs a two-minute measurement window.
        if now.duration_since(state.measure_start) < SCALE_DOWN_WINDOW {
            return;
        }

        // And at least two minutes since the last scale event.
        if now.duration_since(state.last_scale_event) < SCALE_DOWN_WINDOW {
            state.reset_stats();
            return;
        }

        if mean <= SCALE_DOWN_THRESHOLD {
            self.scale_down(&mut state);
            return;
        }

        // Between 40% and 80% full: steady state, just restart the window.
        state.reset_stats();
    }

    /// Double the number of queue workers.
    fn scale_up(self: &Arc<Self>, state: &mut PollerState) {
        state.reset_stats();

        let n_to_add = state.queues.len();
        for _ in 0..n_to_add {
            let queue = Arc::new(Queue::generate(&self.root));
            state.n_expected += 1;
            state.queues.push(Arc::clone(&queue));
            self.spawn_worker(queue);
        }

        if state.n_expected == state.n_actual {
            state.last_scale_event = Instant::now();
        }
        info!(added = n_to_add, total = state.queues.len(), "scaling up queue workers");
    }

    /// Remove one queue worker, never going below one.
    fn scale_down(&self, state: &mut PollerState) {
        state.reset_stats();
        if state.queues.len() == 1 {
            state.last_scale_event = Instant::now();
            return;
        }
        let Some(last) = state.queues.pop() else {
            return;
        };
        state.n_expected -= 1;
        last.drain.cancel();
        info!(queue_id = %last.queue_id, total = state.queues.len(), "scaling down queue workers");
    }

    fn add_stats(&self, pct: f64) {
        let mut state = self.state.lock().unwrap();
        state.sum_batch_pct += pct;
        state.n_batches += 1;
    }

    fn increase_actual_queue_count(&self) {
        let mut state = self.state.lock().unwrap();
        state.n_actual += 1;
        if state.n_actual == state.n_expected {
            state.last_scale_event = Instant::now();
        }
    }

    fn decrease_actual_queue_count(&self) {
        let mut state = self.state.lock().unwrap();
        state.n_actual -= 1;
        if state.n_actual == state.n_expected {
            state.last_scale_event = Instant::now();
        }
    }

    // --- worker lifecycle ---

    async fn run_worker(self: Arc<Self>, queue: Arc<Queue>) {
        if self.create_queue(&queue).await.is_ok() {
            self.poll_queue(&queue).await;
            self.delete_queue_if_needed(&queue).await;
        }
        self.decrease_actual_queue_count();
        queue.cancel.cancel();
    }

    /// Register the queue at the coordinator, retrying until success,
    /// cancellation, or a pre-creation drain. `n_actual` is adjusted
    /// regardless of the outcome so it always mirrors worker exits.
    async fn create_queue(&self, queue: &Queue) -> Result<()> {
        let result = self.register_queue(queue).await;
        self.increase_actual_queue_count();
        result
    }

    async fn register_queue(&self, queue: &Queue) -> Result<()> {
        // Failure to serialize an in-memory key is a programmer error.
        let public_key = ecies::public_key_to_pem(&queue.secret_key.public_key())
            .expect("serialize queue public key");

        loop {
            if queue.cancel.is_cancelled() || queue.drain.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.queue_management_backoff.wait(&queue.cancel).await?;

            match self
                .client
                .register_runner_queue(&self.tenant_id, &self.runner_id, &queue.queue_id, &public_key)
                .await
            {
                Ok(()) => {
                    info!(queue_id = %queue.queue_id, "successfully created queue");
                    self.queue_management_backoff.recover();
                    return Ok(());
                }
                // Conflict means the queue already exists.
                Err(relay_api::Error::Conflict { .. }) => return Ok(()),
                Err(err) => {
                    self.queue_management_backoff.backoff();
                    error!(queue_id = %queue.queue_id, error = %err, "RegisterRunnerQueue failed");
                }
            }
        }
    }

    async fn poll_queue(self: &Arc<Self>, queue: &Arc<Queue>) {
        loop {
            if queue.cancel.is_cancelled() {
                return;
            }
            if queue.drain.is_cancelled() {
                break;
            }
            let (_, stop) = self.do_poll(queue).await;
            if stop {
                return;
            }
        }

        self.mark_as_draining(queue).await;
        queue.drain.cancel();

        let drain_start = Instant::now();
        loop {
            if queue.cancel.is_cancelled() {
                return;
            }
            let (n, stop) = self.do_poll(queue).await;
            if stop {
                return;
            }
            if n == 0 && drain_start.elapsed() >= self.drain_grace {
                return;
            }
        }
    }

    /// One long-poll: returns the batch size and whether the worker must
    /// stop polling.
    async fn do_poll(self: &Arc<Self>, queue: &Arc<Queue>) -> (usize, bool) {
        if self.batch_backoff.wait(&queue.cancel).await.is_err() {
            return (0, true);
        }

        let result = tokio::select! {
            _ = queue.cancel.cancelled() => return (0, true),
            result = self.client.get_messages_batch(
                &self.tenant_id,
                &self.runner_id,
                &queue.queue_id,
                self.max_wait_seconds,
            ) => result,
        };

        let batch = match result {
            Ok(batch) => batch,
            Err(relay_api::Error::NotFound) => {
                self.handle_queue_not_found(queue);
                return (0, true);
            }
            Err(err) => {
                error!(queue_id = %queue.queue_id, error = %err, "unable to get messages batch");
                self.batch_backoff.backoff();
                return (0, false);
            }
        };

        if batch.messages.is_empty() {
            self.batch_backoff.backoff();
        } else {
            self.batch_backoff.recover();
        }

        self.add_stats(batch.messages.len() as f64 / BATCH_CAPACITY);

        let n = batch.messages.len();
        for message in batch.messages {
            let poller = Arc::clone(self);
            let queue = Arc::clone(queue);
            self.tracker
                .spawn(async move { poller.process_message(message, queue).await });
        }
        (n, false)
    }

    /// The coordinator no longer knows this queue: the worker is a ghost.
    /// Unless the poller is draining or shutting down, swap in a fresh
    /// queue so the live worker count keeps matching the scaler's intent.
    fn handle_queue_not_found(self: &Arc<Self>, queue: &Arc<Queue>) {
        queue.skip_delete.store(true, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();

        if queue.drain.is_cancelled() || queue.cancel.is_cancelled() || state.n_expected == 0 {
            info!(queue_id = %queue.queue_id, "queue removed during shutdown; skipping replacement");
            return;
        }

        let Some(index) = state.queues.iter().position(|q| Arc::ptr_eq(q, queue)) else {
            warn!(queue_id = %queue.queue_id, "unable to replace missing queue");
            return;
        };

        state.n_expected -= 1;
        state.queues.remove(index);

        let replacement = Arc::new(Queue::generate(&self.root));
        state.n_expected += 1;
        state.queues.push(Arc::clone(&replacement));
        self.spawn_worker(Arc::clone(&replacement));

        info!(
            old_queue = %queue.queue_id,
            new_queue = %replacement.queue_id,
            "replaced missing queue"
        );
    }

    // --- message processing ---

    async fn process_message(self: Arc<Self>, message: QueueMessage, queue: Arc<Queue>) {
        let span = tracing::info_span!(
            "message",
            queue_id = %queue.queue_id,
            message_id = %message.message_id,
            caller_id = %message.caller_id,
        );

        async {
            let caller_public_key = match ecies::public_key_from_pem(&message.caller_public_key) {
                Ok(key) => key,
                Err(err) => {
                    error!(error = %err, "unable to parse caller public key");
                    return;
                }
            };

            let plaintext = match ecies::unwrap(&message.payload, &queue.secret_key) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    error!(error = %err, "unable to decrypt message");
                    return;
                }
            };

            let request: RunnerRequest = match serde_json::from_slice(&plaintext) {
                Ok(request) => request,
                Err(err) => {
                    error!(error = %err, "unable to parse message");
                    return;
                }
            };

            let response = self.dispatch(request, &queue).await;

            let response_json = match serde_json::to_vec(&response) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(error = %err, "unable to serialize response");
                    return;
                }
            };

            let wrapped = match ecies::wrap(&response_json, &caller_public_key) {
                Ok(wrapped) => wrapped,
                Err(err) => {
                    error!(error = %err, "unable to encrypt response");
                    return;
                }
            };

            // Write failures are not retried here; the coordinator
            // redelivers or expires the message per its own contract.
            if let Err(err) = self
                .client
                .write_response(
                    &self.tenant_id,
                    &self.runner_id,
                    &queue.queue_id,
                    &message.message_id,
                    &message.caller_id,
                    &wrapped,
                )
                .await
            {
                error!(error = %err, "unable to write response");
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(self: &Arc<Self>, request: RunnerRequest, queue: &Arc<Queue>) -> RunnerResponse {
        match request {
            RunnerRequest::PingRequest(request) => {
                RunnerResponse::PingResponse(ping::process(request))
            }
            RunnerRequest::InvokeAgentRequest(request) => {
                RunnerResponse::InvokeAgentResponse(invoke::process(self, request, queue).await)
            }
            RunnerRequest::ListOrgsForConnectionRequest(request) => {
                RunnerResponse::ListOrgsForConnectionResponse(github::list_orgs(self, request).await)
            }
            RunnerRequest::SearchRepoRequest(request) => {
                RunnerResponse::SearchRepoResponse(github::search_repos(self, request).await)
            }
            RunnerRequest::ListRepoBranchesRequest(request) => {
                RunnerResponse::ListRepoBranchesResponse(github::list_branches(self, request).await)
            }
        }
    }

    /// Cached GitHub client for a configured connection id.
    fn get_github_client(&self, connection_id: &str) -> Result<Arc<GithubClient>> {
        let mut clients = self.github_clients.lock().unwrap();
        if let Some(client) = clients.get(connection_id) {
            return Ok(Arc::clone(client));
        }
        let Some(info) = self.connection_idx.get(connection_id) else {
            return Err(Error::Github(format!(
                "github connection {connection_id} not found"
            )));
        };
        if info.token.is_empty() {
            return Err(Error::Github(format!(
                "missing github token for connection {connection_id}"
            )));
        }
        let client = Arc::new(GithubClient::new(&info.token, &info.url)?);
        clients.insert(connection_id.to_string(), Arc::clone(&client));
        Ok(client)
    }

    // --- drain & delete protocols ---

    async fn mark_as_draining(&self, queue: &Queue) {
        let mut record: Option<RunnerQueue> = None;

        for _ in 0..MAX_RETRIES {
            if self.queue_management_backoff.wait(&queue.cancel).await.is_err() {
                error!(queue_id = %queue.queue_id, "unable to mark queue as draining: backoff wait cancelled");
                return;
            }

            if record.is_none() {
                match self
                    .client
                    .get_runner_queue(&self.tenant_id, &self.runner_id, &queue.queue_id)
                    .await
                {
                    Ok(current) => record = Some(current),
                    Err(err) => {
                        error!(queue_id = %queue.queue_id, error = %err, "unable to mark queue as draining: GetRunnerQueue failed");
                        self.queue_management_backoff.backoff();
                        continue;
                    }
                }
            }
            let version = match &record {
                Some(current) => current.version,
                None => continue,
            };

            match self
                .client
                .update_runner_queue(
                    &self.tenant_id,
                    &self.runner_id,
                    &queue.queue_id,
                    version,
                    RunnerQueueUpdate {
                        draining: Some(true),
                        is_healthy: Some(false),
                    },
                )
                .await
            {
                Ok(_) => {
                    self.queue_management_backoff.recover();
                    info!(queue_id = %queue.queue_id, "marked queue as draining");
                    return;
                }
                Err(err) => {
                    if let relay_api::Error::Conflict { current } = &err {
                        record = current.clone();
                    }
                    error!(queue_id = %queue.queue_id, error = %err, "unable to mark queue as draining: UpdateRunnerQueue failed");
                    self.queue_management_backoff.backoff();
                }
            }
        }
        error!(queue_id = %queue.queue_id, "unable to mark queue as draining: exhausted retries");
    }

    async fn delete_queue_if_needed(&self, queue: &Queue) {
        if queue.skip_delete.load(Ordering::SeqCst) {
            return;
        }
        self.delete_queue(queue).await;
    }

    async fn delete_queue(&self, queue: &Queue) {
        let mut record: Option<RunnerQueue> = None;

        for _ in 0..MAX_RETRIES {
            if self.queue_management_backoff.wait(&queue.cancel).await.is_err() {
                error!(queue_id = %queue.queue_id, "unable to delete queue: backoff wait cancelled");
                return;
            }

            if record.is_none() {
                match self
                    .client
                    .get_runner_queue(&self.tenant_id, &self.runner_id, &queue.queue_id)
                    .await
                {
                    Ok(current) => record = Some(current),
                    Err(err) => {
                        error!(queue_id = %queue.queue_id, error = %err, "unable to delete queue: GetRunnerQueue failed");
                        self.queue_management_backoff.backoff();
                        continue;
                    }
                }
            }
            let version = match &record {
                Some(current) => current.version,
                None => continue,
            };

            match self
                .client
                .delete_runner_queue(&self.tenant_id, &self.runner_id, &queue.queue_id, version)
                .await
            {
                Ok(()) => {
                    self.queue_management_backoff.recover();
                    info!(queue_id = %queue.queue_id, "deleted queue");
                    return;
                }
                Err(err) => {
                    if let relay_api::Error::Conflict { current } = &err {
                        record = current.clone();
                    }
                    error!(queue_id = %queue.queue_id, error = %err, "unable to delete queue: DeleteRunnerQueue failed");
                    self.queue_management_backoff.backoff();
                }
            }
        }
        error!(queue_id = %queue.queue_id, "unable to delete queue: exhausted retries");
    }

    // --- shutdown ---

    fn drain_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.reset_stats();
        state.n_expected = 0;
        for queue in state.queues.drain(..) {
            queue.drain.cancel();
        }
    }

    /// Signal every worker to drain and wait for all tasks to finish.
    pub async fn shutdown(&self) {
        self.drain_all();
        self.scale_cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// [`Poller::shutdown`] bounded by a deadline. On timeout the poller
    /// is still logically shut down; call [`Poller::close`] to force the
    /// remaining tasks down.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.shutdown())
            .await
            .map_err(|_| Error::ShutdownTimeout)
    }

    /// Cancel every remaining task and wait for them to exit.
    pub async fn close(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_api::messages::PingResponse;
    use relay_api::types::{MessageBatch, Turn};
    use relay_api::{ecies::WrappedSecret, Result as ApiResult};
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::AtomicUsize;

    /// Scripted outcome for an update/delete attempt.
    enum WriteOutcome {
        Conflict(i64),
        Ok,
    }

    struct MockCoordinator {
        caller_key: p256::SecretKey,
        /// queue id -> registered public key (in registration order)
        registered: Mutex<Vec<(String, String)>>,
        /// plaintexts wrapped into single-message batches, FIFO
        pending_plaintexts: Mutex<VecDeque<Vec<u8>>>,
        /// queue ids whose long-polls return NotFound
        missing_queues: Mutex<HashSet<String>>,
        /// fail the next long-poll with NotFound, whatever the queue
        ghost_next_poll: AtomicBool,
        update_script: Mutex<VecDeque<WriteOutcome>>,
        delete_script: Mutex<VecDeque<WriteOutcome>>,
        update_calls: AtomicUsize,
        update_versions: Mutex<Vec<i64>>,
        delete_calls: Mutex<Vec<String>>,
        responses: Mutex<Vec<(String, WrappedSecret)>>,
    }

    impl MockCoordinator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                caller_key: ecies::generate_keypair(),
                registered: Mutex::new(Vec::new()),
                pending_plaintexts: Mutex::new(VecDeque::new()),
                missing_queues: Mutex::new(HashSet::new()),
                ghost_next_poll: AtomicBool::new(false),
                update_script: Mutex::new(VecDeque::new()),
                delete_script: Mutex::new(VecDeque::new()),
                update_calls: AtomicUsize::new(0),
                update_versions: Mutex::new(Vec::new()),
                delete_calls: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, queue_id: &str, version: i64) -> RunnerQueue {
            RunnerQueue {
                tenant_id: "tenant-1".to_string(),
                runner_id: "runner-1".to_string(),
                queue_id: queue_id.to_string(),
                version,
                draining: false,
                is_healthy: true,
                public_key: String::new(),
            }
        }

        fn queue_plaintext(&self, plaintext: Vec<u8>) {
            self.pending_plaintexts.lock().unwrap().push_back(plaintext);
        }

        fn queue_ping(&self) {
            self.queue_plaintext(br#"{"type":"pingRequest"}"#.to_vec());
        }

        fn registered_ids(&self) -> Vec<String> {
            self.registered
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }

        fn response_count(&self) -> usize {
            self.responses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CoordinatorApi for MockCoordinator {
        async fn register_runner_queue(
            &self,
            _tenant_id: &str,
            _runner_id: &str,
            queue_id: &str,
            public_key: &str,
        ) -> ApiResult<()> {
            self.registered
                .lock()
                .unwrap()
                .push((queue_id.to_string(), public_key.to_string()));
            Ok(())
        }

        async fn get_runner_queue(
            &self,
            _tenant_id: &str,
            _runner_id: &str,
            queue_id: &str,
        ) -> ApiResult<RunnerQueue> {
            Ok(self.record(queue_id, 1))
        }

        async fn update_runner_queue(
            &self,
            _tenant_id: &str,
            _runner_id: &str,
            queue_id: &str,
            version: i64,
            _update: RunnerQueueUpdate,
        ) -> ApiResult<RunnerQueue> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            self.update_versions.lock().unwrap().push(version);
            match self.update_script.lock().unwrap().pop_front() {
                Some(WriteOutcome::Conflict(current)) => Err(relay_api::Error::Conflict {
                    current: Some(self.record(queue_id, current)),
                }),
                Some(WriteOutcome::Ok) | None => Ok(self.record(queue_id, version + 1)),
            }
        }

        async fn delete_runner_queue(
            &self,
            _tenant_id: &str,
            _runner_id: &str,
            queue_id: &str,
            version: i64,
        ) -> ApiResult<()> {
            match self.delete_script.lock().unwrap().pop_front() {
                Some(WriteOutcome::Conflict(current)) => {
                    self.delete_calls.lock().unwrap().push(queue_id.to_string());
                    Err(relay_api::Error::Conflict {
                        current: Some(self.record(queue_id, current)),
                    })
                }
                Some(WriteOutcome::Ok) | None => {
                    let _ = version;
                    self.delete_calls.lock().unwrap().push(queue_id.to_string());
                    Ok(())
                }
            }
        }

        async fn get_messages_batch(
            &self,
            _tenant_id: &str,
            _runner_id: &str,
            queue_id: &str,
            _max_wait_seconds: u32,
        ) -> ApiResult<MessageBatch> {
            if self.ghost_next_poll.swap(false, Ordering::SeqCst) {
                self.missing_queues
                    .lock()
                    .unwrap()
                    .insert(queue_id.to_string());
            }
            if self.missing_queues.lock().unwrap().contains(queue_id) {
                return Err(relay_api::Error::NotFound);
            }

            let plaintext = self.pending_plaintexts.lock().unwrap().pop_front();
            let Some(plaintext) = plaintext else {
                // Behave like a long-poll that timed out empty.
                tokio::time::sleep(Duration::from_millis(5)).await;
                return Ok(MessageBatch::default());
            };

            let public_key = self
                .registered
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == queue_id)
                .map(|(_, pem)| pem.clone())
                .expect("batch requested for unregistered queue");
            let recipient = ecies::public_key_from_pem(&public_key).unwrap();

            Ok(MessageBatch {
                messages: vec![QueueMessage {
                    message_id: Uuid::new_v4().to_string(),
                    caller_id: "caller-1".to_string(),
                    caller_public_key: ecies::public_key_to_pem(&self.caller_key.public_key())
                        .unwrap(),
                    payload: ecies::wrap(&plaintext, &recipient).unwrap(),
                }],
            })
        }

        async fn write_response(
            &self,
            _tenant_id: &str,
            _runner_id: &str,
            _queue_id: &str,
            message_id: &str,
            _caller_id: &str,
            payload: &WrappedSecret,
        ) -> ApiResult<()> {
            self.responses
                .lock()
                .unwrap()
                .push((message_id.to_string(), payload.clone()));
            Ok(())
        }

        async fn update_turn(
            &self,
            _agent_token: &str,
            tenant_id: &str,
            task_id: &str,
            turn_index: u32,
            version: i64,
            status: &str,
        ) -> ApiResult<Turn> {
            Ok(Turn {
                tenant_id: tenant_id.to_string(),
                task_id: task_id.to_string(),
                turn_index,
                version: version + 1,
                status: Some(status.to_string()),
                created_at: None,
            })
        }
    }

    fn test_options() -> PollerOptions {
        PollerOptions {
            drain_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn built(api: &Arc<MockCoordinator>) -> Arc<Poller> {
        Poller::build(
            Arc::clone(api) as Arc<dyn CoordinatorApi>,
            "tenant-1",
            "runner-1",
            test_options(),
        )
    }

    /// Age every scaler gate uniformly. Tests using this run on the
    /// paused tokio clock.
    async fn age(by: Duration) {
        tokio::time::advance(by).await;
    }

    fn seed_stats(poller: &Poller, n_batches: u64, sum_batch_pct: f64) {
        let mut state = poller.state.lock().unwrap();
        state.n_batches = n_batches;
        state.sum_batch_pct = sum_batch_pct;
        state.n_actual = state.n_expected;
    }

    fn queue_count(poller: &Poller) -> usize {
        poller.state.lock().unwrap().queues.len()
    }

    async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            if start.elapsed() > deadline {
                panic!("condition not reached within {deadline:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scaler_is_gated_by_warmup() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        seed_stats(&poller, 10, 9.0);

        poller.do_scale();

        assert_eq!(queue_count(&poller), 1);
        assert_eq!(poller.state.lock().unwrap().n_expected, 1);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scaler_waits_for_quiescence() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(61)).await;
        {
            let mut state = poller.state.lock().unwrap();
            state.n_batches = 10;
            state.sum_batch_pct = 9.0;
            state.n_actual = 0; // previous change not quiesced
        }

        poller.do_scale();

        assert_eq!(queue_count(&poller), 1);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scaler_needs_at_least_one_sample() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(61)).await;
        {
            let mut state = poller.state.lock().unwrap();
            state.n_actual = 1;
        }

        poller.do_scale();

        assert_eq!(queue_count(&poller), 1);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_batches_double_the_worker_count() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(61)).await;
        seed_stats(&poller, 10, 9.0);

        poller.do_scale();

        let state = poller.state.lock().unwrap();
        assert_eq!(state.queues.len(), 2);
        assert_eq!(state.n_expected, 2);
        assert_eq!(state.n_batches, 0);
        drop(state);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn steady_state_only_resets_the_window() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(130)).await;
        seed_stats(&poller, 10, 6.0);

        poller.do_scale();

        let state = poller.state.lock().unwrap();
        assert_eq!(state.queues.len(), 1);
        assert_eq!(state.n_batches, 0);
        drop(state);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_needs_two_minute_window() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(200)).await;
        {
            // Last scale event is 200 s back; the window is only 90 s old.
            let mut state = poller.state.lock().unwrap();
            state.measure_start = Instant::now() - Duration::from_secs(90);
        }
        seed_stats(&poller, 10, 3.0);

        poller.do_scale();

        // Window too short for a down decision: stats must be preserved.
        let state = poller.state.lock().unwrap();
        assert_eq!(state.queues.len(), 1);
        assert_eq!(state.n_batches, 10);
        drop(state);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_cooldown_discards_the_window() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(130)).await;
        {
            // Window is long enough, but the last scale event is not.
            let mut state = poller.state.lock().unwrap();
            state.last_scale_event = Instant::now() - Duration::from_secs(90);
        }
        seed_stats(&poller, 10, 3.0);

        poller.do_scale();

        let state = poller.state.lock().unwrap();
        assert_eq!(state.queues.len(), 1);
        assert_eq!(state.n_batches, 0);
        drop(state);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batches_remove_one_worker() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        let extra = Arc::new(Queue::generate(&poller.root));
        {
            let mut state = poller.state.lock().unwrap();
            state.queues.push(Arc::clone(&extra));
            state.n_expected = 2;
            state.n_actual = 2;
        }
        age(Duration::from_secs(130)).await;
        seed_stats(&poller, 10, 3.0);

        poller.do_scale();

        let state = poller.state.lock().unwrap();
        assert_eq!(state.queues.len(), 1);
        assert_eq!(state.n_expected, 1);
        drop(state);
        assert!(extra.drain.is_cancelled());
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_never_goes_below_one_worker() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(130)).await;
        seed_stats(&poller, 10, 3.0);

        poller.do_scale();

        let state = poller.state.lock().unwrap();
        assert_eq!(state.queues.len(), 1);
        assert_eq!(state.n_expected, 1);
        // The no-op still counts as a scale event.
        assert!(state.last_scale_event.elapsed() < Duration::from_secs(1));
        drop(state);
        poller.close().await;
    }

    #[tokio::test]
    async fn batch_fill_accounting() {
        let api = MockCoordinator::new();
        let poller = built(&api);

        poller.add_stats(0.9);
        poller.add_stats(0.0);
        poller.add_stats(0.5);

        let state = poller.state.lock().unwrap();
        assert_eq!(state.n_batches, 3);
        assert!((state.sum_batch_pct - 1.4).abs() < f64::EPSILON);
        drop(state);
        poller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn quiescence_refreshes_last_scale_event() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        age(Duration::from_secs(300)).await;

        poller.increase_actual_queue_count();

        let state = poller.state.lock().unwrap();
        assert!(state.last_scale_event.elapsed() < Duration::from_secs(1));
        drop(state);
        poller.close().await;
    }

    #[tokio::test]
    async fn ghost_queue_is_replaced_in_place() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        {
            let mut state = poller.state.lock().unwrap();
            state.n_actual = 1;
        }
        let ghost = {
            let state = poller.state.lock().unwrap();
            Arc::clone(&state.queues[0])
        };

        poller.handle_queue_not_found(&ghost);

        assert!(ghost.skip_delete.load(Ordering::SeqCst));
        let state = poller.state.lock().unwrap();
        assert_eq!(state.n_expected, 1);
        assert_eq!(state.queues.len(), 1);
        assert_ne!(state.queues[0].queue_id, ghost.queue_id);
        drop(state);
        poller.close().await;
    }

    #[tokio::test]
    async fn ghost_queue_not_replaced_while_draining() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        let ghost = {
            let state = poller.state.lock().unwrap();
            Arc::clone(&state.queues[0])
        };
        ghost.drain.cancel();

        poller.handle_queue_not_found(&ghost);

        let state = poller.state.lock().unwrap();
        assert_eq!(state.queues.len(), 1);
        assert!(Arc::ptr_eq(&state.queues[0], &ghost));
        drop(state);
        poller.close().await;
    }

    #[tokio::test]
    async fn ghost_queue_not_replaced_during_shutdown() {
        let api = MockCoordinator::new();
        let poller = built(&api);
        let ghost = {
            let state = poller.state.lock().unwrap();
            Arc::clone(&state.queues[0])
        };
        poller.drain_all();

        poller.handle_queue_not_found(&ghost);

        assert_eq!(queue_count(&poller), 0);
        poller.close().await;
    }

    #[tokio::test]
    async fn drain_mark_refreshes_version_on_conflict() {
        let api = MockCoordinator::new();
        {
            let mut script = api.update_script.lock().unwrap();
            script.push_back(WriteOutcome::Conflict(2));
            script.push_back(WriteOutcome::Conflict(3));
            script.push_back(WriteOutcome::Ok);
        }
        let poller = built(&api);
        let queue = {
            let state = poller.state.lock().unwrap();
            Arc::clone(&state.queues[0])
        };

        poller.mark_as_draining(&queue).await;

        assert_eq!(api.update_calls.load(Ordering::SeqCst), 3);
        assert_eq!(*api.update_versions.lock().unwrap(), vec![1, 2, 3]);
        // Success recovers the management backoff.
        assert_eq!(
            poller.queue_management_backoff.current(),
            Duration::from_millis(10)
        );
        poller.close().await;
    }

    #[tokio::test]
    async fn delete_gives_up_after_max_retries() {
        let api = MockCoordinator::new();
        {
            let mut script = api.delete_script.lock().unwrap();
            for _ in 0..MAX_RETRIES {
                script.push_back(WriteOutcome::Conflict(2));
            }
        }
        let poller = built(&api);
        let queue = {
            let state = poller.state.lock().unwrap();
            Arc::clone(&state.queues[0])
        };

        poller.delete_queue(&queue).await;

        assert_eq!(api.delete_calls.lock().unwrap().len(), MAX_RETRIES);
        poller.close().await;
    }

    #[tokio::test]
    async fn ping_round_trips_and_shutdown_is_bounded() {
        let api = MockCoordinator::new();
        api.queue_ping();

        let poller = Poller::new(
            Arc::clone(&api) as Arc<dyn CoordinatorApi>,
            "tenant-1",
            "runner-1",
            test_options(),
        );

        wait_until(Duration::from_secs(5), || api.response_count() == 1).await;

        // The posted reply must unwrap with the caller's key back to the
        // serialized ping response.
        let (_, payload) = api.responses.lock().unwrap()[0].clone();
        let plaintext = ecies::unwrap(&payload, &api.caller_key).unwrap();
        let reply: RunnerResponse = serde_json::from_slice(&plaintext).unwrap();
        match reply {
            RunnerResponse::PingResponse(PingResponse { error_message }) => {
                assert!(error_message.is_none())
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let started = Instant::now();
        poller.shutdown_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        // The worker marked its queue draining and deleted it.
        assert!(api.update_calls.load(Ordering::SeqCst) >= 1);
        let registered = api.registered_ids();
        assert_eq!(*api.delete_calls.lock().unwrap(), registered);
    }

    #[tokio::test]
    async fn ghost_queue_is_never_deleted_and_gets_a_replacement() {
        let api = MockCoordinator::new();
        api.ghost_next_poll.store(true, Ordering::SeqCst);

        let poller = Poller::new(
            Arc::clone(&api) as Arc<dyn CoordinatorApi>,
            "tenant-1",
            "runner-1",
            test_options(),
        );

        // The ghost's worker exits and a replacement queue registers.
        wait_until(Duration::from_secs(5), || api.registered_ids().len() == 2).await;
        {
            let state = poller.state.lock().unwrap();
            assert_eq!(state.n_expected, 1);
            assert_eq!(state.queues.len(), 1);
        }

        poller.shutdown_timeout(Duration::from_secs(5)).await.unwrap();

        let registered = api.registered_ids();
        let deleted = api.delete_calls.lock().unwrap().clone();
        assert_eq!(deleted, vec![registered[1].clone()]);
    }

    #[tokio::test]
    async fn unknown_message_types_are_dropped_without_reply() {
        let api = MockCoordinator::new();
        api.queue_plaintext(br#"{"type":"mysteryRequest"}"#.to_vec());
        api.queue_ping();

        let poller = Poller::new(
            Arc::clone(&api) as Arc<dyn CoordinatorApi>,
            "tenant-1",
            "runner-1",
            test_options(),
        );

        // The worker keeps polling past the unknown message and answers
        // the ping that follows it; the unknown one gets no reply.
        wait_until(Duration::from_secs(5), || api.response_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.response_count(), 1);

        poller.shutdown_timeout(Duration::from_secs(5)).await.unwrap();
    }
}
