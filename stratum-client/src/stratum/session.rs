//! The pool session: handshake, dispatch loop, reconnection and submission.
//!
//! A [`Session`] is a cheap, cloneable handle. All mutable protocol state sits
//! behind one async mutex (the session lock) which serializes message-id
//! allocation, request writes, the authorize/subscribe handshake and the
//! reconnect sequence. Reads happen outside the lock: once the handshake
//! completes, the line reader moves into a spawned dispatch task that owns it
//! until the connection fails.
//!
//! # Lifecycle
//!
//! ```text
//! connect ──> authorize ──> subscribe ──> spawn dispatch loop
//!                 ^                              │
//!                 │                        read failure /
//!                 │                        stale job resent
//!                 │                              v
//!                 └──── dial with backoff <── reconnect
//! ```
//!
//! Reconnection is internal and unbounded. Errors from explicit calls
//! (`connect`, `authorize`, `submit_work`, `call`) go back to their caller
//! and are never retried here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{self, LineReader, LineWriter};
use super::listeners::{ListenerKey, ListenerRegistry, SubmitEvent};
use super::messages::{
    Incoming, Method, Notification, Request, Response, Subscribe, SubmitParams,
};
use super::work::{bin_to_hex, target_for_difficulty, Work};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Wait before the first reconnect attempt of an outage.
pub const DEFAULT_RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Wait before every later attempt of the same outage.
pub const DEFAULT_RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Flat two-tier reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_RECONNECT_INITIAL_DELAY,
            retry_delay: DEFAULT_RECONNECT_RETRY_DELAY,
        }
    }
}

/// Tuning fixed at session construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Send `mining.ping` this often while connected. `None` disables it.
    pub keep_alive: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

/// Share acknowledgment tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    /// Shares the pool accepted
    pub accepted: u64,
    /// Shares the pool answered, accepted or not
    pub submitted: u64,
    /// Shares still awaiting an answer when their connection was replaced
    pub unanswered: u64,
}

impl SubmissionStats {
    pub fn rejected(&self) -> u64 {
        self.submitted - self.accepted
    }
}

/// Delay sequence for one outage.
#[derive(Debug)]
struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = if self.attempts == 0 {
            self.policy.initial_delay
        } else {
            self.policy.retry_delay
        };
        self.attempts = self.attempts.saturating_add(1);
        delay
    }
}

#[derive(Clone)]
struct Credentials {
    username: String,
    password: String,
}

/// Everything guarded by the session lock.
#[derive(Default)]
struct State {
    /// Present between connect and the start of the dispatch loop
    reader: Option<LineReader>,
    writer: Option<LineWriter>,

    /// Bumped on every connect, so a dispatch loop can tell it was superseded
    generation: u64,

    address: Option<String>,
    credentials: Option<Credentials>,

    /// Last message ID handed out
    last_id: u64,

    subscribe: Option<Subscribe>,
    authenticated: bool,

    current_work: Option<Arc<Work>>,
    last_submitted: Option<Arc<Work>>,

    /// Target from the most recent mining.set_difficulty
    pool_target: Option<u64>,

    /// Submit request ID -> job ID, until the pool answers
    outstanding: HashMap<u64, String>,
    stats: SubmissionStats,

    keep_alive: Option<CancellationToken>,
}

struct Inner {
    config: SessionConfig,
    state: Mutex<State>,
    listeners: ListenerRegistry,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// What the dispatch loop does after handling a message.
enum Flow {
    Continue,
    Reconnect,
}

/// Handle to one pool session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                listeners: ListenerRegistry::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Open a TCP connection to `address` (`host:port`, optionally with a
    /// `stratum+tcp://` scheme), replacing any current transport.
    ///
    /// The address is remembered for reconnects. No retry on failure.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        Self::connect_locked(&mut state, address).await
    }

    /// Authenticate, subscribe, and start the dispatch loop.
    ///
    /// Holds the session lock for the whole handshake, so no other request
    /// can interleave with it. On any failure the session is left
    /// unauthenticated.
    pub async fn authorize(&self, username: &str, password: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.authorize_locked(&mut state, username, password).await
    }

    /// Issue a request and return its message ID.
    ///
    /// Responses arrive through the dispatch loop and are published to the
    /// response listeners.
    pub async fn call(&self, method: &str, params: Value) -> Result<u64> {
        let mut state = self.inner.state.lock().await;
        Self::call_locked(&mut state, method, params).await
    }

    /// Submit a solved job.
    ///
    /// Submitting the very same `Arc<Work>` twice in a row is a no-op; an
    /// independently decoded job with identical content is a different job.
    pub async fn submit_work(&self, work: &Arc<Work>, result: &str) -> Result<()> {
        let event = {
            let mut state = self.inner.state.lock().await;

            if state
                .last_submitted
                .as_ref()
                .is_some_and(|last| Arc::ptr_eq(last, work))
            {
                debug!(job_id = work.job_id(), "Prevented duplicate submission");
                return Ok(());
            }

            let params = SubmitParams {
                id: state
                    .subscribe
                    .as_ref()
                    .map(|sub| sub.notify_id.clone())
                    .unwrap_or_default(),
                job_id: work.job_id().to_string(),
                nonce: bin_to_hex(work.nonce_bytes()),
                result: result.to_string(),
            };

            let request_id = Self::call_locked(
                &mut state,
                Method::Submit.as_ref(),
                serde_json::to_value(&params)?,
            )
            .await?;

            state.outstanding.insert(request_id, params.job_id.clone());
            state.last_submitted = Some(work.clone());
            debug!(
                request_id,
                job_id = %params.job_id,
                result,
                "Submitted work result"
            );

            SubmitEvent {
                request_id,
                params,
                work: work.clone(),
            }
        };

        self.inner.listeners.submit.publish(event).await;
        Ok(())
    }

    /// Receive every accepted job.
    pub fn register_work_listener(&self, tx: mpsc::Sender<Arc<Work>>) -> ListenerKey {
        self.inner.listeners.work.register(tx)
    }

    /// Receive every share handed to the pool.
    pub fn register_submit_listener(&self, tx: mpsc::Sender<SubmitEvent>) -> ListenerKey {
        self.inner.listeners.submit.register(tx)
    }

    /// Receive every response read by the dispatch loop.
    pub fn register_response_listener(&self, tx: mpsc::Sender<Response>) -> ListenerKey {
        self.inner.listeners.response.register(tx)
    }

    pub async fn current_work(&self) -> Option<Arc<Work>> {
        self.inner.state.lock().await.current_work.clone()
    }

    pub async fn subscription(&self) -> Option<Subscribe> {
        self.inner.state.lock().await.subscribe.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.state.lock().await.authenticated
    }

    pub async fn stats(&self) -> SubmissionStats {
        self.inner.state.lock().await.stats
    }

    /// Submissions the pool has not answered yet.
    pub async fn outstanding_submissions(&self) -> usize {
        self.inner.state.lock().await.outstanding.len()
    }

    /// Stop the dispatch loop, keep-alive and any reconnect in progress, then
    /// close the transport. The session cannot be restarted.
    pub async fn shutdown(&self) {
        debug!("Shutting down session");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let mut state = self.inner.state.lock().await;
        state.reader = None;
        state.writer = None;
        state.authenticated = false;
    }

    async fn connect_locked(state: &mut State, address: &str) -> Result<()> {
        let (reader, writer) = connection::connect(address).await?;
        state.reader = Some(reader);
        state.writer = Some(writer);
        state.generation += 1;
        state.authenticated = false;
        state.address = Some(address.to_string());
        Self::forget_transport_jobs_locked(state);
        Ok(())
    }

    /// Drop what only meant something to the previous connection: its job
    /// and the submissions it will never answer.
    fn forget_transport_jobs_locked(state: &mut State) {
        if !state.outstanding.is_empty() {
            let lost = state.outstanding.len() as u64;
            state.stats.unanswered += lost;
            warn!(
                lost,
                unanswered = state.stats.unanswered,
                "Submissions never answered by previous connection"
            );
            state.outstanding.clear();
        }
        state.current_work = None;
    }

    async fn call_locked(state: &mut State, method: &str, params: Value) -> Result<u64> {
        state.last_id += 1;
        let id = state.last_id;

        let line = Request::new(id, method, params).encode()?;
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;
        writer.write_line(&line).await?;

        debug!(id, method, "Sent request");
        Ok(id)
    }

    /// Read lines until one is a response.
    ///
    /// Only used during the handshake, before the dispatch loop owns the
    /// reader.
    async fn read_response_locked(state: &mut State) -> Result<Response> {
        let reader = state
            .reader
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;

        loop {
            let line = reader.read_line().await?;
            match Incoming::parse(&line)? {
                Incoming::Response(response) => {
                    debug!(response = %response, "Server sent back");
                    return Ok(response);
                }
                Incoming::Notification(notification) => {
                    warn!(
                        method = %notification.method,
                        "Skipping notification received during handshake"
                    );
                }
            }
        }
    }

    async fn authorize_locked(
        &self,
        state: &mut State,
        username: &str,
        password: &str,
    ) -> Result<()> {
        // After a successful handshake the dispatch loop owns the reader; a
        // new handshake needs a new connection.
        if state.reader.is_none() {
            return Err(Error::Connection(
                "no unauthorized connection, call connect first".to_string(),
            ));
        }

        let result = self.handshake_locked(state, username, password).await;
        if result.is_err() {
            state.authenticated = false;
        }
        result
    }

    async fn handshake_locked(
        &self,
        state: &mut State,
        username: &str,
        password: &str,
    ) -> Result<()> {
        debug!(username, "Beginning authorize");
        Self::call_locked(state, Method::Authorize.as_ref(), json!([username, password])).await?;

        let response = Self::read_response_locked(state).await?;
        let raw = response.to_string();
        let authorized = response.into_result()?.as_bool().ok_or_else(|| {
            Error::Protocol(format!("authorize result not a boolean: {}", raw))
        })?;
        if !authorized {
            return Err(Error::Authentication(raw));
        }

        state.authenticated = true;
        state.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });

        debug!("Authorized, subscribing");
        Self::call_locked(state, Method::Subscribe.as_ref(), json!([])).await?;

        let response = Self::read_response_locked(state).await?;
        let subscribe = Subscribe::from_result(&response.into_result()?)?;
        debug!(
            notify_id = %subscribe.notify_id,
            extranonce1 = %format_args!("0x{}", subscribe.extranonce1),
            extranonce2_size = %subscribe.extranonce2_size,
            "Subscribed"
        );
        state.subscribe = Some(subscribe);

        let reader = state
            .reader
            .take()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;
        self.spawn_dispatch(reader, state.generation);

        if let Some(token) = state.keep_alive.take() {
            token.cancel();
        }
        if let Some(interval) = self.inner.config.keep_alive {
            state.keep_alive = Some(self.spawn_keep_alive(interval));
        }

        info!(
            address = state.address.as_deref().unwrap_or_default(),
            username, "Session ready"
        );
        Ok(())
    }

    // Plain fn so the dispatch future does not end up inside the handshake
    // future that the reconnect path (itself inside dispatch) awaits.
    fn spawn_dispatch(&self, reader: LineReader, generation: u64) {
        let session = self.clone();
        self.inner
            .tasks
            .spawn(async move { session.dispatch_loop(reader, generation).await });
    }

    fn spawn_keep_alive(&self, interval: Duration) -> CancellationToken {
        let stop = self.inner.shutdown.child_token();
        let session = self.clone();
        let task_stop = stop.clone();

        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                tokio::select! {
                    _ = task_stop.cancelled() => return,
                    result = session.call(Method::Ping.as_ref(), json!([])) => match result {
                        Ok(id) => debug!(id, "Posted keepalive"),
                        Err(e) => error!(error = %e, "Failed keepalive"),
                    },
                }
            }
        });

        stop
    }

    async fn dispatch_loop(self, mut reader: LineReader, generation: u64) {
        debug!(generation, "Dispatch loop started");

        loop {
            let line = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                line = reader.read_line() => line,
            };

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    info!(error = %e, "Failed to read from pool");
                    break;
                }
            };

            let flow = match Incoming::parse(&line) {
                Ok(incoming) => {
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => return,
                        flow = self.handle_incoming(incoming) => flow,
                    }
                }
                Err(Error::Protocol(e)) => {
                    warn!(error = %e, "Ignoring malformed message");
                    Flow::Continue
                }
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to decode line from pool");
                    Flow::Reconnect
                }
            };

            if let Flow::Reconnect = flow {
                break;
            }
        }

        drop(reader);
        self.reconnect(generation).await;
    }

    async fn handle_incoming(&self, incoming: Incoming) -> Flow {
        match incoming {
            Incoming::Response(response) => self.handle_response(response).await,
            Incoming::Notification(notification) => self.handle_notification(notification).await,
        }
    }

    async fn handle_response(&self, response: Response) -> Flow {
        // Some pools push jobs as responses echoing the notify method.
        let flow = if response.method.as_deref() == Some(Method::Notify.as_ref()) {
            self.accept_job(|fallback| Work::from_response(&response, fallback))
                .await
        } else {
            Flow::Continue
        };

        if let Some(id) = response.id {
            let mut state = self.inner.state.lock().await;
            if let Some(job_id) = state.outstanding.remove(&id) {
                state.stats.submitted += 1;
                if response.is_accepted() {
                    state.stats.accepted += 1;
                    info!(
                        job_id = %job_id,
                        "accepted {}/{}", state.stats.accepted, state.stats.submitted
                    );
                } else {
                    let reason = response
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "pool returned false".to_string());
                    warn!(
                        job_id = %job_id,
                        reason = %reason,
                        "rejected {}/{}",
                        state.stats.rejected(),
                        state.stats.submitted
                    );
                }
            } else {
                debug!(id, response = %response, "Received response");
            }
        }

        self.inner.listeners.response.publish(response).await;
        flow
    }

    async fn handle_notification(&self, notification: Notification) -> Flow {
        match notification.method.parse::<Method>() {
            Ok(Method::Notify) => self.handle_notify(&notification.params).await,
            Ok(Method::SetDifficulty) => {
                self.handle_set_difficulty(&notification.params).await;
                Flow::Continue
            }
            _ => {
                warn!(method = %notification.method, "Unknown method");
                Flow::Continue
            }
        }
    }

    async fn handle_notify(&self, params: &Value) -> Flow {
        let Some(params) = params.as_object() else {
            error!(params = %params, "mining.notify params not an object");
            return Flow::Continue;
        };

        self.accept_job(|fallback| Work::from_notify(params, fallback))
            .await
    }

    /// Decode a job with the pool target as fallback, apply the staleness
    /// check, then publish it.
    async fn accept_job(&self, decode: impl FnOnce(Option<u64>) -> Result<Work>) -> Flow {
        let work = {
            let mut state = self.inner.state.lock().await;

            let work = match decode(state.pool_target) {
                Ok(work) => Arc::new(work),
                Err(e) => {
                    error!(error = %e, "Failed to parse job");
                    return Flow::Continue;
                }
            };

            let is_current = state
                .current_work
                .as_ref()
                .is_some_and(|current| current.job_id() == work.job_id());
            let is_outstanding = state
                .outstanding
                .values()
                .any(|job_id| job_id == work.job_id());

            if is_current || is_outstanding {
                warn!(
                    job_id = work.job_id(),
                    address = state.address.as_deref().unwrap_or_default(),
                    "Duplicate job, reconnecting"
                );
                state.writer = None;
                state.authenticated = false;
                return Flow::Reconnect;
            }

            info!(
                job_id = work.job_id(),
                difficulty = %format_args!("{:.0}", work.difficulty()),
                "New job"
            );
            state.current_work = Some(work.clone());
            work
        };

        self.inner.listeners.work.publish(work).await;
        Flow::Continue
    }

    async fn handle_set_difficulty(&self, params: &Value) {
        let Some(difficulty) = params.get(0).and_then(Value::as_f64) else {
            error!(params = %params, "mining.set_difficulty params malformed");
            return;
        };
        let target = match target_for_difficulty(difficulty) {
            Ok(target) => target,
            Err(e) => {
                error!(error = %e, "Rejected pool difficulty");
                return;
            }
        };

        let rescaled = {
            let mut state = self.inner.state.lock().await;
            state.pool_target = Some(target);
            info!(difficulty, "Pool set difficulty");

            let current = state
                .current_work
                .as_ref()
                .filter(|work| work.target() != target)
                .map(|work| work.with_target(target));
            match current {
                Some(Ok(work)) => {
                    let work = Arc::new(work);
                    state.current_work = Some(work.clone());
                    Some(work)
                }
                Some(Err(e)) => {
                    error!(error = %e, "Failed to rescale current job");
                    None
                }
                None => None,
            }
        };

        if let Some(work) = rescaled {
            self.inner.listeners.work.publish(work).await;
        }
    }

    async fn reconnect(&self, generation: u64) {
        let mut state = self.inner.state.lock().await;

        if state.generation != generation {
            debug!(generation, "Transport already replaced, not reconnecting");
            return;
        }

        if let Some(token) = state.keep_alive.take() {
            token.cancel();
        }
        state.reader = None;
        state.writer = None;
        state.authenticated = false;

        let (Some(address), Some(credentials)) = (state.address.clone(), state.credentials.clone())
        else {
            error!("Lost connection before a completed handshake, not reconnecting");
            return;
        };

        let mut backoff = Backoff::new(self.inner.config.reconnect);
        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            info!(address = %address, "Reconnecting ...");
            let attempt = async {
                Self::connect_locked(&mut state, &address).await?;
                debug!("Connected. Authorizing ...");
                self.authorize_locked(&mut state, &credentials.username, &credentials.password)
                    .await
            };

            let result = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                result = attempt => result,
            };

            match result {
                Ok(()) => {
                    info!(address = %address, "Reconnected");
                    return;
                }
                Err(e) => {
                    error!(address = %address, error = %e, "Failed to reconnect");
                    state.reader = None;
                    state.writer = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_two_tier() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        for _ in 0..10 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_backoff_custom_policy() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            retry_delay: Duration::from_millis(30),
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(30));
        assert_eq!(backoff.next_delay(), Duration::from_millis(30));
    }

    #[test]
    fn test_stats_rejected() {
        let stats = SubmissionStats {
            accepted: 3,
            submitted: 5,
            ..Default::default()
        };
        assert_eq!(stats.rejected(), 2);
    }

    #[tokio::test]
    async fn test_call_requires_connection() {
        let session = Session::new(SessionConfig::default());
        assert!(matches!(
            session.call("mining.ping", json!([])).await,
            Err(Error::Connection(_))
        ));
        assert!(matches!(
            session.authorize("user", "x").await,
            Err(Error::Connection(_))
        ));
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_message_ids_increase_across_failures() {
        let session = Session::new(SessionConfig::default());
        let _ = session.call("a", json!([])).await;
        let _ = session.call("b", json!([])).await;
        assert_eq!(session.inner.state.lock().await.last_id, 2);
    }

    #[tokio::test]
    async fn test_submit_without_connection_is_an_error() {
        let session = Session::new(SessionConfig::default());
        let work = Arc::new(Work::new("j", &[0u8; 40], u64::MAX).unwrap());
        assert!(session.submit_work(&work, "00").await.is_err());
        assert_eq!(session.outstanding_submissions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_difficulty_without_job_sets_pool_target() {
        let session = Session::new(SessionConfig::default());
        session.handle_set_difficulty(&json!([65536])).await;
        assert_eq!(session.inner.state.lock().await.pool_target, Some(1 << 48));

        // Garbage leaves the previous target alone.
        session.handle_set_difficulty(&json!(["hard"])).await;
        session.handle_set_difficulty(&json!([0])).await;
        assert_eq!(session.inner.state.lock().await.pool_target, Some(1 << 48));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_duplicate_of_outstanding_submission() {
        let session = Session::new(SessionConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        session.register_work_listener(tx);

        let blob = "00".repeat(40);
        let notify = |job_id: &str| json!({"job_id": job_id, "blob": blob, "target": "ffffffff"});

        assert!(matches!(
            session.handle_notify(&notify("a")).await,
            Flow::Continue
        ));
        session
            .inner
            .state
            .lock()
            .await
            .outstanding
            .insert(7, "a".to_string());
        assert!(matches!(
            session.handle_notify(&notify("b")).await,
            Flow::Continue
        ));
        assert!(matches!(
            session.handle_notify(&notify("a")).await,
            Flow::Reconnect
        ));

        assert_eq!(rx.recv().await.unwrap().job_id(), "a");
        assert_eq!(rx.recv().await.unwrap().job_id(), "b");
        assert!(rx.try_recv().is_err());
        assert_eq!(
            session.current_work().await.map(|w| w.job_id().to_string()),
            Some("b".to_string())
        );
    }
}
