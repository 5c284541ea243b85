//! The coordination server: the network-facing half of the experiment
//! driver.
//!
//! Accepts worker connections, authenticates every request against the
//! run's shared secret, and forwards registration, heartbeat, and next-work
//! requests to a [`CoordinationHandler`] (implemented by the driver). Also
//! runs the stale-worker sweeper that fails workers which stop
//! heartbeating.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tg_types::{ProtocolError, RunError, TgError, TgResult, TrialId, WorkerId};

use crate::messages::{Envelope, NextTrial, Request, Response, Verdict};
use crate::wire;

/// Internal (non-network) contract the driver exposes to the server. All
/// methods execute under the driver's coordination lock and must stay cheap.
pub trait CoordinationHandler: Send + Sync + 'static {
    /// Record a worker registration. An error becomes a `Rejected` response
    /// and the connection is closed.
    fn register_worker(&self, worker_id: WorkerId, address: String) -> TgResult<()>;

    /// Process a heartbeat and decide whether the trial continues.
    fn on_heartbeat(
        &self,
        worker_id: &WorkerId,
        trial_id: Option<&TrialId>,
        metric: Option<f64>,
        logs: Vec<String>,
    ) -> TgResult<Verdict>;

    /// Finalize the previous trial (if any) and pull the next one.
    fn next_trial(
        &self,
        worker_id: &WorkerId,
        finished: Option<crate::messages::FinishedTrial>,
    ) -> TgResult<NextTrial>;

    /// Fail workers whose last heartbeat is older than the configured
    /// threshold. Returns the workers that were expired.
    fn expire_stale_workers(&self) -> Vec<WorkerId>;
}

/// Server configuration, derived from the run configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address; port 0 picks a free port.
    pub bind_addr: String,
    pub secret: String,
    /// Drives the stale-worker sweep cadence.
    pub heartbeat_interval: Duration,
    /// Suggested client backoff for `NotReady` responses.
    pub retry_after: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            secret: String::new(),
            heartbeat_interval: Duration::from_secs(1),
            retry_after: Duration::from_millis(250),
        }
    }
}

/// Long-lived network endpoint hosted by the driver.
pub struct CoordinationServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl CoordinationServer {
    /// Bind and start serving. Fails with `RunError::ServerBind` if the
    /// address is unavailable.
    pub async fn start(
        config: ServerConfig,
        handler: Arc<dyn CoordinationHandler>,
    ) -> TgResult<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            TgError::Run(RunError::ServerBind {
                addr: config.bind_addr.clone(),
                source: e,
            })
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TgError::Protocol(ProtocolError::Io(e)))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(addr = %local_addr, "coordination server listening");

        tokio::spawn(accept_loop(
            listener,
            config.clone(),
            handler.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(sweep_loop(
            config.heartbeat_interval,
            handler,
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            shutdown_tx,
        })
    }

    /// Address workers should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down open connections. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for CoordinationServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<dyn CoordinationHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "worker connected");
                        tokio::spawn(serve_connection(
                            stream,
                            config.clone(),
                            handler.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("coordination server shutting down");
                    return;
                }
            }
        }
    }
}

/// Periodically asks the driver to expire workers that stopped
/// heartbeating. Runs on the server's clock so even an idle run detects
/// dead workers.
async fn sweep_loop(
    interval: Duration,
    handler: Arc<dyn CoordinationHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for worker in handler.expire_stale_workers() {
                    warn!(worker = %worker, "worker expired after missed heartbeats");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: ServerConfig,
    handler: Arc<dyn CoordinationHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let envelope: Envelope = tokio::select! {
            received = wire::recv(&mut reader) => match received {
                Ok(env) => env,
                Err(ProtocolError::ConnectionClosed) => {
                    debug!("worker connection closed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "closing connection on protocol error");
                    return;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        if envelope.secret != config.secret {
            // Registration gets an explicit rejection; everything else just
            // loses the connection.
            if let Request::Register { worker_id, .. } = &envelope.request {
                warn!(worker = %worker_id, "rejecting registration: invalid secret");
                let _ = wire::send(
                    &mut write_half,
                    &Response::Rejected {
                        reason: "invalid secret".to_string(),
                    },
                )
                .await;
            }
            return;
        }

        let response = dispatch(&config, handler.as_ref(), envelope.request);
        let closing = matches!(response, Response::Rejected { .. });
        if let Err(e) = wire::send(&mut write_half, &response).await {
            warn!(error = %e, "failed to send response");
            return;
        }
        if closing {
            return;
        }
    }
}

fn dispatch(config: &ServerConfig, handler: &dyn CoordinationHandler, request: Request) -> Response {
    match request {
        Request::Register { worker_id, address } => {
            match handler.register_worker(worker_id.clone(), address) {
                Ok(()) => {
                    info!(worker = %worker_id, "worker registered");
                    Response::Registered
                }
                Err(e) => Response::Rejected {
                    reason: e.to_string(),
                },
            }
        }
        Request::Heartbeat {
            worker_id,
            trial_id,
            metric,
            logs,
        } => match handler.on_heartbeat(&worker_id, trial_id.as_ref(), metric, logs) {
            Ok(verdict) => Response::Verdict { verdict },
            Err(e) => Response::Rejected {
                reason: e.to_string(),
            },
        },
        Request::GetNext {
            worker_id,
            finished,
        } => match handler.next_trial(&worker_id, finished) {
            Ok(NextTrial::Assignment(trial)) => Response::Assignment { trial },
            Ok(NextTrial::NotReady) => Response::NotReady {
                retry_after_ms: config.retry_after.as_millis() as u64,
            },
            Ok(NextTrial::Done) => Response::Done,
            Err(e) => Response::Rejected {
                reason: e.to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WorkerConnection;
    use crate::messages::{FinishedTrial, TrialAssignment, TrialOutcome};
    use parking_lot::Mutex;
    use tg_types::TrialParams;

    /// Records calls and serves a single canned trial.
    struct StubHandler {
        registered: Mutex<Vec<WorkerId>>,
        heartbeats: Mutex<Vec<Option<f64>>>,
        finished: Mutex<Vec<FinishedTrial>>,
        served: Mutex<bool>,
        not_ready_once: Mutex<bool>,
    }

    impl StubHandler {
        fn new(not_ready_once: bool) -> Self {
            Self {
                registered: Mutex::new(Vec::new()),
                heartbeats: Mutex::new(Vec::new()),
                finished: Mutex::new(Vec::new()),
                served: Mutex::new(false),
                not_ready_once: Mutex::new(not_ready_once),
            }
        }
    }

    impl CoordinationHandler for StubHandler {
        fn register_worker(&self, worker_id: WorkerId, _address: String) -> TgResult<()> {
            self.registered.lock().push(worker_id);
            Ok(())
        }

        fn on_heartbeat(
            &self,
            _worker_id: &WorkerId,
            _trial_id: Option<&TrialId>,
            metric: Option<f64>,
            _logs: Vec<String>,
        ) -> TgResult<Verdict> {
            self.heartbeats.lock().push(metric);
            Ok(Verdict::Continue)
        }

        fn next_trial(
            &self,
            _worker_id: &WorkerId,
            finished: Option<FinishedTrial>,
        ) -> TgResult<NextTrial> {
            if let Some(f) = finished {
                self.finished.lock().push(f);
            }
            let mut not_ready = self.not_ready_once.lock();
            if *not_ready {
                *not_ready = false;
                return Ok(NextTrial::NotReady);
            }
            let mut served = self.served.lock();
            if *served {
                return Ok(NextTrial::Done);
            }
            *served = true;
            Ok(NextTrial::Assignment(TrialAssignment {
                trial_id: "t_0000".into(),
                parameters: TrialParams::new().with("lr", 0.05),
            }))
        }

        fn expire_stale_workers(&self) -> Vec<WorkerId> {
            Vec::new()
        }
    }

    async fn start_server(handler: Arc<StubHandler>) -> CoordinationServer {
        let config = ServerConfig {
            secret: "s3cret".to_string(),
            retry_after: Duration::from_millis(5),
            ..Default::default()
        };
        CoordinationServer::start(config, handler).await.unwrap()
    }

    #[tokio::test]
    async fn register_heartbeat_get_next_cycle() {
        let handler = Arc::new(StubHandler::new(false));
        let server = start_server(handler.clone()).await;

        let conn = WorkerConnection::connect(
            server.local_addr(),
            "s3cret".to_string(),
            WorkerId::new(0, 0),
        )
        .await
        .unwrap();

        conn.register("127.0.0.1:1234".to_string()).await.unwrap();
        assert_eq!(handler.registered.lock().len(), 1);

        let verdict = conn
            .heartbeat(Some("t_0000".into()), Some(0.4), vec!["warmup".into()])
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Continue);

        let assignment = conn.get_next(None).await.unwrap();
        assert_eq!(
            assignment.as_ref().map(|a| a.trial_id.clone()),
            Some("t_0000".into())
        );

        // Reporting the outcome exhausts the stub.
        let next = conn
            .get_next(Some(FinishedTrial {
                trial_id: "t_0000".into(),
                outcome: TrialOutcome::Metric { value: 0.9 },
            }))
            .await
            .unwrap();
        assert!(next.is_none());
        assert_eq!(handler.finished.lock().len(), 1);

        server.shutdown();
    }

    #[tokio::test]
    async fn invalid_secret_is_rejected() {
        let handler = Arc::new(StubHandler::new(false));
        let server = start_server(handler.clone()).await;

        let conn = WorkerConnection::connect(
            server.local_addr(),
            "wrong".to_string(),
            WorkerId::new(0, 0),
        )
        .await
        .unwrap();

        let err = conn
            .register("127.0.0.1:1234".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TgError::Protocol(ProtocolError::AuthFailed { .. })
        ));
        assert!(handler.registered.lock().is_empty());

        server.shutdown();
    }

    #[tokio::test]
    async fn not_ready_is_retried_transparently() {
        let handler = Arc::new(StubHandler::new(true));
        let server = start_server(handler.clone()).await;

        let conn = WorkerConnection::connect(
            server.local_addr(),
            "s3cret".to_string(),
            WorkerId::new(1, 0),
        )
        .await
        .unwrap();
        conn.register("127.0.0.1:9".to_string()).await.unwrap();

        // First GetNext answers NotReady; the client backs off and retries
        // until the assignment arrives.
        let assignment = conn.get_next(None).await.unwrap();
        assert!(assignment.is_some());

        server.shutdown();
    }
}
