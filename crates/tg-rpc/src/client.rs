//! Worker-side RPC client: one persistent connection, strict
//! request/response exchanges.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use tg_types::{ProtocolError, TgError, TgResult, TrialId, WorkerId};

use crate::messages::{Envelope, FinishedTrial, Request, Response, TrialAssignment, Verdict};
use crate::wire;

/// Ceiling for the `NotReady` retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

struct Framed {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Per-worker client for the coordination protocol.
///
/// The single connection is shared between the heartbeat task and the
/// executor loop; the internal mutex keeps each exchange an uninterleaved
/// request/response pair.
pub struct WorkerConnection {
    framed: Mutex<Framed>,
    secret: String,
    worker_id: WorkerId,
    local_addr: SocketAddr,
}

impl WorkerConnection {
    pub async fn connect(
        addr: SocketAddr,
        secret: String,
        worker_id: WorkerId,
    ) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            framed: Mutex::new(Framed {
                reader: BufReader::new(read_half),
                writer,
            }),
            secret,
            worker_id,
            local_addr,
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Local endpoint of the connection, reported at registration.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn exchange(&self, request: Request) -> Result<Response, ProtocolError> {
        let mut framed = self.framed.lock().await;
        let envelope = Envelope {
            secret: self.secret.clone(),
            request,
        };
        wire::send(&mut framed.writer, &envelope).await?;
        wire::recv(&mut framed.reader).await
    }

    /// One-time registration with the coordination server.
    pub async fn register(&self, address: String) -> TgResult<()> {
        let response = self
            .exchange(Request::Register {
                worker_id: self.worker_id.clone(),
                address,
            })
            .await
            .map_err(TgError::Protocol)?;

        match response {
            Response::Registered => Ok(()),
            Response::Rejected { .. } => Err(TgError::Protocol(ProtocolError::AuthFailed {
                worker_id: self.worker_id.to_string(),
            })),
            other => Err(unexpected(&other)),
        }
    }

    /// Send the latest buffered progress and receive the verdict.
    pub async fn heartbeat(
        &self,
        trial_id: Option<TrialId>,
        metric: Option<f64>,
        logs: Vec<String>,
    ) -> TgResult<Verdict> {
        let response = self
            .exchange(Request::Heartbeat {
                worker_id: self.worker_id.clone(),
                trial_id,
                metric,
                logs,
            })
            .await
            .map_err(TgError::Protocol)?;

        match response {
            Response::Verdict { verdict } => Ok(verdict),
            Response::Rejected { reason } => {
                Err(TgError::Protocol(ProtocolError::Rejected { reason }))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Report the previous trial's outcome (if any) and pull the next
    /// assignment. Retries `NotReady` responses with bounded backoff;
    /// returns `None` once the generator is exhausted for this worker.
    pub async fn get_next(
        &self,
        finished: Option<FinishedTrial>,
    ) -> TgResult<Option<TrialAssignment>> {
        let mut backoff: Option<Duration> = None;
        loop {
            let response = self
                .exchange(Request::GetNext {
                    worker_id: self.worker_id.clone(),
                    finished: finished.clone(),
                })
                .await
                .map_err(TgError::Protocol)?;

            match response {
                Response::Assignment { trial } => return Ok(Some(trial)),
                Response::Done => return Ok(None),
                Response::NotReady { retry_after_ms } => {
                    let wait = backoff
                        .map(|b| (b * 2).min(MAX_BACKOFF))
                        .unwrap_or_else(|| Duration::from_millis(retry_after_ms.max(1)));
                    debug!(worker = %self.worker_id, ?wait, "no trial ready, backing off");
                    backoff = Some(wait);
                    tokio::time::sleep(wait).await;
                }
                Response::Rejected { reason } => {
                    return Err(TgError::Protocol(ProtocolError::Rejected { reason }))
                }
                other => return Err(unexpected(&other)),
            }
        }
    }
}

fn unexpected(response: &Response) -> TgError {
    TgError::Protocol(ProtocolError::Malformed {
        message: format!("unexpected response: {response:?}"),
    })
}
