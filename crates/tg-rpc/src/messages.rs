//! Wire message types. Each worker exchange is one request/response pair.

use serde::{Deserialize, Serialize};

use tg_types::{TrialId, TrialParams, WorkerId};

/// Outer frame for every worker → server message. The shared secret rides on
/// each request so the server can authenticate before dispatching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub secret: String,
    #[serde(flatten)]
    pub request: Request,
}

/// Worker → server requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// One-time registration after connecting.
    Register { worker_id: WorkerId, address: String },
    /// Periodic progress report for the current trial.
    Heartbeat {
        worker_id: WorkerId,
        trial_id: Option<TrialId>,
        metric: Option<f64>,
        logs: Vec<String>,
    },
    /// Report the previous trial's outcome (if any) and ask for more work.
    GetNext {
        worker_id: WorkerId,
        finished: Option<FinishedTrial>,
    },
}

/// The outcome a worker reports for a completed trial: either a final metric
/// or an error marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialOutcome {
    Metric { value: f64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedTrial {
    pub trial_id: TrialId,
    pub outcome: TrialOutcome,
}

/// Serialized trial handed to a worker: id plus the immutable parameter
/// assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialAssignment {
    pub trial_id: TrialId,
    pub parameters: TrialParams,
}

/// Heartbeat verdict: keep training, or stop at the next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    Stop,
}

/// Server → worker responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Registered,
    Rejected { reason: String },
    Verdict { verdict: Verdict },
    Assignment { trial: TrialAssignment },
    /// No trial can be served yet; retry with bounded backoff.
    NotReady { retry_after_ms: u64 },
    /// The generator is exhausted for this worker; stop the loop.
    Done,
}

/// What the driver answers to a `GetNext`, before wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum NextTrial {
    Assignment(TrialAssignment),
    NotReady,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(request: Request) -> Envelope {
        Envelope {
            secret: "hunter2".to_string(),
            request,
        }
    }

    #[test]
    fn register_round_trip() {
        let msg = envelope(Request::Register {
            worker_id: WorkerId::new(0, 0),
            address: "10.0.0.5:41201".to_string(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn heartbeat_round_trip() {
        let msg = envelope(Request::Heartbeat {
            worker_id: WorkerId::new(1, 2),
            trial_id: Some("t_0003".into()),
            metric: Some(0.87),
            logs: vec!["epoch 3 done".to_string()],
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn get_next_with_failed_outcome() {
        let msg = envelope(Request::GetNext {
            worker_id: WorkerId::new(0, 0),
            finished: Some(FinishedTrial {
                trial_id: "t_0000".into(),
                outcome: TrialOutcome::Failed {
                    reason: "oom".to_string(),
                },
            }),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"failed\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn responses_round_trip() {
        let responses = vec![
            Response::Registered,
            Response::Rejected {
                reason: "invalid secret".to_string(),
            },
            Response::Verdict {
                verdict: Verdict::Stop,
            },
            Response::Assignment {
                trial: TrialAssignment {
                    trial_id: "t_0001".into(),
                    parameters: TrialParams::new().with("lr", 0.01),
                },
            },
            Response::NotReady { retry_after_ms: 250 },
            Response::Done,
        ];
        for response in responses {
            let json = serde_json::to_string(&response).unwrap();
            let back: Response = serde_json::from_str(&json).unwrap();
            assert_eq!(response, back);
        }
    }
}
