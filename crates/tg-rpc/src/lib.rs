//! # tg-rpc
//!
//! The purpose-built coordination protocol between the experiment driver and
//! its workers: registration, heartbeats, and work assignment over a
//! persistent newline-delimited JSON connection per worker.
//!
//! Not a generic RPC framework; the message set is exactly the handshake
//! this system needs.

mod client;
mod messages;
mod server;
mod wire;

pub use client::WorkerConnection;
pub use messages::{
    Envelope, FinishedTrial, NextTrial, Request, Response, TrialAssignment, TrialOutcome, Verdict,
};
pub use server::{CoordinationHandler, CoordinationServer, ServerConfig};
pub use wire::MAX_FRAME_BYTES;
