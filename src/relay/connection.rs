//! Connection handles and the deadline-bounded remote call.
//!
//! The relay never talks to a socket directly. Each online client is reached
//! through a [`ConnectionHandle`]; the embedding transport decides how a
//! command travels. [`ChannelConnection`] is the bridge most transports use:
//! the relay pushes an [`OutboundCommand`] carrying a oneshot reply sender,
//! and the transport completes it when the client answers.
//!
//! Every per-target call goes through [`invoke_with_deadline`], which pairs
//! the reply future with a deadline timer so timeout handling is the same at
//! every call site.

use async_trait::async_trait;
use log::{debug, warn};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::codes::ResultCode;
use super::protocol::{ActionResult, Command, Method};
use crate::logutil::redact_code;

/// Faults raised while delivering a command to a client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The client's connection went away before it replied.
    #[error("connection closed")]
    Closed,

    /// The client reported a fault while handling the command.
    #[error("remote fault: {0}")]
    Remote(String),

    /// The client replied with something the relay cannot use.
    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

/// Route to one connected client.
#[async_trait]
pub trait ConnectionHandle: Send + Sync + fmt::Debug {
    /// Identifier of the underlying connection, for logs.
    fn connection_id(&self) -> &str;

    /// Deliver a command and wait for the client's reply.
    async fn invoke(&self, method: Method, command: Command) -> Result<ActionResult, TransportError>;
}

/// A command waiting to be written to a client, with the slot its reply goes into.
#[derive(Debug)]
pub struct OutboundCommand {
    pub method: Method,
    pub command: Command,
    pub reply: oneshot::Sender<Result<ActionResult, TransportError>>,
}

/// [`ConnectionHandle`] backed by an mpsc queue drained by a transport task.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    id: String,
    tx: mpsc::UnboundedSender<OutboundCommand>,
}

impl ChannelConnection {
    /// Create a handle and the receiver the transport task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundCommand>) {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl ConnectionHandle for ChannelConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, method: Method, command: Command) -> Result<ActionResult, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(OutboundCommand {
                method,
                command,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::Closed)?;
        match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::Closed),
        }
    }
}

/// Deliver `command` and wait at most `deadline` for the reply.
///
/// Never fails: a missed deadline becomes [`ResultCode::Timeout`] and any
/// transport or remote fault becomes [`ResultCode::Unknown`].
pub async fn invoke_with_deadline(
    connection: &dyn ConnectionHandle,
    target: &str,
    method: Method,
    command: Command,
    deadline: Duration,
) -> ActionResult {
    match tokio::time::timeout(deadline, connection.invoke(method, command)).await {
        Ok(Ok(reply)) => {
            debug!(
                "{} -> {} replied {}",
                method,
                redact_code(target),
                reply.result
            );
            reply
        }
        Ok(Err(e)) => {
            warn!(
                "{} -> {} failed on connection {}: {}",
                method,
                redact_code(target),
                connection.connection_id(),
                e
            );
            ActionResult::with_code(ResultCode::Unknown)
        }
        Err(_) => {
            warn!(
                "{} -> {} timed out after {}ms",
                method,
                redact_code(target),
                deadline.as_millis()
            );
            ActionResult::with_code(ResultCode::Timeout)
        }
    }
}
