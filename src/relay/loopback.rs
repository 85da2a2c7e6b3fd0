//! In-process client for tests and the binary's smoke test.
//!
//! A [`LoopbackClient`] owns the receiving end of a [`ChannelConnection`] and
//! answers commands the way a real client would: it acknowledges actions,
//! answers body-data queries with its current identity and adopts the
//! identity a body swap assigns to it. Individual methods can be scripted to
//! reply with a specific code, fail, or never answer.

use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::codes::ResultCode;
use super::connection::{ChannelConnection, ConnectionHandle, OutboundCommand, TransportError};
use super::presence::Presence;
use super::protocol::{ActionPayload, ActionResult, CharacterIdentity, Command, Method};
use crate::config::RateLimitConfig;

/// Scripted behaviour for one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackScript {
    /// Reply with this code and no payload.
    Reply(ResultCode),
    /// Report a remote fault.
    Fail(String),
    /// Never reply; the relay's deadline decides.
    Stall,
}

#[derive(Debug, Default)]
struct LoopbackState {
    identity: CharacterIdentity,
    received: Vec<(Method, Command)>,
    scripts: HashMap<Method, LoopbackScript>,
    stalled: Vec<OutboundCommand>,
}

#[derive(Debug)]
pub struct LoopbackClient {
    friend_code: String,
    connection: ChannelConnection,
    state: Arc<Mutex<LoopbackState>>,
    task: JoinHandle<()>,
}

impl LoopbackClient {
    /// Start a client task. Must be called inside a tokio runtime.
    pub fn spawn(friend_code: &str, character_name: &str, character_world: &str) -> Self {
        let (connection, rx) = ChannelConnection::with_id(format!(
            "loopback-{}-{}",
            friend_code,
            uuid::Uuid::new_v4().simple()
        ));
        let state = Arc::new(Mutex::new(LoopbackState {
            identity: CharacterIdentity {
                character_name: character_name.to_string(),
                character_world: character_world.to_string(),
                appearance: format!("appearance:{friend_code}"),
            },
            ..LoopbackState::default()
        }));
        let task = tokio::spawn(run(rx, Arc::clone(&state)));
        Self {
            friend_code: friend_code.to_string(),
            connection,
            state,
            task,
        }
    }

    pub fn friend_code(&self) -> &str {
        &self.friend_code
    }

    pub fn connection(&self) -> ChannelConnection {
        self.connection.clone()
    }

    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    /// A presence routed to this client.
    pub fn presence(&self, limits: &RateLimitConfig) -> Presence {
        let identity = self.identity();
        Presence::new(
            self.friend_code.as_str(),
            Arc::new(self.connection.clone()),
            identity.character_name,
            identity.character_world,
            limits,
        )
    }

    /// The identity this client currently renders.
    pub fn identity(&self) -> CharacterIdentity {
        self.state.lock().identity.clone()
    }

    pub fn script(&self, method: Method, script: LoopbackScript) {
        self.state.lock().scripts.insert(method, script);
    }

    pub fn clear_script(&self, method: Method) {
        self.state.lock().scripts.remove(&method);
    }

    /// Every command received so far, in arrival order.
    pub fn received(&self) -> Vec<(Method, Command)> {
        self.state.lock().received.clone()
    }

    pub fn received_count(&self, method: Method) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(m, _)| *m == method)
            .count()
    }
}

impl Drop for LoopbackClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<OutboundCommand>, state: Arc<Mutex<LoopbackState>>) {
    while let Some(out) = rx.recv().await {
        trace!("loopback received {}", out.method);
        let mut st = state.lock();
        st.received.push((out.method, out.command.clone()));

        let reply = match st.scripts.get(&out.method).cloned() {
            Some(LoopbackScript::Reply(code)) => Ok(ActionResult::with_code(code)),
            Some(LoopbackScript::Fail(msg)) => Err(TransportError::Remote(msg)),
            Some(LoopbackScript::Stall) => {
                st.stalled.push(out);
                continue;
            }
            None => match &out.command.payload {
                ActionPayload::BodySwapQuery => Ok(ActionResult::identity(st.identity.clone())),
                ActionPayload::BodySwapAssignment(assignment) => {
                    st.identity = assignment.identity.clone();
                    Ok(ActionResult::success())
                }
                _ => Ok(ActionResult::success()),
            },
        };
        drop(st);
        let _ = out.reply.send(reply);
    }
}
