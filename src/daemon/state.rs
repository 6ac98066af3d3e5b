use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Daemon lifecycle: `stopped → starting → ready → shutting_down → stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Ready,
    ShuttingDown,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal state transition {from} -> {to}")]
pub struct StateError {
    pub from: ServerState,
    pub to: ServerState,
}

struct Inner {
    state: ServerState,
    /// Set once `ready` is reached; a served handle is never restarted.
    served: bool,
}

pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ServerState::Stopped,
                served: false,
            }),
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> ServerState {
        self.lock().state
    }

    pub fn has_served(&self) -> bool {
        self.lock().served
    }

    pub fn transition(&self, to: ServerState) -> Result<(), StateError> {
        use ServerState::*;

        let mut inner = self.lock();
        let from = inner.state;
        let allowed = match (from, to) {
            (Stopped, Starting) => !inner.served,
            (Starting, Ready) | (Starting, Stopped) => true,
            (Ready, ShuttingDown) | (ShuttingDown, Stopped) => true,
            (Stopped, Stopped) => true,
            _ => false,
        };
        if !allowed {
            return Err(StateError { from, to });
        }
        if to == Ready {
            inner.served = true;
        }
        if from != to {
            tracing::debug!(from = %from, to = %to, "daemon state changed");
        }
        inner.state = to;
        Ok(())
    }
}
