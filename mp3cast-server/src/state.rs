//! Processor lifecycle state machine

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Lifecycle state of the streaming processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    Idle,
    Listening,
    Streaming,
    Draining,
    Stopped,
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorState::Idle => write!(f, "idle"),
            ProcessorState::Listening => write!(f, "listening"),
            ProcessorState::Streaming => write!(f, "streaming"),
            ProcessorState::Draining => write!(f, "draining"),
            ProcessorState::Stopped => write!(f, "stopped"),
        }
    }
}

impl ProcessorState {
    /// Listener is open
    pub fn is_listening(&self) -> bool {
        matches!(self, ProcessorState::Listening | ProcessorState::Streaming)
    }
}

/// Tracks the processor state plus the pause flag.
///
/// Every method returns the transition it performed so the scheduler can
/// report it; rejected commands leave the state untouched.
#[derive(Debug)]
pub struct StateMachine {
    state: ProcessorState,
    paused: bool,
}

/// A state change that happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ProcessorState,
    pub to: ProcessorState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ProcessorState::Idle,
            paused: false,
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Buffers may be pulled from the inbox and fanned out
    pub fn is_admitting(&self) -> bool {
        self.state.is_listening() && !self.paused
    }

    fn set(&mut self, to: ProcessorState) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to }
    }

    fn reject(&self, command: &'static str) -> ServerError {
        ServerError::InvalidTransition {
            command,
            state: self.state,
        }
    }

    /// Idle/Stopped → Listening
    pub fn start(&mut self) -> Result<Transition> {
        match self.state {
            ProcessorState::Idle | ProcessorState::Stopped => {
                self.paused = false;
                Ok(self.set(ProcessorState::Listening))
            }
            _ => Err(self.reject("start")),
        }
    }

    /// Listening/Streaming → Draining
    pub fn stop(&mut self) -> Result<Transition> {
        match self.state {
            ProcessorState::Listening | ProcessorState::Streaming => {
                Ok(self.set(ProcessorState::Draining))
            }
            _ => Err(self.reject("stop")),
        }
    }

    pub fn pause(&mut self) -> Result<()> {
        if !self.state.is_listening() {
            return Err(self.reject("pause"));
        }
        self.paused = true;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.state.is_listening() {
            return Err(self.reject("resume"));
        }
        self.paused = false;
        Ok(())
    }

    /// Follow the number of Streaming clients: Listening ↔ Streaming
    pub fn observe_streaming_clients(&mut self, streaming: usize) -> Option<Transition> {
        match (self.state, streaming) {
            (ProcessorState::Listening, n) if n > 0 => Some(self.set(ProcessorState::Streaming)),
            (ProcessorState::Streaming, 0) => Some(self.set(ProcessorState::Listening)),
            _ => None,
        }
    }

    /// Draining → Stopped once the registry is empty
    pub fn observe_registry_empty(&mut self) -> Option<Transition> {
        if self.state == ProcessorState::Draining {
            self.paused = false;
            Some(self.set(ProcessorState::Stopped))
        } else {
            None
        }
    }

    /// Listener setup failed; fall back to where `start` came from
    pub fn abort_start(&mut self, back_to: ProcessorState) -> Transition {
        self.set(back_to)
    }

    /// Teardown: straight to Stopped from wherever we are
    pub fn terminate(&mut self) -> Option<Transition> {
        self.paused = false;
        match self.state {
            ProcessorState::Stopped => None,
            _ => Some(self.set(ProcessorState::Stopped)),
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
