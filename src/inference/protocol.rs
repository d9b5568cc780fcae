//! Worker protocol
//!
//! Messages exchanged between the controller and the engine worker thread.
//! One enum per direction; both are matched exhaustively at the dispatch
//! boundary.

use serde::{Deserialize, Serialize};

use crate::types::ChatTurn;

/// Identifier of one `generate` call.
///
/// Doubles as the version counter of the stopping token, so an interrupt
/// aimed at an earlier generation is recognisably stale.
pub type GenerationId = u64;

/// Commands sent from the controller to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Command {
    /// Capability probe; answered with `ready` or `error`
    Check,
    /// Acquire tokenizer and model
    Load,
    /// Run one generation over the given turns
    Generate {
        id: GenerationId,
        turns: Vec<ChatTurn>,
    },
    /// Stop the in-flight generation (`None` targets whichever is running)
    Interrupt { id: Option<GenerationId> },
    /// Drop the decode cache
    Reset,
    /// Terminate the worker thread
    Shutdown,
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model produced an end-of-generation token
    Stop,
    /// The token budget was exhausted
    Length,
    /// The stopping token was set
    Interrupted,
}

/// Events sent from the engine back to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Event {
    /// Capability probe succeeded, or the model finished loading
    Ready,
    /// Coarse narration of the load phase
    Loading { message: String },
    /// An artifact download/read is starting
    Initiate { file: String },
    /// Bytes acquired so far for one artifact
    Progress { file: String, loaded: u64, total: u64 },
    /// An artifact is fully acquired
    Done { file: String },
    /// A generation began
    Start { id: GenerationId },
    /// One streamed output increment
    Update {
        id: GenerationId,
        output: String,
        tps: Option<f64>,
        num_tokens: usize,
    },
    /// The generation finished (normally, by budget, or by interrupt)
    Complete { id: GenerationId, reason: FinishReason },
    /// Load or generation failure; terminal for whatever was in progress
    Error {
        id: Option<GenerationId>,
        message: String,
        /// Text produced before a generation failed
        partial: Option<String>,
    },
    /// A command was refused without affecting the in-flight work
    Rejected {
        id: Option<GenerationId>,
        message: String,
    },
}

impl Event {
    /// Returns true if this event ends a generation or a load
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Ready | Event::Complete { .. } | Event::Error { .. }
        )
    }

    /// Generation this event belongs to, if any
    pub fn generation(&self) -> Option<GenerationId> {
        match self {
            Event::Start { id } | Event::Update { id, .. } | Event::Complete { id, .. } => {
                Some(*id)
            }
            Event::Error { id, .. } | Event::Rejected { id, .. } => *id,
            _ => None,
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Event::Error {
            id: None,
            message: message.into(),
            partial: None,
        }
    }
}

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    Loading,
    Ready,
    Generating,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(Event::Progress {
            file: "model.gguf".to_string(),
            loaded: 10,
            total: 20,
        })
        .unwrap();
        assert_eq!(json["status"], "progress");
        assert_eq!(json["file"], "model.gguf");
        assert_eq!(json["loaded"], 10);

        let json = serde_json::to_value(Event::Ready).unwrap();
        assert_eq!(json["status"], "ready");
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd: Command = serde_json::from_str(
            r#"{"type":"generate","data":{"id":3,"turns":[{"role":"user","content":"hello"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Generate {
                id: 3,
                turns: vec![ChatTurn::user("hello")],
            }
        );

        let cmd: Command = serde_json::from_str(r#"{"type":"reset"}"#).unwrap();
        assert_eq!(cmd, Command::Reset);
    }

    #[test]
    fn test_terminal_events() {
        assert!(Event::Ready.is_terminal());
        assert!(Event::Complete {
            id: 1,
            reason: FinishReason::Stop
        }
        .is_terminal());
        assert!(Event::error("boom").is_terminal());
        assert!(!Event::Start { id: 1 }.is_terminal());
        assert!(!Event::Rejected {
            id: Some(2),
            message: "busy".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_event_generation() {
        assert_eq!(Event::Start { id: 4 }.generation(), Some(4));
        assert_eq!(Event::Ready.generation(), None);
        assert_eq!(Event::error("x").generation(), None);
    }
}
