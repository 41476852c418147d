use std::fmt;

use crate::mail::Destination;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Reject,
    Defer,
    Quarantine,
    Drop,
}

impl OutcomeKind {
    pub fn default_code(self) -> u16 {
        match self {
            OutcomeKind::Reject => 550,
            OutcomeKind::Defer => 450,
            OutcomeKind::Quarantine => 250,
            OutcomeKind::Drop => 550,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            OutcomeKind::Reject => "Not ok",
            OutcomeKind::Defer => "Server Configuration Problem",
            OutcomeKind::Quarantine => "Ok",
            OutcomeKind::Drop => "Not ok",
        }
    }

    fn accepts(self, code: u16) -> bool {
        match self {
            OutcomeKind::Reject => code >= 500,
            OutcomeKind::Defer => (400..500).contains(&code),
            OutcomeKind::Quarantine => (200..300).contains(&code),
            OutcomeKind::Drop => true,
        }
    }

    pub fn destination(self) -> Destination {
        match self {
            OutcomeKind::Reject => Destination::Reject,
            OutcomeKind::Defer => Destination::Defer,
            OutcomeKind::Quarantine => Destination::Quarantine,
            OutcomeKind::Drop => Destination::Drop,
        }
    }
}

/// A terminal pipeline decision carrying the SMTP reply for the command
/// that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    kind: OutcomeKind,
    code: u16,
    message: String,
}

impl Outcome {
    /// Builds an outcome, replacing a code outside the kind's range with
    /// its default.
    pub fn new(kind: OutcomeKind, code: u16, message: impl Into<String>) -> Self {
        let code = if kind.accepts(code) {
            code
        } else {
            kind.default_code()
        };
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn default_for(kind: OutcomeKind) -> Self {
        Self::new(kind, kind.default_code(), kind.default_message())
    }

    pub fn reject(code: u16, message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Reject, code, message)
    }

    pub fn defer(code: u16, message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Defer, code, message)
    }

    pub fn quarantine(code: u16, message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Quarantine, code, message)
    }

    pub fn drop(code: u16, message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Drop, code, message)
    }

    pub fn kind(&self) -> OutcomeKind {
        self.kind
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// A drop with a permanent code closes the connection and discards the
    /// message.
    pub fn closes_connection(&self) -> bool {
        self.kind == OutcomeKind::Drop && self.code >= 500
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Why a filter stopped the pipeline.
#[derive(Debug)]
pub enum Halt {
    Outcome(Outcome),
    Failed(anyhow::Error),
}

impl From<Outcome> for Halt {
    fn from(outcome: Outcome) -> Self {
        Halt::Outcome(outcome)
    }
}

impl From<anyhow::Error> for Halt {
    fn from(error: anyhow::Error) -> Self {
        Halt::Failed(error)
    }
}

impl From<std::io::Error> for Halt {
    fn from(error: std::io::Error) -> Self {
        Halt::Failed(error.into())
    }
}
