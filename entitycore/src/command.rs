//! Commands, their envelopes and their results.
//!
//! A [`CommandEnvelope`] addresses one entity identity and carries the
//! command payload plus the ids used to stamp the resulting events. Handling
//! produces either a committed batch ([`CommandOutcome`]) or an error; callers
//! that only need a yes/no answer convert that into a [`CommandResult`].

use crate::errors::CommandError;
use crate::event::{CommittedEvent, TypeTag};
use crate::metadata::Metadata;
use crate::types::{CommandId, CorrelationId, Identity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A command addressed to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope<C> {
    /// The entity the command is for
    pub target: Identity,
    /// The command itself
    pub payload: C,
    /// Id of this command, stamped as `source-id` on the events it produces
    pub command_id: CommandId,
    /// Correlation id to propagate; a fresh one is generated when absent
    pub correlation_id: Option<CorrelationId>,
    /// Id of the command or event that caused this command
    pub causation_id: Option<String>,
    /// Extra metadata copied onto every produced event
    #[serde(default)]
    pub metadata: Metadata,
}

impl<C> CommandEnvelope<C> {
    /// Wraps `payload` for `target` with a fresh command id.
    pub fn new(target: Identity, payload: C) -> Self {
        Self {
            target,
            payload,
            command_id: CommandId::new(),
            correlation_id: None,
            causation_id: None,
            metadata: Metadata::new(),
        }
    }

    /// Sets the command id.
    #[must_use]
    pub fn with_command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = command_id;
        self
    }

    /// Sets the correlation id to propagate.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Sets extra metadata for the produced events.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl<C: TypeTag> TypeTag for CommandEnvelope<C> {
    fn type_tag(&self) -> &'static str {
        self.payload.type_tag()
    }
}

/// A business-rule rejection produced by a command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    reasons: Vec<String>,
}

impl Rejection {
    /// Rejects with a single reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reasons: vec![reason.into()],
        }
    }

    /// Rejects with several reasons.
    pub fn with_reasons<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }

    /// The reasons.
    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// Consumes the rejection, returning its reasons.
    pub fn into_reasons(self) -> Vec<String> {
        self.reasons
    }
}

impl From<Rejection> for CommandError {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected {
            reasons: rejection.reasons,
        }
    }
}

/// Events committed for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome<E> {
    /// The command that produced the batch
    pub command_id: CommandId,
    /// The correlation id stamped on every event of the batch
    pub correlation_id: CorrelationId,
    /// The committed batch, in sequence order; empty if the handler emitted
    /// nothing
    pub events: Vec<CommittedEvent<E>>,
}

impl<E> CommandOutcome<E> {
    /// Reduces the outcome to a success result.
    pub fn to_result(&self) -> CommandResult {
        CommandResult::Success {
            command_id: self.command_id.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Typed answer to a command for callers that asked for one.
///
/// A failure always carries at least one reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    /// The command committed.
    Success {
        /// The command that succeeded
        command_id: CommandId,
        /// Correlation id of the committed events
        correlation_id: CorrelationId,
    },
    /// The command did not commit.
    Failure {
        /// The command that failed
        command_id: CommandId,
        /// Why; never empty
        reasons: Vec<String>,
    },
}

impl CommandResult {
    /// Builds a failure, substituting a generic reason for an empty list.
    pub fn fail_with(command_id: CommandId, reasons: Vec<String>) -> Self {
        let reasons = if reasons.is_empty() {
            vec![format!("failed execution for command {command_id}")]
        } else {
            reasons
        };
        Self::Failure {
            command_id,
            reasons,
        }
    }

    /// Converts a handling result into a command result.
    pub fn from_outcome<E>(
        command_id: CommandId,
        outcome: &Result<CommandOutcome<E>, CommandError>,
    ) -> Self {
        match outcome {
            Ok(outcome) => outcome.to_result(),
            Err(error) => Self::fail_with(command_id, error.reasons()),
        }
    }

    /// Whether the command committed.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The command this result answers.
    pub const fn command_id(&self) -> &CommandId {
        match self {
            Self::Success { command_id, .. } | Self::Failure { command_id, .. } => command_id,
        }
    }

    /// Failure reasons; empty for a success.
    pub fn reasons(&self) -> &[String] {
        match self {
            Self::Success { .. } => &[],
            Self::Failure { reasons, .. } => reasons,
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { command_id, .. } => {
                write!(f, "Successful execution for command {command_id}")
            }
            Self::Failure {
                command_id,
                reasons,
            } => write!(
                f,
                "Failed execution for command {command_id}: {}",
                reasons.join("; ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_failure_gets_a_generic_reason() {
        let command_id = CommandId::try_new("cmd-1").unwrap();
        let result = CommandResult::fail_with(command_id, Vec::new());
        assert_eq!(
            result.reasons(),
            ["failed execution for command cmd-1".to_string()]
        );
        assert!(!result.is_success());
    }

    #[test]
    fn failure_keeps_given_reasons() {
        let command_id = CommandId::try_new("cmd-2").unwrap();
        let result =
            CommandResult::fail_with(command_id, vec!["Aggregate already exists.".to_string()]);
        assert_eq!(result.reasons(), ["Aggregate already exists.".to_string()]);
        assert_eq!(
            result.to_string(),
            "Failed execution for command cmd-2: Aggregate already exists."
        );
    }

    #[test]
    fn errors_convert_to_failures_with_reasons() {
        let command_id = CommandId::try_new("cmd-3").unwrap();
        let outcome: Result<CommandOutcome<()>, CommandError> =
            Err(Rejection::with_reasons(["a", "b"]).into());
        let result = CommandResult::from_outcome(command_id.clone(), &outcome);
        assert_eq!(
            result,
            CommandResult::Failure {
                command_id,
                reasons: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn rejection_with_no_reasons_still_fails_with_one() {
        let command_id = CommandId::try_new("cmd-4").unwrap();
        let outcome: Result<CommandOutcome<()>, CommandError> =
            Err(Rejection::with_reasons(Vec::<String>::new()).into());
        let result = CommandResult::from_outcome(command_id, &outcome);
        assert_eq!(result.reasons().len(), 1);
    }

    #[test]
    fn success_carries_correlation_id() {
        let outcome: CommandOutcome<()> = CommandOutcome {
            command_id: CommandId::new(),
            correlation_id: CorrelationId::try_new("corr-1").unwrap(),
            events: Vec::new(),
        };
        match outcome.to_result() {
            CommandResult::Success { correlation_id, .. } => {
                assert_eq!(correlation_id.to_string(), "corr-1");
            }
            CommandResult::Failure { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn envelope_builders_set_ids() {
        let target = Identity::try_new("testaggregate-1").unwrap();
        let correlation_id = CorrelationId::new();
        let envelope = CommandEnvelope::new(target.clone(), 42_u32)
            .with_correlation_id(correlation_id.clone())
            .with_causation_id("event-1");
        assert_eq!(envelope.target, target);
        assert_eq!(envelope.correlation_id, Some(correlation_id));
        assert_eq!(envelope.causation_id.as_deref(), Some("event-1"));
    }
}
