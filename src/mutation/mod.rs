//! Strategy parameter mutation: proposals, guardrail, approval and sandbox

mod approval;
mod proposal;
mod sandbox;
mod suggestion;

pub use approval::{ApprovalQueue, ApprovalRequest, ApprovalStatus};
pub use proposal::{param_diff, Guardrail, MutationProposal, DEFAULT_BLOCKLIST};
pub use sandbox::{
    MutationOutcome, MutationReport, MutationSandbox, MutationSettings, EVENT_MUTATION_APPLIED,
};
pub use suggestion::{HttpSuggestionSource, QueuedSuggestions, SuggestionSource};
