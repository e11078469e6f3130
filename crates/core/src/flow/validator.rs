use super::dag::FlowDag;
use crate::error::ValidationError;
use crate::types::FlowDefinition;
use serde::Serialize;

/// Check a flow definition and return its dependency graph.
///
/// Order of checks: node set (non-empty, unique ids), dependency references,
/// acyclicity, entry point, exit points.
pub fn validate_flow(flow: &FlowDefinition) -> Result<FlowDag, ValidationError> {
    let dag = FlowDag::from_definition(flow)?;

    if !dag.contains(&flow.entry_point) {
        return Err(ValidationError::InvalidEntryPoint(flow.entry_point.clone()));
    }

    if let Some(exit) = flow.exit_points.iter().find(|id| !dag.contains(id)) {
        return Err(ValidationError::InvalidExitPoint(exit.clone()));
    }

    Ok(dag)
}

/// Outcome of validating a flow, in a form suitable for reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validation {
    pub fn of(flow: &FlowDefinition) -> Self {
        match validate_flow(flow) {
            Ok(_) => Self {
                valid: true,
                reason: None,
            },
            Err(e) => Self {
                valid: false,
                reason: Some(e.to_string()),
            },
        }
    }
}
