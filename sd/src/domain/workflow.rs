//! Workflow definition
//!
//! An ordered list of named steps, optionally grouped for parallel
//! execution, validated against the job catalogue at initialisation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced when a workflow definition is validated
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow has no steps")]
    Empty,

    #[error("Duplicate function '{0}' across non-skipped steps")]
    DuplicateFunction(String),

    #[error("Unknown function '{0}' (step '{1}')")]
    UnknownFunction(String, String),

    #[error("Parallel group '{0}' is not contiguous")]
    NonContiguousGroup(String),
}

/// One step in the workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step name, used for display and record naming
    pub name: String,

    /// Key into the job catalogue
    pub function_name: String,

    /// Steps sharing a group run concurrently
    #[serde(default)]
    pub parallel_group: Option<String>,

    /// Excluded from execution and from progress totals
    #[serde(default)]
    pub skipped: bool,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function_name: function_name.into(),
            parallel_group: None,
            skipped: false,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skipped = true;
        self
    }
}

/// A maximal run of consecutive steps sharing one parallel group
///
/// Steps with no group form singleton groups. Indexes refer to positions in
/// the full step list, including skipped steps.
#[derive(Debug, Clone)]
pub struct StepGroup {
    pub parallel_group: Option<String>,
    pub steps: Vec<(usize, WorkflowStep)>,
}

impl StepGroup {
    pub fn is_parallel(&self) -> bool {
        self.parallel_group.is_some() && self.steps.len() > 1
    }
}

/// Ordered, immutable workflow for one cycled list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Cycled list name
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Steps that actually execute
    pub fn active_steps(&self) -> impl Iterator<Item = (usize, &WorkflowStep)> {
        self.steps.iter().enumerate().filter(|(_, s)| !s.skipped)
    }

    /// Count of non-skipped steps; published as totalAsyncFns
    pub fn total_async_fns(&self) -> u32 {
        self.active_steps().count() as u32
    }

    /// Validate structure and resolve every function against the catalogue
    ///
    /// `known_function` is fed by the job catalogue; unknown names are a
    /// configuration error at initialisation, never at cycle time.
    pub fn validate(&self, known_function: impl Fn(&str) -> bool) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut seen = std::collections::HashSet::new();
        for step in self.steps.iter().filter(|s| !s.skipped) {
            if !seen.insert(step.function_name.as_str()) {
                return Err(WorkflowError::DuplicateFunction(step.function_name.clone()));
            }
            if !known_function(&step.function_name) {
                return Err(WorkflowError::UnknownFunction(
                    step.function_name.clone(),
                    step.name.clone(),
                ));
            }
        }

        // A group may appear only as one contiguous run
        let mut closed_groups = std::collections::HashSet::new();
        let mut current: Option<&str> = None;
        for step in &self.steps {
            match (current, step.parallel_group.as_deref()) {
                (Some(prev), Some(group)) if prev == group => {}
                (_, Some(group)) => {
                    if !closed_groups.insert(group) {
                        return Err(WorkflowError::NonContiguousGroup(group.to_string()));
                    }
                    current = Some(group);
                }
                (_, None) => current = None,
            }
        }

        Ok(())
    }

    /// Partition steps into contiguous groups
    pub fn groups(&self) -> Vec<StepGroup> {
        let mut groups: Vec<StepGroup> = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            match groups.last_mut() {
                Some(last) if step.parallel_group.is_some() && last.parallel_group == step.parallel_group => {
                    last.steps.push((index, step.clone()));
                }
                _ => groups.push(StepGroup {
                    parallel_group: step.parallel_group.clone(),
                    steps: vec![(index, step.clone())],
                }),
            }
        }
        groups
    }

    /// The next non-skipped step at or after `index`
    pub fn next_active_from(&self, index: usize) -> Option<(usize, &WorkflowStep)> {
        self.steps
            .iter()
            .enumerate()
            .skip(index)
            .find(|(_, s)| !s.skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition::new("market-sync", steps)
    }

    #[test]
    fn test_validate_ok() {
        let w = def(vec![
            WorkflowStep::new("Exchanges", "sync_exchanges"),
            WorkflowStep::new("Tickers", "sync_tickers"),
        ]);
        assert!(w.validate(|_| true).is_ok());
    }

    #[test]
    fn test_validate_empty() {
        let w = def(vec![]);
        assert_eq!(w.validate(|_| true), Err(WorkflowError::Empty));
    }

    #[test]
    fn test_validate_duplicate_function() {
        let w = def(vec![
            WorkflowStep::new("A", "sync_tickers"),
            WorkflowStep::new("B", "sync_tickers"),
        ]);
        assert_eq!(
            w.validate(|_| true),
            Err(WorkflowError::DuplicateFunction("sync_tickers".into()))
        );
    }

    #[test]
    fn test_validate_duplicate_allowed_when_skipped() {
        let w = def(vec![
            WorkflowStep::new("A", "sync_tickers"),
            WorkflowStep::new("B", "sync_tickers").skipped(),
        ]);
        assert!(w.validate(|_| true).is_ok());
    }

    #[test]
    fn test_validate_unknown_function() {
        let w = def(vec![WorkflowStep::new("A", "nope")]);
        assert_eq!(
            w.validate(|name| name != "nope"),
            Err(WorkflowError::UnknownFunction("nope".into(), "A".into()))
        );
    }

    #[test]
    fn test_validate_non_contiguous_group() {
        let w = def(vec![
            WorkflowStep::new("A", "fa").in_group("g"),
            WorkflowStep::new("B", "fb"),
            WorkflowStep::new("C", "fc").in_group("g"),
        ]);
        assert_eq!(w.validate(|_| true), Err(WorkflowError::NonContiguousGroup("g".into())));
    }

    #[test]
    fn test_groups_partition() {
        let w = def(vec![
            WorkflowStep::new("A", "fa"),
            WorkflowStep::new("B", "fb").in_group("g"),
            WorkflowStep::new("C", "fc").in_group("g"),
            WorkflowStep::new("D", "fd"),
        ]);
        let groups = w.groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].steps.len(), 1);
        assert!(!groups[0].is_parallel());
        assert_eq!(groups[1].steps.len(), 2);
        assert!(groups[1].is_parallel());
        assert_eq!(groups[1].steps[0].0, 1);
        assert_eq!(groups[1].steps[1].0, 2);
        assert_eq!(groups[2].steps.len(), 1);
    }

    #[test]
    fn test_groups_adjacent_different_groups_not_merged() {
        let w = def(vec![
            WorkflowStep::new("A", "fa").in_group("g1"),
            WorkflowStep::new("B", "fb").in_group("g2"),
        ]);
        let groups = w.groups();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_singleton_group_not_parallel() {
        let w = def(vec![WorkflowStep::new("A", "fa").in_group("g")]);
        let groups = w.groups();
        assert_eq!(groups.len(), 1);
        // A parallel group of size one behaves like a sequential step
        assert!(!groups[0].is_parallel());
    }

    #[test]
    fn test_total_async_fns_excludes_skipped() {
        let w = def(vec![
            WorkflowStep::new("A", "fa"),
            WorkflowStep::new("B", "fb").skipped(),
            WorkflowStep::new("C", "fc"),
        ]);
        assert_eq!(w.total_async_fns(), 2);
    }

    #[test]
    fn test_next_active_from() {
        let w = def(vec![
            WorkflowStep::new("A", "fa"),
            WorkflowStep::new("B", "fb").skipped(),
            WorkflowStep::new("C", "fc"),
        ]);
        let (idx, step) = w.next_active_from(1).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(step.name, "C");
        assert!(w.next_active_from(3).is_none());
    }
}
