//! DAG planning
//!
//! A branch step is an implicit dependency of every step in its arms, so the
//! arms never start before the branch has picked one.

use crate::condition::Condition;
use rago_core::{
    Component, ErrorKind, RagoError, RagoResult, StepDefinition, StepKind, WorkflowDefinition,
};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Execution order plus the effective dependencies of each step
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub order: Vec<String>,
    pub dependencies: HashMap<String, BTreeSet<String>>,
}

impl Plan {
    pub fn dependencies_of(&self, step: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(step).into_iter().flatten()
    }
}

/// Validates the definition and computes a topological order
pub fn plan(workflow: &WorkflowDefinition) -> RagoResult<Plan> {
    workflow.validate()?;
    check_nested(&workflow.name, &workflow.steps)?;
    plan_steps(&workflow.name, &workflow.steps)
}

/// Orders a list of sibling steps (the workflow itself or a loop body)
pub(crate) fn plan_steps(workflow: &str, steps: &[StepDefinition]) -> RagoResult<Plan> {
    let mut dependencies: HashMap<String, BTreeSet<String>> = steps
        .iter()
        .map(|s| (s.id.clone(), s.depends_on.iter().cloned().collect()))
        .collect();
    for step in steps {
        if let StepKind::Branch { then, otherwise, .. } = &step.kind {
            for target in then.iter().chain(otherwise.iter()) {
                if target == &step.id {
                    return Err(invalid(format!(
                        "workflow '{}': branch '{}' targets itself",
                        workflow, step.id
                    )));
                }
                if let Some(deps) = dependencies.get_mut(target) {
                    deps.insert(step.id.clone());
                }
            }
        }
    }

    // Kahn's algorithm; ties resolve in definition order
    let position: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut in_degree: Vec<usize> = steps
        .iter()
        .map(|s| dependencies.get(&s.id).map(|d| d.len()).unwrap_or(0))
        .collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in dependencies.get(&step.id).into_iter().flatten() {
            if let Some(&d) = position.get(dep.as_str()) {
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_front() {
        order.push(steps[i].id.clone());
        let mut released = Vec::new();
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                released.push(next);
            }
        }
        released.sort_unstable();
        ready.extend(released);
    }

    if order.len() != steps.len() {
        let stuck: Vec<&str> = steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.id.as_str())
            .collect();
        return Err(invalid(format!(
            "workflow '{}' has a dependency cycle through: {}",
            workflow,
            stuck.join(", ")
        )));
    }

    Ok(Plan {
        order,
        dependencies,
    })
}

/// Parses every predicate and orders every loop body up front
fn check_nested(workflow: &str, steps: &[StepDefinition]) -> RagoResult<()> {
    for step in steps {
        match &step.kind {
            StepKind::Branch { condition, .. } => {
                Condition::parse(condition)?;
            }
            StepKind::Loop {
                condition, steps, ..
            } => {
                Condition::parse(condition)?;
                check_nested(workflow, steps)?;
                plan_steps(workflow, steps)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn invalid(message: String) -> RagoError {
    RagoError::new(ErrorKind::InvalidWorkflow, message).at(Component::Agents, "plan")
}
