use std::collections::{HashMap, HashSet};

use super::{retry_state_name, StateMachineTemplate, WorkflowTemplate, IGNORE_TARGET, RETRY_STATE_SUFFIX};
use crate::error::TemplateError;
use crate::workers::WorkerRegistry;

/// Parse a template document and validate it against the worker registry.
///
/// Every problem that would otherwise surface at run time (unknown states,
/// unbound workers, routes a worker does not support) is reported here.
pub fn specify_using_template(document: &str, workers: &WorkerRegistry) -> Result<WorkflowTemplate, TemplateError> {
    let template = WorkflowTemplate::from_document(document)?;
    validate_structure(&template)?;
    validate_workers(&template, workers)?;
    tracing::debug!(
        target: "flowhost::template",
        template = %template.name,
        version = %template.version,
        machines = template.state_machines.len(),
        "template validated"
    );
    Ok(template)
}

pub fn validate_structure(template: &WorkflowTemplate) -> Result<(), TemplateError> {
    if template.plugins.is_empty() {
        return Err(TemplateError::NoPlugins(template.name.clone()));
    }
    if template.state_machines.is_empty() {
        return Err(TemplateError::NoStateMachines(template.name.clone()));
    }

    let mut machine_names = HashSet::new();
    for machine in &template.state_machines {
        if machine.name.trim().is_empty() {
            return Err(TemplateError::EmptyMachineName);
        }
        if !machine_names.insert(machine.name.as_str()) {
            return Err(TemplateError::DuplicateMachine(machine.name.clone()));
        }
        validate_machine(machine)?;
    }

    if let Some(fallthrough) = &template.fallthrough {
        if !machine_names.contains(fallthrough.as_str()) {
            return Err(TemplateError::UnknownFallthrough(fallthrough.clone()));
        }
    }
    if template.workspace.inputs.iter().any(|i| i.key.trim().is_empty()) {
        return Err(TemplateError::EmptyInputKey);
    }
    Ok(())
}

fn validate_machine(machine: &StateMachineTemplate) -> Result<(), TemplateError> {
    let m = || machine.name.clone();
    let mut names = HashSet::new();
    for state in &machine.states {
        if state.name.trim().is_empty() {
            return Err(TemplateError::EmptyStateName { machine: m() });
        }
        if state.name == IGNORE_TARGET {
            return Err(TemplateError::ReservedName {
                machine: m(),
                state: state.name.clone(),
            });
        }
        if !names.insert(state.name.as_str()) {
            return Err(TemplateError::DuplicateState {
                machine: m(),
                state: state.name.clone(),
            });
        }
    }
    for state in machine.states.iter().filter(|s| s.retry.is_some()) {
        if names.contains(retry_state_name(&state.name).as_str()) {
            return Err(TemplateError::ReservedName {
                machine: m(),
                state: retry_state_name(&state.name),
            });
        }
    }

    let parents: HashMap<&str, Option<&str>> = machine
        .states
        .iter()
        .map(|s| (s.name.as_str(), s.parent.as_deref()))
        .collect();
    for state in &machine.states {
        if let Some(parent) = &state.parent {
            if !names.contains(parent.as_str()) {
                return Err(TemplateError::UnknownParent {
                    machine: m(),
                    state: state.name.clone(),
                    parent: parent.clone(),
                });
            }
        }
        let mut seen = HashSet::from([state.name.as_str()]);
        let mut cursor = state.parent.as_deref();
        while let Some(p) = cursor {
            if !seen.insert(p) {
                return Err(TemplateError::ParentCycle {
                    machine: m(),
                    state: state.name.clone(),
                });
            }
            cursor = parents.get(p).copied().flatten();
        }
    }

    if !names.contains(machine.initial_state.as_str()) {
        return Err(TemplateError::UnknownInitialState {
            machine: m(),
            state: machine.initial_state.clone(),
        });
    }

    for state in &machine.states {
        for transition in &state.transitions {
            if transition.dynamic_next.is_some() || transition.next == IGNORE_TARGET {
                continue;
            }
            if !names.contains(transition.next.as_str()) {
                return Err(TemplateError::UnknownTarget {
                    machine: m(),
                    state: state.name.clone(),
                    trigger: transition.trigger.clone(),
                    target: transition.next.clone(),
                });
            }
        }
        for action in &state.entry_actions {
            if let Some(from) = &action.from {
                let known = names.contains(from.as_str())
                    || from
                        .strip_suffix(RETRY_STATE_SUFFIX)
                        .is_some_and(|base| machine.state(base).is_some_and(|s| s.retry.is_some()));
                if !known {
                    return Err(TemplateError::UnknownFromState {
                        machine: m(),
                        state: state.name.clone(),
                        from: from.clone(),
                    });
                }
            }
        }
        if let Some(retry) = &state.retry {
            if !names.contains(retry.fail_state.as_str()) {
                return Err(TemplateError::UnknownFailState {
                    machine: m(),
                    state: state.name.clone(),
                    fail_state: retry.fail_state.clone(),
                });
            }
            if retry.minimum_minutes > retry.maximum_minutes {
                return Err(TemplateError::InvalidRetry {
                    machine: m(),
                    state: state.name.clone(),
                    reason: format!(
                        "minimum {} exceeds maximum {}",
                        retry.minimum_minutes, retry.maximum_minutes
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Every worker referenced anywhere must be bound, resolvable and support its route.
pub fn validate_workers(template: &WorkflowTemplate, workers: &WorkerRegistry) -> Result<(), TemplateError> {
    for (worker, route) in template.worker_calls() {
        let plugin = template.plugin_for(worker).ok_or_else(|| TemplateError::UnboundWorker {
            worker: worker.to_string(),
        })?;
        let resolved = workers.resolve(plugin).ok_or_else(|| TemplateError::UnresolvablePlugin {
            worker: worker.to_string(),
            plugin: plugin.to_string(),
        })?;
        let pattern = route.pattern();
        if !resolved.supports_route(&pattern) {
            return Err(TemplateError::UnsupportedRoute {
                worker: worker.to_string(),
                route: pattern,
            });
        }
    }
    Ok(())
}
