//! Hierarchical state machine runtime.
//!
//! A [`StateMachine`] is the compiled, immutable graph of one
//! [`StateMachineTemplate`]: an arena of state nodes linked to their parents
//! and a rule table keyed by `(state, trigger)`. The current state is never
//! held here; every fire reads it through [`WorkflowContext::access_state`]
//! and writes it back through [`WorkflowContext::change_state`].
//!
//! Triggers raised while a trigger is processed (an action's next or
//! exception trigger, the fail trigger of an exhausted retry) are queued and
//! handled after the current transition completes, in the order raised.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::alerts::Severity;
use crate::context::{ActionContext, WorkflowContext};
use crate::error::{ActionError, TemplateError, WorkflowError};
use crate::template::{
    retry_state_name, ActionTemplate, RetryTemplate, RouteExpr, StateMachineTemplate, WorkerCall, FAIL_TRIGGER,
    IGNORE_TARGET, RETRY_TRIGGER,
};
use crate::{workflow_error, workflow_info, workflow_warn};

pub mod retry;

pub use retry::{backoff, retry_counter_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Normal,
    /// Implicit retry state of the node at this index.
    RetryOf(usize),
}

#[derive(Debug)]
struct StateNode {
    name: String,
    parent: Option<usize>,
    kind: NodeKind,
    entry_actions: Vec<ActionTemplate>,
    exit_actions: Vec<ActionTemplate>,
    retry: Option<RetryTemplate>,
}

#[derive(Debug, Clone)]
enum Transition {
    Direct(usize),
    /// Exit and re-enter the state owning the rule.
    Reentrant,
    Ignore,
    Dynamic(WorkerCall),
}

#[derive(Debug, Clone)]
struct Rule {
    transition: Transition,
    guard: Option<WorkerCall>,
}

enum Resolution {
    To { target: usize, reenter: bool },
    Ignored,
    Unhandled,
}

/// A state change applied while firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transitioned {
    pub trigger: String,
    pub from: String,
    pub to: String,
}

/// What one [`StateMachine::fire`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireOutcome {
    pub transitions: Vec<Transitioned>,
    /// Triggers no rule handled, in the order they were raised.
    pub unhandled: Vec<String>,
    /// Set when a retry state asked the instance to sleep until its retry is due.
    pub sleep_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct StateMachine {
    name: String,
    activation_trigger: Option<String>,
    nodes: Vec<StateNode>,
    index: HashMap<String, usize>,
    rules: HashMap<(usize, String), Vec<Rule>>,
}

impl StateMachine {
    /// Compile a machine template. The template is expected to have passed
    /// validation; references that still do not resolve are template errors.
    pub fn from_template(template: &StateMachineTemplate) -> Result<Self, TemplateError> {
        let machine = || template.name.clone();
        let mut nodes = Vec::with_capacity(template.states.len());
        let mut index = HashMap::new();

        for state in &template.states {
            index.insert(state.name.clone(), nodes.len());
            nodes.push(StateNode {
                name: state.name.clone(),
                parent: None,
                kind: NodeKind::Normal,
                entry_actions: state.entry_actions.clone(),
                exit_actions: state.exit_actions.clone(),
                retry: state.retry.clone(),
            });
        }
        for (base, state) in template.states.iter().enumerate() {
            if state.retry.is_some() {
                let name = retry_state_name(&state.name);
                index.insert(name.clone(), nodes.len());
                nodes.push(StateNode {
                    name,
                    parent: None,
                    kind: NodeKind::RetryOf(base),
                    entry_actions: Vec::new(),
                    exit_actions: Vec::new(),
                    retry: None,
                });
            }
        }

        // retry states hang off the same parent as their base state
        for i in 0..nodes.len() {
            let owner = match nodes[i].kind {
                NodeKind::Normal => i,
                NodeKind::RetryOf(base) => base,
            };
            if let Some(parent) = &template.states[owner].parent {
                let p = *index.get(parent).ok_or_else(|| TemplateError::UnknownParent {
                    machine: machine(),
                    state: nodes[i].name.clone(),
                    parent: parent.clone(),
                })?;
                nodes[i].parent = Some(p);
            }
        }

        if !index.contains_key(&template.initial_state) {
            return Err(TemplateError::UnknownInitialState {
                machine: machine(),
                state: template.initial_state.clone(),
            });
        }

        let mut rules: HashMap<(usize, String), Vec<Rule>> = HashMap::new();
        for (owner, state) in template.states.iter().enumerate() {
            if let Some(policy) = &state.retry {
                let fail = *index.get(&policy.fail_state).ok_or_else(|| TemplateError::UnknownFailState {
                    machine: machine(),
                    state: state.name.clone(),
                    fail_state: policy.fail_state.clone(),
                })?;
                let retry_node = index[&retry_state_name(&state.name)];
                for (from, to) in [(owner, retry_node), (retry_node, owner)] {
                    rules.entry((from, RETRY_TRIGGER.to_string())).or_default().push(Rule {
                        transition: Transition::Direct(to),
                        guard: None,
                    });
                    rules.entry((from, FAIL_TRIGGER.to_string())).or_default().push(Rule {
                        transition: Transition::Direct(fail),
                        guard: None,
                    });
                }
            }

            for t in &state.transitions {
                let transition = if t.next == state.name {
                    Transition::Reentrant
                } else if t.next == IGNORE_TARGET {
                    Transition::Ignore
                } else if let Some(call) = &t.dynamic_next {
                    Transition::Dynamic(call.clone())
                } else {
                    let target = *index.get(&t.next).ok_or_else(|| TemplateError::UnknownTarget {
                        machine: machine(),
                        state: state.name.clone(),
                        trigger: t.trigger.clone(),
                        target: t.next.clone(),
                    })?;
                    Transition::Direct(target)
                };
                rules.entry((owner, t.trigger.clone())).or_default().push(Rule {
                    transition,
                    guard: t.guard.clone(),
                });
            }
        }

        Ok(Self {
            name: template.name.clone(),
            activation_trigger: template.activation_trigger.clone(),
            nodes,
            index,
            rules,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activation_trigger(&self) -> Option<&str> {
        self.activation_trigger.as_deref()
    }

    /// Every state name, implicit retry states included.
    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn is_retry_state(&self, name: &str) -> bool {
        self.index
            .get(name)
            .is_some_and(|&i| matches!(self.nodes[i].kind, NodeKind::RetryOf(_)))
    }

    /// Fire `trigger`, then every trigger raised while handling it.
    ///
    /// Action, guard and decision failures are contained here: they are
    /// logged, alerted and, where configured, redirected to an exception
    /// trigger. Only persistence failures are returned as errors.
    pub async fn fire(&self, ctx: &WorkflowContext, trigger: &str) -> Result<FireOutcome, WorkflowError> {
        let log = ActionContext::new(ctx.instance_id(), &self.name);
        let mut outcome = FireOutcome::default();
        let mut queue = VecDeque::from([trigger.to_string()]);
        let mut handled = 0usize;

        while let Some(trigger) = queue.pop_front() {
            handled += 1;
            if handled > ctx.options().max_chained_triggers {
                workflow_error!(log, trigger = %trigger, dropped = queue.len() + 1, "trigger chain limit reached");
                ctx.alert(
                    Severity::Error,
                    &format!("instance {} machine {}: trigger chain limit reached", ctx.instance_id(), self.name),
                );
                break;
            }

            let current = ctx.access_state(&self.name).await?;
            let Some(&from) = self.index.get(&current.state) else {
                workflow_error!(log, state = %current.state, trigger = %trigger, "persisted state is not part of the machine");
                ctx.alert(
                    Severity::Error,
                    &format!(
                        "instance {} machine {} is in unknown state {}",
                        ctx.instance_id(),
                        self.name,
                        current.state
                    ),
                );
                outcome.unhandled.push(trigger);
                continue;
            };

            match self.resolve(ctx, from, &trigger).await {
                Resolution::To { target, reenter } => {
                    self.transition(ctx, from, target, reenter, &trigger, &mut queue, &mut outcome)
                        .await?;
                }
                Resolution::Ignored => {
                    tracing::debug!(
                        target: "flowhost::workflow",
                        instance_id = %ctx.instance_id(),
                        machine = %self.name,
                        state = %current.state,
                        trigger = %trigger,
                        "trigger ignored"
                    );
                }
                Resolution::Unhandled => {
                    tracing::debug!(
                        target: "flowhost::workflow",
                        instance_id = %ctx.instance_id(),
                        machine = %self.name,
                        state = %current.state,
                        trigger = %trigger,
                        "trigger not handled"
                    );
                    outcome.unhandled.push(trigger);
                }
            }
        }
        Ok(outcome)
    }

    /// Walk from `from` up through its ancestors; the first rule whose guard
    /// passes decides.
    async fn resolve(&self, ctx: &WorkflowContext, from: usize, trigger: &str) -> Resolution {
        let state = self.nodes[from].name.as_str();
        for owner in self.lineage(from) {
            let Some(rules) = self.rules.get(&(owner, trigger.to_string())) else {
                continue;
            };
            for rule in rules {
                if let Some(guard) = &rule.guard {
                    if !self.guard_passes(ctx, guard, state, trigger).await {
                        continue;
                    }
                }
                return match &rule.transition {
                    Transition::Direct(target) => Resolution::To {
                        target: *target,
                        reenter: *target == from,
                    },
                    Transition::Reentrant => Resolution::To {
                        target: owner,
                        reenter: true,
                    },
                    Transition::Ignore => Resolution::Ignored,
                    Transition::Dynamic(call) => self.decide(ctx, call, owner, state, trigger).await,
                };
            }
        }
        Resolution::Unhandled
    }

    async fn guard_passes(&self, ctx: &WorkflowContext, guard: &WorkerCall, state: &str, trigger: &str) -> bool {
        let worker = match ctx.worker_for(&guard.worker) {
            Ok(w) => w,
            Err(e) => {
                self.report_failure(ctx, "guard", &e.to_string());
                return false;
            }
        };
        let route = ctx.resolve_route(&self.name, &guard.route).await;
        match worker.guard(ctx.instance_id(), &route, state, trigger).await {
            Ok(allowed) => allowed,
            Err(e) => {
                self.report_failure(ctx, "guard", &format!("worker {} at {route}: {e}", guard.worker));
                false
            }
        }
    }

    async fn decide(
        &self,
        ctx: &WorkflowContext,
        call: &WorkerCall,
        owner: usize,
        state: &str,
        trigger: &str,
    ) -> Resolution {
        let worker = match ctx.worker_for(&call.worker) {
            Ok(w) => w,
            Err(e) => {
                self.report_failure(ctx, "transition decision", &e.to_string());
                return Resolution::Ignored;
            }
        };
        let route = ctx.resolve_route(&self.name, &call.route).await;
        let next = match worker.decide_transition(ctx.instance_id(), &route, trigger, state).await {
            Ok(next) => next,
            Err(e) => {
                self.report_failure(
                    ctx,
                    "transition decision",
                    &format!("worker {} at {route}: {e}", call.worker),
                );
                return Resolution::Ignored;
            }
        };
        if next == IGNORE_TARGET {
            return Resolution::Ignored;
        }
        if next == self.nodes[owner].name {
            return Resolution::To {
                target: owner,
                reenter: true,
            };
        }
        match self.index.get(&next) {
            Some(&target) => Resolution::To {
                target,
                reenter: false,
            },
            None => {
                self.report_failure(
                    ctx,
                    "transition decision",
                    &format!("worker {} chose unknown state {next}", call.worker),
                );
                Resolution::Ignored
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        ctx: &WorkflowContext,
        from: usize,
        to: usize,
        reenter: bool,
        trigger: &str,
        queue: &mut VecDeque<String>,
        outcome: &mut FireOutcome,
    ) -> Result<(), WorkflowError> {
        let from_chain = self.lineage(from);
        let to_chain = self.lineage(to);
        let exits: Vec<usize> = from_chain
            .iter()
            .copied()
            .filter(|n| !to_chain.contains(n) || (reenter && *n == to))
            .collect();
        let entries: Vec<usize> = to_chain
            .iter()
            .rev()
            .copied()
            .filter(|n| !from_chain.contains(n) || (reenter && *n == to))
            .collect();

        for node in &exits {
            for action in &self.nodes[*node].exit_actions {
                self.run_action(ctx, action, queue).await;
            }
        }

        if let Some(base) = self.retry_group(from) {
            if self.retry_group(to) != Some(base) {
                let key = retry_counter_key(&self.name, &self.nodes[base].name);
                ctx.workspace().remove(&key).await?;
            }
        }

        let from_name = self.nodes[from].name.clone();
        let to_name = self.nodes[to].name.clone();
        ctx.change_state(&self.name, &to_name).await?;
        let log = ActionContext::new(ctx.instance_id(), &self.name);
        workflow_info!(log, trigger = %trigger, from = %from_name, to = %to_name, "state changed");
        outcome.transitions.push(Transitioned {
            trigger: trigger.to_string(),
            from: from_name.clone(),
            to: to_name,
        });

        for node in entries {
            for action in &self.nodes[node].entry_actions {
                if action.from.as_deref().is_some_and(|f| f != from_name) {
                    continue;
                }
                self.run_action(ctx, action, queue).await;
            }
            if let NodeKind::RetryOf(base) = self.nodes[node].kind {
                self.enter_retry(ctx, base, queue, outcome).await?;
            }
        }
        Ok(())
    }

    /// Entry into `<base>_retry`: recovery, counter, then either the fail
    /// trigger or a scheduled retry.
    async fn enter_retry(
        &self,
        ctx: &WorkflowContext,
        base: usize,
        queue: &mut VecDeque<String>,
        outcome: &mut FireOutcome,
    ) -> Result<(), WorkflowError> {
        let Some(policy) = self.nodes[base].retry.as_ref() else {
            return Ok(());
        };
        let state = &self.nodes[base].name;
        let log = ActionContext::new(ctx.instance_id(), &self.name);

        if let Some(recovery) = &policy.recovery {
            self.run_action(ctx, recovery, queue).await;
        }

        let key = retry_counter_key(&self.name, state);
        let count: u32 = ctx
            .workspace()
            .batch(|data| {
                let next = data.get::<u32>(&key)?.unwrap_or(0).saturating_add(1);
                data.put(&key, &next)?;
                Ok(next)
            })
            .await?;

        if count > policy.count {
            workflow_warn!(log, state = %state, attempts = count - 1, fail_state = %policy.fail_state, "retries exhausted");
            queue.push_back(FAIL_TRIGGER.to_string());
            return Ok(());
        }

        let delay = backoff(count, policy, &mut rand::thread_rng());
        let when = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        match ctx.schedule_retry(&self.name, RETRY_TRIGGER, when).await {
            Ok(job_id) => {
                workflow_info!(log, state = %state, retry = count, due = %when, job_id = %job_id, "retry scheduled");
            }
            Err(e) => {
                self.report_failure(ctx, "retry scheduling", &format!("state {state}: {e}"));
            }
        }
        if policy.sleep_on_retry {
            outcome.sleep_until = Some(outcome.sleep_until.map_or(when, |t| t.max(when)));
        }
        Ok(())
    }

    async fn run_action(&self, ctx: &WorkflowContext, action: &ActionTemplate, queue: &mut VecDeque<String>) {
        match self.invoke(ctx, &action.worker, &action.route).await {
            Ok(()) => {
                if let Some(next) = &action.next_trigger {
                    queue.push_back(next.clone());
                }
            }
            Err(e) => {
                self.report_failure(ctx, "action", &e.to_string());
                if let Some(exception) = &action.exception_trigger {
                    queue.push_back(exception.clone());
                }
            }
        }
    }

    async fn invoke(&self, ctx: &WorkflowContext, worker: &str, route: &RouteExpr) -> Result<(), ActionError> {
        let target = ctx.worker_for(worker)?;
        let route = ctx.resolve_route(&self.name, route).await;
        target
            .invoke(ctx.instance_id(), &route)
            .await
            .map_err(|source| ActionError::Worker {
                worker: worker.to_string(),
                route,
                source,
            })
    }

    fn report_failure(&self, ctx: &WorkflowContext, what: &str, detail: &str) {
        let log = ActionContext::new(ctx.instance_id(), &self.name);
        workflow_error!(log, failure = what, error = %detail, "worker call failed");
        ctx.alert(
            Severity::Error,
            &format!("instance {} machine {} {what} failed: {detail}", ctx.instance_id(), self.name),
        );
    }

    /// `idx` followed by its ancestors, nearest first.
    fn lineage(&self, idx: usize) -> Vec<usize> {
        let mut chain = vec![idx];
        let mut cursor = self.nodes[idx].parent;
        while let Some(p) = cursor {
            if chain.contains(&p) || chain.len() > self.nodes.len() {
                break;
            }
            chain.push(p);
            cursor = self.nodes[p].parent;
        }
        chain
    }

    /// Base state of the retry group `idx` belongs to, if any.
    fn retry_group(&self, idx: usize) -> Option<usize> {
        match self.nodes[idx].kind {
            NodeKind::RetryOf(base) => Some(base),
            NodeKind::Normal if self.nodes[idx].retry.is_some() => Some(idx),
            NodeKind::Normal => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::context::testing::{fixture, Fixture};
    use crate::error::WorkerError;
    use crate::host::messages::RetryJob;
    use crate::template::WorkflowTemplate;
    use crate::workers::{Worker, WorkerRegistry};

    const MACHINE_TEMPLATE: &str = r#"{
        "name": "machine-test",
        "version": "1.0.0",
        "plugins": [{ "routeId": "w", "plugin": "script" }],
        "stateMachines": [{
            "name": "main",
            "initialState": "Idle",
            "states": [
                {
                    "name": "Idle",
                    "transitions": [
                        { "trigger": "start", "next": "Working" },
                        { "trigger": "charge", "next": "Charging" },
                        { "trigger": "send", "next": "Sending" },
                        { "trigger": "skip", "next": "sys.ignore" }
                    ]
                },
                {
                    "name": "Active",
                    "exitActions": [{ "worker": "w", "route": "exit-active" }],
                    "transitions": [{ "trigger": "halt", "next": "Idle" }]
                },
                {
                    "name": "Working",
                    "parent": "Active",
                    "entryActions": [
                        { "worker": "w", "route": "enter-working" },
                        { "worker": "w", "route": "from-idle", "from": "Idle" }
                    ],
                    "exitActions": [{ "worker": "w", "route": "exit-working" }],
                    "transitions": [
                        { "trigger": "poke", "next": "Working" },
                        { "trigger": "maybe", "next": "Finished", "guard": { "worker": "w", "route": "allow" } },
                        { "trigger": "decide", "dynamicNext": { "worker": "w", "route": "pick" } },
                        { "trigger": "recheck", "next": "Working", "dynamicNext": { "worker": "w", "route": "pick" } }
                    ]
                },
                { "name": "Finished", "parent": "Active" },
                {
                    "name": "Charging",
                    "entryActions": [{
                        "worker": "w",
                        "route": "charge",
                        "nextTrigger": "charged",
                        "exceptionTrigger": "declined"
                    }],
                    "transitions": [
                        { "trigger": "charged", "next": "Finished" },
                        { "trigger": "declined", "next": "Broken" }
                    ]
                },
                {
                    "name": "Sending",
                    "entryActions": [{ "worker": "w", "route": "send", "exceptionTrigger": "sys.retry" }],
                    "retry": {
                        "failState": "Broken",
                        "count": 3,
                        "minimumMinutes": 1,
                        "maximumMinutes": 10,
                        "deltaMinutes": 1
                    }
                },
                { "name": "Broken" }
            ]
        }]
    }"#;

    #[derive(Default)]
    struct Script {
        calls: Mutex<Vec<String>>,
        failing: Mutex<HashSet<String>>,
        allowed: Mutex<HashSet<String>>,
        decision: Mutex<String>,
    }

    impl Script {
        fn calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn fail(&self, route: &str) {
            self.failing.lock().unwrap().insert(route.to_string());
        }
    }

    #[async_trait::async_trait]
    impl Worker for Script {
        async fn invoke(&self, _instance_id: &str, route: &str) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push(route.to_string());
            if self.failing.lock().unwrap().contains(route) {
                Err(WorkerError::failed(format!("{route} failed")))
            } else {
                Ok(())
            }
        }

        async fn guard(&self, _instance_id: &str, route: &str, _state: &str, _trigger: &str) -> Result<bool, WorkerError> {
            Ok(self.allowed.lock().unwrap().contains(route))
        }

        async fn decide_transition(
            &self,
            _instance_id: &str,
            _route: &str,
            _trigger: &str,
            _state: &str,
        ) -> Result<String, WorkerError> {
            Ok(self.decision.lock().unwrap().clone())
        }

        fn supports_route(&self, _pattern: &str) -> bool {
            true
        }
    }

    fn setup() -> (StateMachine, Fixture, Arc<Script>) {
        let template = WorkflowTemplate::from_document(MACHINE_TEMPLATE).unwrap();
        let script = Arc::new(Script::default());
        let workers = WorkerRegistry::builder().register("script", script.clone()).build();
        let machine = StateMachine::from_template(template.machine("main").unwrap()).unwrap();
        (machine, fixture(template, workers), script)
    }

    async fn state_of(f: &Fixture) -> String {
        f.ctx.access_state("main").await.unwrap().state
    }

    #[tokio::test]
    async fn entering_a_substate_runs_filtered_entry_actions() {
        let (machine, f, script) = setup();
        let outcome = machine.fire(&f.ctx, "start").await.unwrap();
        assert_eq!(
            outcome.transitions,
            vec![Transitioned {
                trigger: "start".into(),
                from: "Idle".into(),
                to: "Working".into()
            }]
        );
        assert_eq!(script.calls(), vec!["enter-working", "from-idle"]);
        assert_eq!(state_of(&f).await, "Working");
    }

    #[tokio::test]
    async fn reentry_runs_exit_then_entry_and_restamps_state() {
        let (machine, f, script) = setup();
        machine.fire(&f.ctx, "start").await.unwrap();
        script.calls();
        let before = f.ctx.access_state("main").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        machine.fire(&f.ctx, "poke").await.unwrap();
        assert_eq!(script.calls(), vec!["exit-working", "enter-working"]);
        let after = f.ctx.access_state("main").await.unwrap();
        assert_eq!(after.state, "Working");
        assert!(after.last_state_changed > before.last_state_changed);
    }

    #[tokio::test]
    async fn ancestor_rules_apply_to_substates() {
        let (machine, f, script) = setup();
        machine.fire(&f.ctx, "start").await.unwrap();
        script.calls();

        machine.fire(&f.ctx, "halt").await.unwrap();
        assert_eq!(script.calls(), vec!["exit-working", "exit-active"]);
        assert_eq!(state_of(&f).await, "Idle");
    }

    #[tokio::test]
    async fn ignored_and_unhandled_triggers() {
        let (machine, f, _script) = setup();
        let ignored = machine.fire(&f.ctx, "skip").await.unwrap();
        assert_eq!(ignored, FireOutcome::default());

        let unhandled = machine.fire(&f.ctx, "bogus").await.unwrap();
        assert_eq!(unhandled.unhandled, vec!["bogus"]);
        assert_eq!(state_of(&f).await, "Idle");
    }

    #[tokio::test]
    async fn guard_blocks_until_allowed() {
        let (machine, f, script) = setup();
        machine.fire(&f.ctx, "start").await.unwrap();

        let blocked = machine.fire(&f.ctx, "maybe").await.unwrap();
        assert_eq!(blocked.unhandled, vec!["maybe"]);
        assert_eq!(state_of(&f).await, "Working");

        script.allowed.lock().unwrap().insert("allow".into());
        machine.fire(&f.ctx, "maybe").await.unwrap();
        assert_eq!(state_of(&f).await, "Finished");
    }

    #[tokio::test]
    async fn dynamic_next_state() {
        let (machine, f, script) = setup();
        machine.fire(&f.ctx, "start").await.unwrap();
        script.calls();

        *script.decision.lock().unwrap() = "sys.ignore".into();
        assert!(machine.fire(&f.ctx, "decide").await.unwrap().transitions.is_empty());

        *script.decision.lock().unwrap() = "Working".into();
        machine.fire(&f.ctx, "decide").await.unwrap();
        assert_eq!(script.calls(), vec!["exit-working", "enter-working"]);

        *script.decision.lock().unwrap() = "Nowhere".into();
        machine.fire(&f.ctx, "decide").await.unwrap();
        assert_eq!(state_of(&f).await, "Working");
        assert_eq!(f.alerts.seen.lock().unwrap().len(), 1);

        *script.decision.lock().unwrap() = "Finished".into();
        machine.fire(&f.ctx, "decide").await.unwrap();
        assert_eq!(state_of(&f).await, "Finished");
    }

    #[tokio::test]
    async fn literal_self_target_reenters_before_consulting_dynamic_next() {
        let (machine, f, script) = setup();
        machine.fire(&f.ctx, "start").await.unwrap();
        script.calls();

        *script.decision.lock().unwrap() = "Finished".into();
        let outcome = machine.fire(&f.ctx, "recheck").await.unwrap();
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].to, "Working");
        assert_eq!(script.calls(), vec!["exit-working", "enter-working"]);
        assert_eq!(state_of(&f).await, "Working");
    }

    #[tokio::test]
    async fn next_trigger_chains_after_success() {
        let (machine, f, _script) = setup();
        let outcome = machine.fire(&f.ctx, "charge").await.unwrap();
        let path: Vec<_> = outcome.transitions.iter().map(|t| t.to.as_str()).collect();
        assert_eq!(path, vec!["Charging", "Finished"]);
        assert!(f.alerts.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_action_alerts_and_fires_exception_trigger() {
        let (machine, f, script) = setup();
        script.fail("charge");
        machine.fire(&f.ctx, "charge").await.unwrap();
        assert_eq!(state_of(&f).await, "Broken");
        assert_eq!(script.calls(), vec!["charge"]);
        let alerts = f.alerts.seen.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, Severity::Error);
    }

    #[tokio::test]
    async fn retry_exhaustion_moves_to_fail_state_on_fourth_attempt() {
        let (machine, f, script) = setup();
        script.fail("send");

        machine.fire(&f.ctx, "send").await.unwrap();
        assert_eq!(state_of(&f).await, "Sending_retry");
        assert!(machine.is_retry_state("Sending_retry"));

        for attempt in 2..=3u32 {
            machine.fire(&f.ctx, RETRY_TRIGGER).await.unwrap();
            assert_eq!(state_of(&f).await, "Sending_retry");
            let counter: Option<u32> = f.ctx.workspace().get(&retry_counter_key("main", "Sending")).await.unwrap();
            assert_eq!(counter, Some(attempt));
        }

        let outcome = machine.fire(&f.ctx, RETRY_TRIGGER).await.unwrap();
        assert_eq!(outcome.transitions.last().unwrap().to, "Broken");
        assert_eq!(state_of(&f).await, "Broken");
        assert_eq!(script.calls().iter().filter(|c| *c == "send").count(), 4);

        let jobs = f.scheduler.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 3);
        let now = Utc::now();
        for (job, when, _) in jobs.iter() {
            let retry: RetryJob = job.envelope.open().unwrap();
            assert_eq!(retry.trigger, RETRY_TRIGGER);
            assert!(*when <= now + chrono::Duration::minutes(10));
            assert!(*when >= now + chrono::Duration::seconds(50));
        }
        drop(jobs);

        let counter: Option<u32> = f.ctx.workspace().get(&retry_counter_key("main", "Sending")).await.unwrap();
        assert_eq!(counter, None);
    }

    #[tokio::test]
    async fn sleep_on_retry_reports_wake_time() {
        let mut template = WorkflowTemplate::from_document(MACHINE_TEMPLATE).unwrap();
        let sending = template.state_machines[0]
            .states
            .iter_mut()
            .find(|s| s.name == "Sending")
            .unwrap();
        sending.retry.as_mut().unwrap().sleep_on_retry = true;

        let script = Arc::new(Script::default());
        script.fail("send");
        let workers = WorkerRegistry::builder().register("script", script.clone()).build();
        let machine = StateMachine::from_template(template.machine("main").unwrap()).unwrap();
        let f = fixture(template, workers);

        let outcome = machine.fire(&f.ctx, "send").await.unwrap();
        let wake = outcome.sleep_until.expect("sleep requested");
        assert!(wake > Utc::now());
    }

    #[test]
    fn compiles_retry_states_and_rejects_bad_targets() {
        let template = WorkflowTemplate::from_document(MACHINE_TEMPLATE).unwrap();
        let machine = StateMachine::from_template(template.machine("main").unwrap()).unwrap();
        assert!(machine.state_names().any(|s| s == "Sending_retry"));
        assert!(!machine.is_retry_state("Sending"));

        let mut broken = template.machine("main").unwrap().clone();
        broken.states[0].transitions[0].next = "Nowhere".into();
        assert!(matches!(
            StateMachine::from_template(&broken),
            Err(TemplateError::UnknownTarget { .. })
        ));
    }
}
