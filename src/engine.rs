//! Pure transition algorithm
//!
//! One microstep: select transitions per atomic leaf, filter conflicts,
//! compute exit and entry sets with internal/external semantics, order the
//! resulting actions deterministically, fold assigns into the next context,
//! and derive `changed`/`next_events`/`done`. No timers, no I/O — equal
//! inputs produce structurally equal outputs.
//!
//! Eventless transitions are *not* chased here: the interpreter feeds the
//! null event back through `microstep` until the configuration is quiescent.

use std::collections::{HashSet, VecDeque};

use tracing::warn;

use crate::action::{ActionDef, SendDef};
use crate::actor::Spawner;
use crate::chart::{Chart, HistoryKind, NodeId, NodeKind, TransitionDef};
use crate::error::{ChartError, ChartResult};
use crate::event::{
    done_state_event, Event, ScxmlEvent, NULL_EVENT, WILDCARD_EVENT,
};
use crate::machine::{Machine, MachineContext};
use crate::state::{HistoryValue, State};

/// A selected transition with its resolved targets and exit scope.
struct Micro<'a, C> {
    transition: &'a TransitionDef<C>,
    /// Resolved targets; empty for actions-only selections.
    targets: Vec<NodeId>,
    /// Exit scope; `None` for actions-only selections (no exit, no entry).
    domain: Option<NodeId>,
    exit_set: Vec<NodeId>,
}

/// Compute the state entered from the synthetic initial event.
pub(crate) fn initial_state<C: MachineContext>(machine: &Machine<C>) -> ChartResult<State<C>> {
    let chart = machine.chart();
    let mut entry = Vec::new();
    chart.enter_defaults(chart.root(), &mut entry)?;
    entry.sort_by_key(|&node| (chart.node(node).depth, chart.node(node).order));
    entry.dedup();

    let event = ScxmlEvent::init();
    let mut staged = Vec::new();
    stage_entry_actions(chart, &entry, &mut staged);
    stage_done_events(chart, &entry, &entry, &mut staged);

    let mut context = machine.initial_context().clone();
    let mut children = std::collections::BTreeMap::new();
    let actions = fold_assigns(staged, &mut context, &mut children, &event.data);

    let configuration = entry;
    let value = chart.value_of(&configuration);
    let next_events = next_events(chart, &configuration);
    let done = chart_done(chart, &configuration.iter().copied().collect());

    Ok(State {
        value,
        context,
        event: event.data.clone(),
        scxml_event: event,
        actions,
        children,
        changed: None,
        history_value: HistoryValue::new(),
        history: None,
        next_events,
        done,
        exited: Vec::new(),
    })
}

/// One pure microstep: `(state, event) -> next state`.
pub(crate) fn microstep<C: MachineContext>(
    machine: &Machine<C>,
    state: &State<C>,
    event: ScxmlEvent,
) -> ChartResult<State<C>> {
    let chart = machine.chart();
    let configuration = chart.configuration_of(&state.value)?;

    let selected = select_transitions(chart, &configuration, &state.context, &event);
    let mut micros = Vec::with_capacity(selected.len());
    for transition in selected {
        // Targetless noop: nothing to exit, nothing to run.
        if transition.targets.is_empty() && transition.actions.is_empty() {
            continue;
        }
        micros.push(plan(chart, &configuration, transition)?);
    }
    let kept = resolve_conflicts(chart, micros);

    if kept.is_empty() {
        return Ok(unchanged(chart, state, event, &configuration));
    }

    // Exit set: union over kept transitions, deepest first.
    let exit_set: HashSet<NodeId> = kept
        .iter()
        .flat_map(|m| m.exit_set.iter().copied())
        .collect();
    let mut exit_order: Vec<NodeId> = exit_set.iter().copied().collect();
    exit_order.sort_by_key(|&node| {
        (usize::MAX - chart.node(node).depth, chart.node(node).order)
    });

    // Record history for every exited state that owns a history child.
    let active: HashSet<NodeId> = configuration.iter().copied().collect();
    let mut history_value = state.history_value.clone();
    for &node in &exit_set {
        let has_history = chart
            .node(node)
            .children
            .iter()
            .any(|&child| matches!(chart.node(child).kind, NodeKind::History(_)));
        if has_history {
            history_value.insert(chart.node(node).id.clone(), chart.value_below(node, &active));
        }
    }

    let mut entry = compute_entry(chart, &kept, &history_value)?;
    entry.retain(|node| !matches!(chart.node(*node).kind, NodeKind::History(_)));
    entry.sort_by_key(|&node| (chart.node(node).depth, chart.node(node).order));
    entry.dedup();

    // Next configuration: survivors plus entered nodes.
    let mut next_configuration: Vec<NodeId> = configuration
        .iter()
        .copied()
        .filter(|node| !exit_set.contains(node))
        .collect();
    for &node in &entry {
        if !next_configuration.contains(&node) {
            next_configuration.push(node);
        }
    }
    next_configuration.sort_by_key(|&node| chart.node(node).order);

    // Stage actions in the §4.3 order: exits, transition actions, entries.
    let mut staged = Vec::new();
    for &node_id in &exit_order {
        let node = chart.node(node_id);
        for action in &node.exit {
            staged.push((node.id.clone(), action.clone()));
        }
        for activity in &node.activities {
            staged.push((node.id.clone(), ActionDef::Stop(activity.clone())));
        }
        for (_, after_name) in &node.delays {
            staged.push((node.id.clone(), ActionDef::Cancel(after_name.clone())));
        }
    }
    for micro in &kept {
        let source = chart.node(micro.transition.source);
        for action in &micro.transition.actions {
            staged.push((source.id.clone(), action.clone()));
        }
    }
    stage_entry_actions(chart, &entry, &mut staged);
    stage_done_events(chart, &entry, &next_configuration, &mut staged);

    let mut context = state.context.clone();
    let mut children = state.children.clone();
    let actions = fold_assigns(staged, &mut context, &mut children, &event.data);

    let value = chart.value_of(&next_configuration);
    let next_events = next_events(chart, &next_configuration);
    let done = chart_done(chart, &next_configuration.iter().copied().collect());

    let value_changed = value != state.value;
    let context_changed = context != state.context;
    let changed = Some(value_changed || !actions.is_empty() || context_changed);

    Ok(State {
        value,
        context,
        event: event.data.clone(),
        scxml_event: event,
        actions,
        children,
        changed,
        history_value,
        history: Some(Box::new(state.history_snapshot())),
        next_events,
        done,
        exited: exit_order
            .iter()
            .map(|&node| chart.node(node).id.clone())
            .collect(),
    })
}

/// The state returned when no transition is enabled: same value and context,
/// `changed == false`.
fn unchanged<C: MachineContext>(
    chart: &Chart<C>,
    state: &State<C>,
    event: ScxmlEvent,
    configuration: &[NodeId],
) -> State<C> {
    State {
        value: state.value.clone(),
        context: state.context.clone(),
        event: event.data.clone(),
        scxml_event: event,
        actions: Vec::new(),
        children: state.children.clone(),
        changed: Some(false),
        history_value: state.history_value.clone(),
        history: Some(Box::new(state.history_snapshot())),
        next_events: next_events(chart, configuration),
        done: state.done,
        exited: Vec::new(),
    }
}

/// Walk each atomic leaf up to the root and keep the first transition whose
/// descriptor matches and whose guard passes. Exact names win over the
/// wildcard within a node; the wildcard never matches the null event.
fn select_transitions<'a, C>(
    chart: &'a Chart<C>,
    configuration: &[NodeId],
    context: &C,
    event: &ScxmlEvent,
) -> Vec<&'a TransitionDef<C>> {
    let mut selected: Vec<&'a TransitionDef<C>> = Vec::new();
    for leaf in chart.leaves(configuration) {
        let mut cursor = Some(leaf);
        'walk: while let Some(node_id) = cursor {
            let node = chart.node(node_id);
            for exact_pass in [true, false] {
                for transition in &node.transitions {
                    let matched = if event.name == NULL_EVENT {
                        exact_pass && transition.event == NULL_EVENT
                    } else if exact_pass {
                        transition.event == event.name
                    } else {
                        transition.event == WILDCARD_EVENT
                    };
                    if !matched {
                        continue;
                    }
                    match guard_passes(transition, context, &event.data) {
                        Ok(false) => continue,
                        Ok(true) => {
                            if !selected.iter().any(|s| std::ptr::eq(*s, transition)) {
                                selected.push(transition);
                            }
                            break 'walk;
                        }
                        Err(message) => {
                            let guard = transition
                                .cond
                                .as_ref()
                                .map(|g| g.name().to_string())
                                .unwrap_or_default();
                            warn!(%guard, %message, event = %event.name, "guard failed; transition not selected");
                            continue;
                        }
                    }
                }
            }
            cursor = node.parent;
        }
    }
    selected
}

fn guard_passes<C>(
    transition: &TransitionDef<C>,
    context: &C,
    event: &Event,
) -> Result<bool, String> {
    match &transition.cond {
        Some(guard) => guard.check(context, event),
        None => Ok(true),
    }
}

/// Resolve targets and compute the exit scope for one selected transition.
fn plan<'a, C>(
    chart: &Chart<C>,
    configuration: &[NodeId],
    transition: &'a TransitionDef<C>,
) -> ChartResult<Micro<'a, C>> {
    let source = transition.source;
    let mut targets = Vec::with_capacity(transition.targets.len());
    for selector in &transition.targets {
        targets.push(chart.resolve(source, selector)?);
    }

    // Targetless, or an explicitly-internal self target: actions run, the
    // source subtree is never escaped.
    let actions_only = targets.is_empty()
        || (transition.internal == Some(true)
            && targets.iter().all(|&target| target == source));
    if actions_only {
        return Ok(Micro {
            transition,
            targets: Vec::new(),
            domain: None,
            exit_set: Vec::new(),
        });
    }

    let all_proper = targets
        .iter()
        .all(|&target| chart.is_proper_descendant(target, source));
    let internal = transition.internal.unwrap_or(all_proper);
    let domain = if internal && all_proper {
        source
    } else {
        let mut scope_set = Vec::with_capacity(targets.len() + 1);
        scope_set.push(source);
        scope_set.extend(targets.iter().copied());
        chart.lcca(&scope_set)
    };
    let exit_set: Vec<NodeId> = configuration
        .iter()
        .copied()
        .filter(|&node| chart.is_proper_descendant(node, domain))
        .collect();
    Ok(Micro {
        transition,
        targets,
        domain: Some(domain),
        exit_set,
    })
}

/// Conflict filter: transitions with overlapping exit sets are resolved in
/// favor of the deeper source, document order breaking ties. The survivors
/// keep their selection order.
fn resolve_conflicts<'a, C>(chart: &Chart<C>, micros: Vec<Micro<'a, C>>) -> Vec<Micro<'a, C>> {
    let mut priority: Vec<usize> = (0..micros.len()).collect();
    priority.sort_by(|&a, &b| {
        let depth_a = chart.node(micros[a].transition.source).depth;
        let depth_b = chart.node(micros[b].transition.source).depth;
        depth_b
            .cmp(&depth_a)
            .then(micros[a].transition.order.cmp(&micros[b].transition.order))
    });

    let mut exited: HashSet<NodeId> = HashSet::new();
    let mut keep = vec![false; micros.len()];
    for index in priority {
        let micro = &micros[index];
        if micro.exit_set.iter().any(|node| exited.contains(node)) {
            continue;
        }
        exited.extend(micro.exit_set.iter().copied());
        keep[index] = true;
    }
    micros
        .into_iter()
        .zip(keep)
        .filter_map(|(micro, keep)| keep.then_some(micro))
        .collect()
}

/// Entry set: per target, ancestors up to the exit scope plus the target and
/// its default descendants; history targets restore the recorded
/// configuration.
fn compute_entry<C>(
    chart: &Chart<C>,
    kept: &[Micro<'_, C>],
    history_value: &HistoryValue,
) -> ChartResult<Vec<NodeId>> {
    let mut entry: Vec<NodeId> = Vec::new();
    for micro in kept {
        let Some(domain) = micro.domain else { continue };
        for &target in &micro.targets {
            if let NodeKind::History(kind) = chart.node(target).kind {
                let Some(parent) = chart.node(target).parent else {
                    return Err(ChartError::InvalidConfig(format!(
                        "history state '{}' has no parent",
                        chart.node(target).id
                    )));
                };
                for ancestor in chart.ancestors_below(parent, domain) {
                    push_unique(&mut entry, ancestor);
                }
                push_unique(&mut entry, parent);
                restore_history(chart, parent, target, kind, history_value, &mut entry)?;
                continue;
            }
            for ancestor in chart.ancestors_below(target, domain) {
                push_unique(&mut entry, ancestor);
            }
            push_unique(&mut entry, target);
        }
    }
    complete_entry(chart, &mut entry)?;
    Ok(entry)
}

/// Default-completion: every entered compound gets exactly one active child
/// (its initial chain when none was targeted), every entered parallel gets
/// all of its regions.
fn complete_entry<C>(chart: &Chart<C>, entry: &mut Vec<NodeId>) -> ChartResult<()> {
    let mut queue: VecDeque<NodeId> = entry.iter().copied().collect();
    while let Some(node_id) = queue.pop_front() {
        match chart.node(node_id).kind {
            NodeKind::Compound => {
                let active: Vec<NodeId> = chart
                    .node(node_id)
                    .children
                    .iter()
                    .copied()
                    .filter(|child| entry.contains(child))
                    .collect();
                match active.len() {
                    0 => {
                        let target = chart.initial_target(node_id)?;
                        for step in chart.ancestors_below(target, node_id) {
                            if push_unique(entry, step) {
                                queue.push_back(step);
                            }
                        }
                        if push_unique(entry, target) {
                            queue.push_back(target);
                        }
                    }
                    1 => {}
                    _ => {
                        return Err(ChartError::NonDeterministicEntry {
                            region: chart.node(node_id).id.clone(),
                            first: chart.node(active[0]).id.clone(),
                            second: chart.node(active[1]).id.clone(),
                        });
                    }
                }
            }
            NodeKind::Parallel => {
                for &region in &chart.node(node_id).children {
                    if matches!(chart.node(region).kind, NodeKind::History(_)) {
                        continue;
                    }
                    if push_unique(entry, region) {
                        queue.push_back(region);
                    }
                }
            }
            NodeKind::Atomic | NodeKind::Final | NodeKind::History(_) => {}
        }
    }
    Ok(())
}

fn restore_history<C>(
    chart: &Chart<C>,
    parent: NodeId,
    history_node: NodeId,
    kind: HistoryKind,
    history_value: &HistoryValue,
    entry: &mut Vec<NodeId>,
) -> ChartResult<()> {
    let parent_id = chart.node(parent).id.clone();
    match history_value.get(&parent_id) {
        Some(recorded) => match kind {
            HistoryKind::Deep => {
                let mut restored = Vec::new();
                chart.walk_value(parent, recorded, &mut restored)?;
                for node in restored {
                    push_unique(entry, node);
                }
                Ok(())
            }
            HistoryKind::Shallow => {
                let keys: Vec<&str> = match recorded {
                    crate::value::StateValue::Leaf(key) => vec![key.as_str()],
                    crate::value::StateValue::Branch(map) => {
                        map.keys().map(String::as_str).collect()
                    }
                };
                for key in keys {
                    let child =
                        chart
                            .child_by_key(parent, key)
                            .ok_or_else(|| ChartError::UnknownState {
                                id: format!("{parent_id}.{key}"),
                            })?;
                    push_unique(entry, child);
                }
                Ok(())
            }
        },
        None => {
            // No recorded history: the history node's default target, else
            // the parent's initial chain via default completion.
            if let Some(selector) = chart.node(history_node).initial.clone() {
                let target = chart.resolve(history_node, &selector)?;
                for ancestor in chart.ancestors_below(target, parent) {
                    push_unique(entry, ancestor);
                }
                push_unique(entry, target);
            }
            Ok(())
        }
    }
}

/// Entry actions, activity starts, and delayed-send scheduling for the
/// entered nodes, shallowest first.
fn stage_entry_actions<C>(
    chart: &Chart<C>,
    entry: &[NodeId],
    staged: &mut Vec<(String, ActionDef<C>)>,
) {
    for &node_id in entry {
        let node = chart.node(node_id);
        for action in &node.entry {
            staged.push((node.id.clone(), action.clone()));
        }
        for activity in &node.activities {
            staged.push((node.id.clone(), ActionDef::Start(activity.clone())));
        }
        for (delay_ms, after_name) in &node.delays {
            staged.push((
                node.id.clone(),
                ActionDef::Send(SendDef {
                    event: Event::new(after_name.clone()),
                    to: None,
                    delay: Some(*delay_ms),
                    id: Some(after_name.clone()),
                }),
            ));
        }
    }
}

/// Raise `done.state.*` for compounds whose final child was entered, and for
/// parallel ancestors whose regions are all final.
fn stage_done_events<C>(
    chart: &Chart<C>,
    entry: &[NodeId],
    configuration: &[NodeId],
    staged: &mut Vec<(String, ActionDef<C>)>,
) {
    let active: HashSet<NodeId> = configuration.iter().copied().collect();
    let mut raised: HashSet<String> = HashSet::new();
    for &node_id in entry {
        if !matches!(chart.node(node_id).kind, NodeKind::Final) {
            continue;
        }
        let Some(parent) = chart.node(node_id).parent else {
            continue;
        };
        if parent != chart.root() {
            let name = done_state_event(&chart.node(parent).id);
            if raised.insert(name.clone()) {
                staged.push((chart.node(parent).id.clone(), ActionDef::Raise(Event::new(name))));
            }
        }
        if let Some(grandparent) = chart.node(parent).parent {
            if grandparent != chart.root()
                && matches!(chart.node(grandparent).kind, NodeKind::Parallel)
                && subtree_done(chart, grandparent, &active)
            {
                let name = done_state_event(&chart.node(grandparent).id);
                if raised.insert(name.clone()) {
                    staged.push((
                        chart.node(grandparent).id.clone(),
                        ActionDef::Raise(Event::new(name)),
                    ));
                }
            }
        }
    }
}

/// Fold assign actions into the context in order; non-assign actions stay in
/// the output list. Actors spawned inside an assign are recorded against the
/// node that ran it.
fn fold_assigns<C: MachineContext>(
    staged: Vec<(String, ActionDef<C>)>,
    context: &mut C,
    children: &mut std::collections::BTreeMap<String, crate::actor::ActorRef>,
    event: &Event,
) -> Vec<ActionDef<C>> {
    let mut spawner = Spawner::default();
    let mut actions = Vec::new();
    for (owner, action) in staged {
        match action {
            ActionDef::Assign {
                update: Some(update),
                ..
            } => {
                *context = update(context, event, &mut spawner);
                for actor in spawner.take() {
                    actor.set_owner(&owner);
                    children.insert(actor.id().to_string(), actor);
                }
            }
            // Rehydrated assigns carry no closure and fold to nothing.
            ActionDef::Assign { update: None, .. } => {}
            other => actions.push(other),
        }
    }
    actions
}

/// Event names on transitions selectable from the configuration, excluding
/// the eventless and wildcard descriptors.
pub(crate) fn next_events<C>(chart: &Chart<C>, configuration: &[NodeId]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut events = Vec::new();
    for &node in configuration {
        for transition in &chart.node(node).transitions {
            let name = &transition.event;
            if name == NULL_EVENT || name == WILDCARD_EVENT {
                continue;
            }
            if seen.insert(name.clone()) {
                events.push(name.clone());
            }
        }
    }
    events
}

/// Whether `node` has run to completion: a compound is done when one of its
/// *direct* final children is active, a parallel when every region is done.
fn subtree_done<C>(chart: &Chart<C>, node: NodeId, active: &HashSet<NodeId>) -> bool {
    match chart.node(node).kind {
        NodeKind::Final => true,
        NodeKind::Compound => chart.node(node).children.iter().any(|&child| {
            active.contains(&child) && matches!(chart.node(child).kind, NodeKind::Final)
        }),
        NodeKind::Parallel => chart
            .node(node)
            .children
            .iter()
            .filter(|&&child| !matches!(chart.node(child).kind, NodeKind::History(_)))
            .all(|&child| subtree_done(chart, child, active)),
        NodeKind::Atomic | NodeKind::History(_) => false,
    }
}

fn chart_done<C>(chart: &Chart<C>, active: &HashSet<NodeId>) -> bool {
    subtree_done(chart, chart.root(), active)
}

/// Exit actions for the entire configuration, deepest first. Used by the
/// interpreter when the service stops.
pub(crate) fn stop_actions<C: MachineContext>(
    machine: &Machine<C>,
    state: &State<C>,
) -> ChartResult<Vec<ActionDef<C>>> {
    let chart = machine.chart();
    let mut configuration = chart.configuration_of(&state.value)?;
    configuration.sort_by_key(|&node| {
        (usize::MAX - chart.node(node).depth, chart.node(node).order)
    });
    let mut actions = Vec::new();
    for node_id in configuration {
        let node = chart.node(node_id);
        actions.extend(node.exit.iter().cloned());
        for activity in &node.activities {
            actions.push(ActionDef::Stop(activity.clone()));
        }
        for (_, after_name) in &node.delays {
            actions.push(ActionDef::Cancel(after_name.clone()));
        }
    }
    Ok(actions)
}

fn push_unique(list: &mut Vec<NodeId>, node: NodeId) -> bool {
    if list.contains(&node) {
        false
    } else {
        list.push(node);
        true
    }
}
