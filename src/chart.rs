//! Immutable chart model
//!
//! The chart is parsed once at machine construction into an arena of
//! [`StateNode`]s indexed by [`NodeId`]. Each node memoizes its absolute id,
//! path, depth, and document order so the engine's exit/entry set computation
//! stays O(depth). Transition targets are kept as raw selectors and resolved
//! lazily, which is what lets an unknown target surface as
//! [`ChartError::UnknownState`] from `transition` rather than at build time.

use std::collections::HashMap;

use crate::action::{ActionDef, Guard};
use crate::builder::{ConfigKind, StateConfig, TransitionConfig};
use crate::error::{ChartError, ChartResult};
use crate::event::after_event;

/// Index of a state node in the chart arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryKind {
    Shallow,
    Deep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History(HistoryKind),
}

impl NodeKind {
    /// A node the configuration can terminate at.
    pub fn is_leaf(self) -> bool {
        matches!(self, NodeKind::Atomic | NodeKind::Final)
    }
}

/// A transition owned by its source node.
pub struct TransitionDef<C> {
    /// Event descriptor: literal name, `"*"`, or `""` for eventless.
    pub event: String,
    pub source: NodeId,
    /// Raw target selectors; empty for targetless transitions.
    pub targets: Vec<String>,
    pub cond: Option<Guard<C>>,
    pub actions: Vec<ActionDef<C>>,
    /// Explicit internal flag; `None` infers the default (internal iff
    /// targetless or all targets are proper descendants of the source).
    pub internal: Option<bool>,
    /// Global document order, for conflict tiebreaks.
    pub order: usize,
}

/// A node of the chart tree.
pub struct StateNode<C> {
    /// Absolute dotted id, machine id included (`"light.two.deep"`).
    pub id: String,
    /// Last segment of the id.
    pub key: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Initial child selector for compound nodes; default child for history
    /// nodes.
    pub initial: Option<String>,
    pub depth: usize,
    /// Document order (pre-order position).
    pub order: usize,
    pub transitions: Vec<TransitionDef<C>>,
    pub entry: Vec<ActionDef<C>>,
    pub exit: Vec<ActionDef<C>>,
    /// Delays (ms) scheduled on entry, keyed by their `xstate.after` event
    /// name.
    pub delays: Vec<(u64, String)>,
    /// Activities started on entry and stopped on exit.
    pub activities: Vec<String>,
}

/// The parsed, immutable chart.
pub struct Chart<C> {
    pub machine_id: String,
    nodes: Vec<StateNode<C>>,
    root: NodeId,
    ids: HashMap<String, NodeId>,
}

impl<C> Chart<C> {
    pub(crate) fn build(machine_id: String, config: StateConfig<C>) -> ChartResult<Self> {
        let mut chart = Chart {
            machine_id: machine_id.clone(),
            nodes: Vec::new(),
            root: NodeId(0),
            ids: HashMap::new(),
        };
        let mut transition_order = 0usize;
        chart.insert(None, machine_id, config, &mut transition_order)?;
        chart.validate()?;
        Ok(chart)
    }

    fn insert(
        &mut self,
        parent: Option<NodeId>,
        key: String,
        config: StateConfig<C>,
        transition_order: &mut usize,
    ) -> ChartResult<NodeId> {
        let (id, depth) = match parent {
            Some(parent) => {
                let parent = self.node(parent);
                (format!("{}.{}", parent.id, key), parent.depth + 1)
            }
            None => (key.clone(), 0),
        };
        let kind = match config.kind {
            ConfigKind::Parallel => NodeKind::Parallel,
            ConfigKind::Final => NodeKind::Final,
            ConfigKind::History(history) => NodeKind::History(history),
            ConfigKind::Default => {
                if config.states.is_empty() {
                    NodeKind::Atomic
                } else {
                    NodeKind::Compound
                }
            }
        };

        let node_id = NodeId(self.nodes.len());
        let order = self.nodes.len();
        let mut transitions = Vec::new();
        for (event, configs) in config.on {
            for transition in configs {
                transitions.push(Self::lower_transition(
                    event.clone(),
                    node_id,
                    transition,
                    transition_order,
                ));
            }
        }
        let mut delays = Vec::new();
        for (delay_ms, transition) in config.after {
            let event = after_event(delay_ms, &id);
            delays.push((delay_ms, event.clone()));
            transitions.push(Self::lower_transition(
                event,
                node_id,
                transition,
                transition_order,
            ));
        }
        for transition in config.on_done {
            transitions.push(Self::lower_transition(
                crate::event::done_state_event(&id),
                node_id,
                transition,
                transition_order,
            ));
        }

        self.ids.insert(id.clone(), node_id);
        self.nodes.push(StateNode {
            id,
            key,
            kind,
            parent,
            children: Vec::new(),
            initial: config.initial,
            depth,
            order,
            transitions,
            entry: config.entry,
            exit: config.exit,
            delays,
            activities: config.activities,
        });

        for (child_key, child_config) in config.states {
            let child = self.insert(Some(node_id), child_key, child_config, transition_order)?;
            self.nodes[node_id.0].children.push(child);
        }
        Ok(node_id)
    }

    fn lower_transition(
        event: String,
        source: NodeId,
        config: TransitionConfig<C>,
        order: &mut usize,
    ) -> TransitionDef<C> {
        let transition = TransitionDef {
            event,
            source,
            targets: config.targets,
            cond: config.cond,
            actions: config.actions,
            internal: config.internal,
            order: *order,
        };
        *order += 1;
        transition
    }

    /// Structural invariants, checked once at construction.
    fn validate(&self) -> ChartResult<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            let node_id = NodeId(index);
            match node.kind {
                NodeKind::Compound => {
                    if node.children.is_empty() {
                        return Err(ChartError::InvalidConfig(format!(
                            "compound state '{}' has no children",
                            node.id
                        )));
                    }
                    let initial = self.initial_target(node_id)?;
                    if !self.is_proper_descendant(initial, node_id) {
                        return Err(ChartError::InitialCycle {
                            id: node.id.clone(),
                        });
                    }
                }
                NodeKind::Parallel => {
                    let regions = node
                        .children
                        .iter()
                        .filter(|&&child| !matches!(self.node(child).kind, NodeKind::History(_)))
                        .count();
                    if regions < 2 {
                        return Err(ChartError::InvalidConfig(format!(
                            "parallel state '{}' needs at least two regions",
                            node.id
                        )));
                    }
                }
                NodeKind::Atomic | NodeKind::Final => {
                    if !node.children.is_empty() {
                        return Err(ChartError::InvalidConfig(format!(
                            "'{}' cannot have children",
                            node.id
                        )));
                    }
                }
                NodeKind::History(_) => {
                    let parent_is_compound = node
                        .parent
                        .map(|p| matches!(self.node(p).kind, NodeKind::Compound | NodeKind::Parallel))
                        .unwrap_or(false);
                    if !parent_is_compound {
                        return Err(ChartError::InvalidConfig(format!(
                            "history state '{}' must live inside a compound state",
                            node.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a compound node's `initial` selector (default: first
    /// non-history child): a child key, a dotted descendant path, or a `#id`
    /// reference. The non-descendant case is rejected as `InitialCycle` by
    /// `validate`.
    pub(crate) fn initial_target(&self, compound: NodeId) -> ChartResult<NodeId> {
        let node = self.node(compound);
        let selector = match &node.initial {
            Some(selector) if selector.starts_with('#') => {
                return self.get_by_id(selector);
            }
            Some(selector) => selector.clone(),
            None => {
                let first = node
                    .children
                    .iter()
                    .find(|&&child| !matches!(self.node(child).kind, NodeKind::History(_)))
                    .copied()
                    .ok_or_else(|| {
                        ChartError::InvalidConfig(format!("'{}' has no entrable child", node.id))
                    })?;
                return Ok(first);
            }
        };
        let mut current = compound;
        for segment in selector.split('.') {
            current = self.child_by_key(current, segment).ok_or_else(|| {
                ChartError::UnknownState {
                    id: format!("{}.{}", self.node(compound).id, selector),
                }
            })?;
        }
        Ok(current)
    }

    pub(crate) fn node(&self, id: NodeId) -> &StateNode<C> {
        &self.nodes[id.0]
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn lookup_id(&self, id: &str) -> Option<NodeId> {
        self.ids.get(id).copied()
    }

    pub(crate) fn child_by_key(&self, parent: NodeId, key: &str) -> Option<NodeId> {
        self.node(parent)
            .children
            .iter()
            .copied()
            .find(|&child| self.node(child).key == key)
    }

    /// Ancestors from parent up to and including the root.
    pub(crate) fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.node(id).parent;
        while let Some(node) = current {
            out.push(node);
            current = self.node(node).parent;
        }
        out
    }

    /// True iff `node` is a proper descendant of `ancestor`.
    pub(crate) fn is_proper_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.node(node).parent;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.node(parent).parent;
        }
        false
    }

}

impl<C> std::fmt::Debug for Chart<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chart")
            .field("machine_id", &self.machine_id)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
