//! State reference resolution
//!
//! Selectors come in four shapes: `""`/`"."` (the source itself), a leading
//! `.` (descendant by dotted path), a leading `#` (absolute node id), or a
//! sibling key resolved within the source's parent. The resolver also maps
//! between [`StateValue`] shapes and node configurations, expanding truncated
//! values through each compound's `initial` chain, and computes the LCCA that
//! scopes external transitions.

use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::chart::{Chart, NodeId, NodeKind};
use crate::error::{ChartError, ChartResult};
use crate::value::StateValue;

impl<C> Chart<C> {
    /// Strict lookup by absolute id (`"light.two.deep"`), with or without a
    /// leading `#`.
    pub(crate) fn get_by_id(&self, id: &str) -> ChartResult<NodeId> {
        let bare = id.strip_prefix('#').unwrap_or(id);
        self.lookup_id(bare)
            .or_else(|| self.lookup_id(&format!("{}.{}", self.machine_id, bare)))
            .ok_or_else(|| ChartError::UnknownState { id: id.to_string() })
    }

    /// Resolve a transition target selector against its source node.
    pub(crate) fn resolve(&self, source: NodeId, selector: &str) -> ChartResult<NodeId> {
        if selector.is_empty() || selector == "." {
            return Ok(source);
        }
        if let Some(descendant) = selector.strip_prefix('.') {
            return self.descend(source, descendant, selector);
        }
        if selector.starts_with('#') {
            return self.get_by_id(selector);
        }
        // Sibling form: resolve within the source's parent (the source
        // itself when it is the root).
        let scope = self.node(source).parent.unwrap_or(source);
        match self.descend(scope, selector, selector) {
            Ok(found) => Ok(found),
            // Fall back to an absolute id so chart-wide targets stay usable
            // from deep sources.
            Err(not_sibling) => self.get_by_id(selector).map_err(|_| not_sibling),
        }
    }

    fn descend(&self, from: NodeId, path: &str, selector: &str) -> ChartResult<NodeId> {
        let mut current = from;
        for segment in path.split('.') {
            current = self
                .child_by_key(current, segment)
                .ok_or_else(|| ChartError::UnknownState {
                    id: selector.to_string(),
                })?;
        }
        Ok(current)
    }

    /// Least common compound ancestor: the lowest non-parallel ancestor that
    /// contains every input as a proper descendant. Falls back to the root.
    pub(crate) fn lcca(&self, nodes: &[NodeId]) -> NodeId {
        let Some(&first) = nodes.first() else {
            return self.root();
        };
        for ancestor in self.ancestors(first) {
            let compound = matches!(self.node(ancestor).kind, NodeKind::Compound)
                || ancestor == self.root();
            if compound
                && nodes
                    .iter()
                    .all(|&node| self.is_proper_descendant(node, ancestor))
            {
                return ancestor;
            }
        }
        self.root()
    }

    /// Nodes strictly between `stop` (exclusive) and `node` (exclusive),
    /// ordered top-down.
    pub(crate) fn ancestors_below(&self, node: NodeId, stop: NodeId) -> Vec<NodeId> {
        let mut chain: Vec<NodeId> = self
            .ancestors(node)
            .into_iter()
            .take_while(|&ancestor| ancestor != stop)
            .collect();
        chain.reverse();
        chain
    }

    /// The full configuration for a state value: every active atomic state
    /// plus all of its ancestors, in document order. Truncated values are
    /// expanded through `initial` defaults.
    pub(crate) fn configuration_of(&self, value: &StateValue) -> ChartResult<Vec<NodeId>> {
        let mut set = Vec::new();
        self.walk_value(self.root(), value, &mut set)?;
        set.sort_by_key(|&node| self.node(node).order);
        set.dedup();
        Ok(set)
    }

    pub(crate) fn walk_value(
        &self,
        node: NodeId,
        below: &StateValue,
        out: &mut Vec<NodeId>,
    ) -> ChartResult<()> {
        out.push(node);
        match (self.node(node).kind, below) {
            (NodeKind::Atomic | NodeKind::Final, StateValue::Branch(children))
                if children.is_empty() =>
            {
                Ok(())
            }
            (NodeKind::Compound, StateValue::Leaf(key)) => {
                let child = self.require_child(node, key)?;
                self.enter_defaults(child, out)
            }
            (NodeKind::Compound, StateValue::Branch(children)) => {
                let mut entries = children.iter();
                let (key, sub) = entries.next().ok_or_else(|| ChartError::UnknownState {
                    id: format!("{}.<empty>", self.node(node).id),
                })?;
                if entries.next().is_some() {
                    return Err(ChartError::InvalidConfig(format!(
                        "compound '{}' cannot hold more than one active child",
                        self.node(node).id
                    )));
                }
                let child = self.require_child(node, key)?;
                self.walk_value(child, sub, out)
            }
            (NodeKind::Parallel, StateValue::Branch(regions)) => {
                for key in regions.keys() {
                    if self.child_by_key(node, key).is_none() {
                        return Err(ChartError::UnknownState {
                            id: format!("{}.{}", self.node(node).id, key),
                        });
                    }
                }
                for &region in &self.node(node).children {
                    if matches!(self.node(region).kind, NodeKind::History(_)) {
                        continue;
                    }
                    match regions.get(&self.node(region).key) {
                        Some(sub) => self.walk_value(region, sub, out)?,
                        None => self.enter_defaults(region, out)?,
                    }
                }
                Ok(())
            }
            (kind, value) => Err(ChartError::InvalidConfig(format!(
                "value '{value}' does not fit state '{}' ({kind:?})",
                self.node(node).id
            ))),
        }
    }

    fn require_child(&self, parent: NodeId, key: &str) -> ChartResult<NodeId> {
        self.child_by_key(parent, key)
            .ok_or_else(|| ChartError::UnknownState {
                id: format!("{}.{}", self.node(parent).id, key),
            })
    }

    /// Expand the default (initial) configuration below a node, pushing the
    /// node itself and every entered descendant.
    pub(crate) fn enter_defaults(&self, node: NodeId, out: &mut Vec<NodeId>) -> ChartResult<()> {
        out.push(node);
        match self.node(node).kind {
            NodeKind::Atomic | NodeKind::Final => Ok(()),
            NodeKind::Compound => {
                let target = self.initial_target(node)?;
                for step in self.ancestors_below(target, node) {
                    out.push(step);
                }
                self.enter_defaults(target, out)
            }
            NodeKind::Parallel => {
                for &region in &self.node(node).children {
                    if matches!(self.node(region).kind, NodeKind::History(_)) {
                        continue;
                    }
                    self.enter_defaults(region, out)?;
                }
                Ok(())
            }
            NodeKind::History(_) => Err(ChartError::InvalidConfig(format!(
                "history state '{}' cannot be entered as a default",
                self.node(node).id
            ))),
        }
    }

    /// The state value for a configuration set.
    pub(crate) fn value_of(&self, configuration: &[NodeId]) -> StateValue {
        let active: HashSet<NodeId> = configuration.iter().copied().collect();
        self.value_below(self.root(), &active)
    }

    pub(crate) fn value_below(&self, node: NodeId, active: &HashSet<NodeId>) -> StateValue {
        match self.node(node).kind {
            NodeKind::Compound => {
                let child = self
                    .node(node)
                    .children
                    .iter()
                    .copied()
                    .find(|child| active.contains(child));
                match child {
                    Some(child) if self.node(child).children.is_empty() => {
                        StateValue::Leaf(self.node(child).key.clone())
                    }
                    Some(child) => {
                        let mut map = BTreeMap::new();
                        map.insert(self.node(child).key.clone(), self.value_below(child, active));
                        StateValue::Branch(map)
                    }
                    None => StateValue::empty(),
                }
            }
            NodeKind::Parallel => {
                let mut map = BTreeMap::new();
                for &region in &self.node(node).children {
                    if matches!(self.node(region).kind, NodeKind::History(_)) {
                        continue;
                    }
                    let value = if self.node(region).children.is_empty() {
                        StateValue::empty()
                    } else {
                        self.value_below(region, active)
                    };
                    map.insert(self.node(region).key.clone(), value);
                }
                StateValue::Branch(map)
            }
            NodeKind::Atomic | NodeKind::Final | NodeKind::History(_) => StateValue::empty(),
        }
    }

    /// Atomic (or final) members of a configuration, document order.
    pub(crate) fn leaves(&self, configuration: &[NodeId]) -> Vec<NodeId> {
        configuration
            .iter()
            .copied()
            .filter(|&node| self.node(node).kind.is_leaf())
            .collect()
    }
}
