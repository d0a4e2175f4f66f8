//! Dependency edges, cycle detection and per-invocation resolution.
//!
//! The graph checked for cycles combines two kinds of edges:
//!
//! - explicit: a template's declared [`RecallDependency`] targets
//! - implicit: a chunk recall on a linked channel depends on every chunk
//!   recall of the channel feeding it
//!
//! [`RecallDependency`]: crate::recall::RecallDependency

use crate::error::{RecallError, Result};
use crate::ids::{ChannelId, TemplateId};
use crate::instance::{InstanceKey, RecallInstance};
use crate::recall::{RecallDependency, RecallLevel, RecallTemplate};
use crate::recall_id::RecallId;
use dashmap::DashMap;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shape of one template as far as ordering is concerned.
#[derive(Debug, Clone)]
pub(crate) struct EdgeNode {
    pub level: RecallLevel,
    pub channel: Option<ChannelId>,
    pub deps: Vec<TemplateId>,
}

impl From<&RecallTemplate> for EdgeNode {
    fn from(template: &RecallTemplate) -> Self {
        Self {
            level: template.level,
            channel: template.channel,
            deps: template.dependencies.iter().map(|d| d.target).collect(),
        }
    }
}

/// Combined dependency graph used to reject cycles before mutating.
#[derive(Debug, Default)]
pub(crate) struct EdgeSet {
    nodes: BTreeMap<TemplateId, EdgeNode>,
    links: HashMap<ChannelId, ChannelId>,
}

impl EdgeSet {
    pub(crate) fn new<'a>(
        templates: impl Iterator<Item = &'a RecallTemplate>,
        links: &HashMap<ChannelId, ChannelId>,
    ) -> Self {
        Self {
            nodes: templates.map(|t| (t.id, EdgeNode::from(t))).collect(),
            links: links.clone(),
        }
    }

    pub(crate) fn insert(&mut self, id: TemplateId, node: EdgeNode) {
        self.nodes.insert(id, node);
    }

    pub(crate) fn add_edge(&mut self, from: TemplateId, to: TemplateId) {
        if let Some(node) = self.nodes.get_mut(&from) {
            node.deps.push(to);
        }
    }

    pub(crate) fn set_link(&mut self, channel: ChannelId, upstream: Option<ChannelId>) {
        match upstream {
            Some(up) => self.links.insert(channel, up),
            None => self.links.remove(&channel),
        };
    }

    /// Chunk templates on the channel feeding `channel`.
    pub(crate) fn upstream_chunks(&self, channel: ChannelId) -> Vec<TemplateId> {
        let Some(up) = self.links.get(&channel) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|(_, n)| n.level == RecallLevel::Chunk && n.channel == Some(*up))
            .map(|(id, _)| *id)
            .collect()
    }

    fn edges(&self, id: TemplateId) -> Vec<TemplateId> {
        let Some(node) = self.nodes.get(&id) else {
            return Vec::new();
        };
        let mut edges = node.deps.clone();
        if let (RecallLevel::Chunk, Some(channel)) = (node.level, node.channel) {
            edges.extend(self.upstream_chunks(channel));
        }
        edges
    }

    /// First cycle found, listed from its entry point back to itself.
    pub(crate) fn find_cycle(&self) -> Option<Vec<TemplateId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Closed,
        }

        let mut marks = HashMap::new();
        // Open path, each node with its remaining out-edges
        let mut stack: Vec<(TemplateId, std::vec::IntoIter<TemplateId>)> = Vec::new();

        for &root in self.nodes.keys() {
            if marks.contains_key(&root) {
                continue;
            }
            marks.insert(root, Mark::Open);
            stack.push((root, self.edges(root).into_iter()));

            while let Some((_, edges)) = stack.last_mut() {
                let Some(next) = edges.next() else {
                    if let Some((done, _)) = stack.pop() {
                        marks.insert(done, Mark::Closed);
                    }
                    continue;
                };
                match marks.get(&next) {
                    Some(Mark::Closed) => {}
                    Some(Mark::Open) => {
                        let start = stack.iter().position(|(id, _)| *id == next).unwrap_or(0);
                        let mut path: Vec<_> = stack[start..].iter().map(|(id, _)| *id).collect();
                        path.push(next);
                        return Some(path);
                    }
                    None => {
                        marks.insert(next, Mark::Open);
                        stack.push((next, self.edges(next).into_iter()));
                    }
                }
            }
        }
        None
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.find_cycle() {
            Some(path) => Err(RecallError::CyclicDependency { path }),
            None => Ok(()),
        }
    }
}

/// Rejects a dependency from a recall onto a finer-grained one.
pub(crate) fn check_granularity(
    from_label: &str,
    from: RecallLevel,
    to_label: &str,
    to: RecallLevel,
) -> Result<()> {
    if from.may_depend_on(to) {
        Ok(())
    } else {
        Err(RecallError::InvalidDependency {
            from: from_label.to_string(),
            to: to_label.to_string(),
            reason: format!("a {from} recall cannot wait on a {to} recall"),
        })
    }
}

/// The instance `edge` points at for the invocation `recall_id`.
pub fn resolve_dependency(
    instances: &DashMap<InstanceKey, Arc<RecallInstance>>,
    edge: &RecallDependency,
    recall_id: &RecallId,
) -> Result<Arc<RecallInstance>> {
    let key = InstanceKey {
        template: edge.target,
        invocation: recall_id.id(),
    };
    instances
        .get(&key)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or(RecallError::NotFound {
            template: edge.target,
            invocation: recall_id.id(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(level: RecallLevel, channel: Option<u64>, deps: &[u64]) -> EdgeNode {
        EdgeNode {
            level,
            channel: channel.map(ChannelId),
            deps: deps.iter().copied().map(TemplateId).collect(),
        }
    }

    #[test]
    fn test_three_way_cycle() {
        let mut set = EdgeSet::default();
        set.insert(TemplateId(1), node(RecallLevel::Chunk, Some(1), &[2]));
        set.insert(TemplateId(2), node(RecallLevel::Chunk, Some(1), &[3]));
        set.insert(TemplateId(3), node(RecallLevel::Chunk, Some(1), &[]));
        assert!(set.check().is_ok());

        set.add_edge(TemplateId(3), TemplateId(1));
        assert_eq!(
            set.check().unwrap_err(),
            RecallError::CyclicDependency {
                path: vec![TemplateId(1), TemplateId(2), TemplateId(3), TemplateId(1)]
            }
        );
    }

    #[test]
    fn test_long_chain_checked_without_recursion() {
        const LEN: u64 = 50_000;
        let mut set = EdgeSet::default();
        for id in 1..=LEN {
            let deps: Vec<u64> = if id < LEN { vec![id + 1] } else { Vec::new() };
            set.insert(TemplateId(id), node(RecallLevel::Chunk, Some(1), &deps));
        }
        assert!(set.check().is_ok());

        set.add_edge(TemplateId(LEN), TemplateId(1));
        let Err(RecallError::CyclicDependency { path }) = set.check() else {
            panic!("chain closed into a loop must be rejected");
        };
        assert_eq!(path.len() as u64, LEN + 1);
        assert_eq!(path.first(), path.last());
    }

    #[test]
    fn test_link_adds_implicit_edges() {
        let mut set = EdgeSet::default();
        set.insert(TemplateId(1), node(RecallLevel::Chunk, Some(1), &[]));
        set.insert(TemplateId(2), node(RecallLevel::Chunk, Some(2), &[1]));
        set.set_link(ChannelId(2), Some(ChannelId(1)));
        assert!(set.check().is_ok());
        assert_eq!(set.upstream_chunks(ChannelId(2)), vec![TemplateId(1)]);

        // channel 1 fed by channel 2 closes a loop through template 2
        set.set_link(ChannelId(1), Some(ChannelId(2)));
        assert!(matches!(
            set.check(),
            Err(RecallError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_granularity() {
        assert!(check_granularity("a", RecallLevel::Chunk, "b", RecallLevel::Channel).is_ok());
        let err =
            check_granularity("a", RecallLevel::Track, "b", RecallLevel::Chunk).unwrap_err();
        assert!(matches!(err, RecallError::InvalidDependency { .. }));
    }
}
