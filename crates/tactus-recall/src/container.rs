//! Recall containers and the attach contract.

use crate::ids::{ChannelId, ContainerId, TemplateId, TrackId};
use crate::recall::{PlayContext, RecallLevel, RecallProcessor};

/// The recalls of one attached effect, split into its play and recall
/// halves. Placed and removed as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallContainer {
    pub id: ContainerId,
    pub effect: String,
    pub track: TrackId,
    pub channel: Option<ChannelId>,
    pub play: Vec<TemplateId>,
    pub recall: Vec<TemplateId>,
}

impl RecallContainer {
    /// Every template of the container, recall half first.
    pub fn templates(&self) -> impl Iterator<Item = TemplateId> + '_ {
        self.recall.iter().chain(self.play.iter()).copied()
    }

    pub fn len(&self) -> usize {
        self.play.len() + self.recall.len()
    }

    pub fn is_empty(&self) -> bool {
        self.play.is_empty() && self.recall.is_empty()
    }
}

/// Target of a dependency declared in an [`EffectSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyRef {
    /// A template that is already attached.
    Template(TemplateId),
    /// Another recall of the same spec, by index.
    Local(usize),
}

/// One recall to create when an effect is attached.
#[derive(Clone)]
pub struct RecallSpec {
    pub name: String,
    pub level: RecallLevel,
    pub context: PlayContext,
    pub dependencies: Vec<DependencyRef>,
    pub processor: Box<dyn RecallProcessor>,
}

impl RecallSpec {
    pub fn new(name: impl Into<String>, level: RecallLevel, processor: impl RecallProcessor) -> Self {
        Self {
            name: name.into(),
            level,
            context: PlayContext::Play,
            dependencies: Vec::new(),
            processor: Box::new(processor),
        }
    }

    pub fn in_context(mut self, context: PlayContext) -> Self {
        self.context = context;
        self
    }

    pub fn depends_on(mut self, template: TemplateId) -> Self {
        self.dependencies.push(DependencyRef::Template(template));
        self
    }

    pub fn depends_on_local(mut self, index: usize) -> Self {
        self.dependencies.push(DependencyRef::Local(index));
        self
    }
}

impl std::fmt::Debug for RecallSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecallSpec")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("context", &self.context)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// What an effect bridge hands to the graph to attach an effect.
#[derive(Debug, Clone)]
pub struct EffectSpec {
    pub name: String,
    pub track: TrackId,
    /// `None` attaches to the track as a whole; only track-level recalls are
    /// allowed then.
    pub channel: Option<ChannelId>,
    pub recalls: Vec<RecallSpec>,
}

impl EffectSpec {
    pub fn on_track(name: impl Into<String>, track: TrackId) -> Self {
        Self {
            name: name.into(),
            track,
            channel: None,
            recalls: Vec::new(),
        }
    }

    pub fn on_channel(name: impl Into<String>, track: TrackId, channel: ChannelId) -> Self {
        Self {
            name: name.into(),
            track,
            channel: Some(channel),
            recalls: Vec::new(),
        }
    }

    pub fn with(mut self, recall: RecallSpec) -> Self {
        self.recalls.push(recall);
        self
    }

    /// Adds a recall/play pair at `level`. The play half depends on the
    /// recall half.
    pub fn with_pair(mut self, level: RecallLevel, processor: impl RecallProcessor + Clone) -> Self {
        let recall_index = self.recalls.len();
        let name = format!("{}-{}", self.name, level);
        self.recalls.push(
            RecallSpec::new(name.clone(), level, processor.clone()).in_context(PlayContext::Recall),
        );
        self.recalls
            .push(RecallSpec::new(name, level, processor).depends_on_local(recall_index));
        self
    }
}
