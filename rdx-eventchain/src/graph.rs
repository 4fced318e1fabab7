//! The static tag dependency graph.
//!
//! Built once from the configured tag list and never mutated afterwards. Tag
//! names are resolved to dense [`TagId`] indices here, so the rest of the
//! kernel works on plain adjacency lists instead of looking names up at run
//! time.

use crate::common::TagId;
use crate::config::{PoolSize, TagConfig};
use crate::context::EngineContext;
use crate::error::EngineError;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// One resolved tag.
#[derive(Debug, Clone)]
pub struct TagNode {
    pub id: TagId,
    pub name: String,
    pub pool: PoolSize,
    /// Whether the tag creates candidates before any activation list touches it.
    pub enabled: bool,
    pub creates: Vec<TagId>,
    pub trashes: Vec<TagId>,
    pub activates: Vec<TagId>,
    pub deactivates: Vec<TagId>,
}

/// Immutable map from each tag to its creation, trash and activation sets.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<TagNode>,
    index: HashMap<String, TagId>,
    start: TagId,
    end: Option<TagId>,
}

impl DependencyGraph {
    /// Resolves the tag declarations of `context`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnknownTag`] if any list references an undeclared tag.
    /// - [`EngineError::Configuration`] for duplicate names or a missing start
    ///   or end tag.
    pub fn new(context: &EngineContext) -> Result<Self, EngineError> {
        let config = context.config();
        Self::from_tags(&config.tags, &config.start_tag, config.end_tag.as_deref())
    }

    /// Resolves a bare tag list. Used by [`DependencyGraph::new`].
    pub fn from_tags(
        tags: &[TagConfig],
        start_tag: &str,
        end_tag: Option<&str>,
    ) -> Result<Self, EngineError> {
        if tags.len() > usize::from(u16::MAX) {
            return Err(EngineError::configuration(format!(
                "{} tags declared, at most {} are supported",
                tags.len(),
                u16::MAX
            )));
        }

        let mut index = HashMap::with_capacity(tags.len());
        for (position, tag) in tags.iter().enumerate() {
            let id = TagId(position as u16);
            if index.insert(tag.name.clone(), id).is_some() {
                return Err(EngineError::configuration(format!(
                    "tag '{}' is declared more than once",
                    tag.name
                )));
            }
        }

        let resolve = |owner: &str, list: &'static str, names: &[String]| {
            names
                .iter()
                .map(|name| {
                    index.get(name).copied().ok_or_else(|| EngineError::UnknownTag {
                        owner: owner.to_string(),
                        list,
                        referenced: name.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let mut nodes = Vec::with_capacity(tags.len());
        for (position, tag) in tags.iter().enumerate() {
            nodes.push(TagNode {
                id: TagId(position as u16),
                name: tag.name.clone(),
                pool: tag.pool,
                enabled: tag.enabled,
                creates: resolve(&tag.name, "creates", &tag.creates)?,
                trashes: resolve(&tag.name, "trashes", &tag.trashes)?,
                activates: resolve(&tag.name, "activates", &tag.activates)?,
                deactivates: resolve(&tag.name, "deactivates", &tag.deactivates)?,
            });
        }

        let start = index.get(start_tag).copied().ok_or_else(|| {
            EngineError::configuration(format!("start tag '{start_tag}' is not declared"))
        })?;
        let end = match end_tag {
            Some(name) => Some(index.get(name).copied().ok_or_else(|| {
                EngineError::configuration(format!("end tag '{name}' is not declared"))
            })?),
            None => None,
        };

        let graph = Self {
            nodes,
            index,
            start,
            end,
        };
        if !graph.terminal_reachable() {
            warn!(
                start = start_tag,
                "no tag with an empty creation set is reachable from the start tag"
            );
        }
        debug!(tags = graph.len(), "dependency graph built");
        Ok(graph)
    }

    /// Breadth-first search along creation edges for a tag that creates nothing.
    fn terminal_reachable(&self) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([self.start]);
        seen[self.start.index()] = true;
        while let Some(tag) = queue.pop_front() {
            let node = &self.nodes[tag.index()];
            if node.creates.is_empty() {
                return true;
            }
            for &next in &node.creates {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    queue.push_back(next);
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn start(&self) -> TagId {
        self.start
    }

    pub fn end(&self) -> Option<TagId> {
        self.end
    }

    /// Looks up a tag by name.
    pub fn id(&self, name: &str) -> Option<TagId> {
        self.index.get(name).copied()
    }

    /// Like [`DependencyGraph::id`] but fails for unknown names.
    pub fn require(&self, name: &str) -> Result<TagId, EngineError> {
        self.id(name)
            .ok_or_else(|| EngineError::illegal(format!("tag '{name}' is not part of the graph")))
    }

    /// Panics if `tag` does not come from this graph.
    pub fn node(&self, tag: TagId) -> &TagNode {
        &self.nodes[tag.index()]
    }

    pub fn name(&self, tag: TagId) -> &str {
        &self.node(tag).name
    }

    /// C(t): tags asked for a new candidate after `tag` commits, in declared order.
    pub fn creates(&self, tag: TagId) -> &[TagId] {
        &self.node(tag).creates
    }

    /// T(t): tags whose pending candidates are trashed after `tag` commits.
    pub fn trashes(&self, tag: TagId) -> &[TagId] {
        &self.node(tag).trashes
    }

    pub fn activates(&self, tag: TagId) -> &[TagId] {
        &self.node(tag).activates
    }

    pub fn deactivates(&self, tag: TagId) -> &[TagId] {
        &self.node(tag).deactivates
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TagNode> {
        self.nodes.iter()
    }

    /// Tag names in declaration order, as stored in snapshots.
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.name.clone()).collect()
    }
}
