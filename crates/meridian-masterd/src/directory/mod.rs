//! The topic directory: a tree of hierarchically-named topics and their
//! registered publishers and subscribers.
//!
//! Paths are `/`-separated; interior segments name directories, the final
//! segment names the topic. Directories and topics are created on first
//! use, by a plain recursive walk. The tree itself is not synchronized —
//! the broker keeps it behind one async mutex, since every mutation is a
//! short tree walk.

use std::fmt;

use meridian_core::protocol::TopicKind;

/// Identifier the broker assigns to each admitted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A publisher or subscriber endpoint registered on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registrar {
    /// Name the owning node gave this endpoint.
    pub name: String,
    /// Address peers use to reach the endpoint directly.
    pub addr: String,
    /// The node that registered it.
    pub node: NodeId,
}

/// A leaf of the tree: a topic with its registrar sets.
#[derive(Debug, Default)]
pub struct Topic {
    name: String,
    publishers: Vec<Registrar>,
    subscribers: Vec<Registrar>,
}

impl Topic {
    /// Registrars publishing to this topic.
    pub fn publishers(&self) -> &[Registrar] {
        &self.publishers
    }

    /// Registrars subscribed to this topic.
    pub fn subscribers(&self) -> &[Registrar] {
        &self.subscribers
    }

    fn side(&self, kind: TopicKind) -> &Vec<Registrar> {
        match kind {
            TopicKind::Publish => &self.publishers,
            TopicKind::Subscribe => &self.subscribers,
        }
    }

    fn side_mut(&mut self, kind: TopicKind) -> &mut Vec<Registrar> {
        match kind {
            TopicKind::Publish => &mut self.publishers,
            TopicKind::Subscribe => &mut self.subscribers,
        }
    }
}

/// An interior tree node: a directory of subdirectories and topics.
#[derive(Debug, Default)]
struct Dir {
    name: String,
    subdirs: Vec<Dir>,
    topics: Vec<Topic>,
}

impl Dir {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Outcome of applying a registration to the tree, with enough context for
/// the caller to fan out update notifications.
#[derive(Debug)]
pub struct RegistrationEffect {
    /// Whether the tree actually changed.
    pub changed: bool,
    /// The opposite side of the topic: subscribers when a publisher was
    /// (de)registered and vice versa. These are the parties to notify.
    pub counterparts: Vec<Registrar>,
}

/// The hierarchical topic namespace.
#[derive(Debug, Default)]
pub struct TopicTree {
    root: Dir,
}

impl TopicTree {
    /// An empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a topic path on `/`, dropping empty segments (so leading and
    /// doubled slashes are tolerated).
    #[must_use]
    pub fn tokenize(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Register `registrar` on the `kind` side of the topic at `path`,
    /// creating directories and the topic as needed.
    ///
    /// Registering the same (name, node) pair twice is a no-op reported via
    /// [`RegistrationEffect::changed`].
    pub fn register(
        &mut self,
        path: &str,
        kind: TopicKind,
        registrar: Registrar,
    ) -> RegistrationEffect {
        let Some((topic_name, dirs)) = Self::tokenize(path).split_last().map(|(t, d)| (*t, d.to_vec()))
        else {
            return RegistrationEffect {
                changed: false,
                counterparts: Vec::new(),
            };
        };
        let dir = dir_mut(&mut self.root, &dirs);
        let topic = topic_mut(dir, topic_name);

        let side = topic.side_mut(kind);
        let changed = !side
            .iter()
            .any(|r| r.name == registrar.name && r.node == registrar.node);
        if changed {
            side.push(registrar);
        }
        RegistrationEffect {
            changed,
            counterparts: topic.side(kind.opposite()).to_vec(),
        }
    }

    /// Remove the registrar named `name` owned by `node` from the `kind`
    /// side of the topic at `path`.
    pub fn deregister(
        &mut self,
        path: &str,
        kind: TopicKind,
        name: &[u8],
        node: NodeId,
    ) -> RegistrationEffect {
        let Some(topic) = self.topic_at_mut(path) else {
            return RegistrationEffect {
                changed: false,
                counterparts: Vec::new(),
            };
        };
        let side = topic.side_mut(kind);
        let before = side.len();
        side.retain(|r| !(r.name.as_bytes() == name && r.node == node));
        let changed = side.len() != before;
        RegistrationEffect {
            changed,
            counterparts: topic.side(kind.opposite()).to_vec(),
        }
    }

    /// Remove every registrar `node` owns, anywhere in the tree. Returns
    /// the removed registrars along with the topic they sat on and their
    /// side, so the caller can notify counterparts.
    pub fn deregister_node(&mut self, node: NodeId) -> Vec<(String, TopicKind, Registrar)> {
        let mut removed = Vec::new();
        prune_node(&mut self.root, node, &mut String::new(), &mut removed);
        removed
    }

    /// Look up the topic at `path`, if it exists.
    #[must_use]
    pub fn topic_at(&self, path: &str) -> Option<&Topic> {
        let segments = Self::tokenize(path);
        let (topic_name, dirs) = segments.split_last()?;
        let mut dir = &self.root;
        for segment in dirs {
            dir = dir.subdirs.iter().find(|d| d.name == *segment)?;
        }
        dir.topics.iter().find(|t| t.name == *topic_name)
    }

    fn topic_at_mut(&mut self, path: &str) -> Option<&mut Topic> {
        let segments = Self::tokenize(path);
        let (topic_name, dirs) = segments.split_last()?;
        let mut dir = &mut self.root;
        for segment in dirs {
            dir = dir.subdirs.iter_mut().find(|d| d.name == *segment)?;
        }
        dir.topics.iter_mut().find(|t| t.name == *topic_name)
    }
}

/// Walk to the directory named by `segments`, creating missing levels.
fn dir_mut<'a>(dir: &'a mut Dir, segments: &[&str]) -> &'a mut Dir {
    match segments.split_first() {
        None => dir,
        Some((head, tail)) => {
            let idx = match dir.subdirs.iter().position(|d| d.name == *head) {
                Some(idx) => idx,
                None => {
                    dir.subdirs.push(Dir::named(head));
                    dir.subdirs.len() - 1
                }
            };
            dir_mut(&mut dir.subdirs[idx], tail)
        }
    }
}

/// Find or create the topic named `name` in `dir`.
fn topic_mut<'a>(dir: &'a mut Dir, name: &str) -> &'a mut Topic {
    let idx = match dir.topics.iter().position(|t| t.name == name) {
        Some(idx) => idx,
        None => {
            dir.topics.push(Topic {
                name: name.to_string(),
                ..Topic::default()
            });
            dir.topics.len() - 1
        }
    };
    &mut dir.topics[idx]
}

fn prune_node(
    dir: &mut Dir,
    node: NodeId,
    path: &mut String,
    removed: &mut Vec<(String, TopicKind, Registrar)>,
) {
    for topic in &mut dir.topics {
        let topic_path = format!("{path}/{}", topic.name);
        for kind in [TopicKind::Publish, TopicKind::Subscribe] {
            let side = topic.side_mut(kind);
            let mut kept = Vec::with_capacity(side.len());
            for registrar in side.drain(..) {
                if registrar.node == node {
                    removed.push((topic_path.clone(), kind, registrar));
                } else {
                    kept.push(registrar);
                }
            }
            *side = kept;
        }
    }
    for subdir in &mut dir.subdirs {
        let len = path.len();
        path.push('/');
        path.push_str(&subdir.name);
        prune_node(subdir, node, path, removed);
        path.truncate(len);
    }
}

/// The opposite side of a topic relation.
trait Opposite {
    fn opposite(self) -> Self;
}

impl Opposite for TopicKind {
    fn opposite(self) -> Self {
        match self {
            Self::Publish => Self::Subscribe,
            Self::Subscribe => Self::Publish,
        }
    }
}
