use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;

use areg_common::api::SearchFilters;
use areg_common::crypto::Hash;
use areg_common::time::UnixMillis;

use crate::store::{AgentRecord, AgentVersion};

mod worker;

pub use worker::{IndexService, IndexSlot, IndexWriter};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index apply failed: {0}")]
    Apply(String),
    #[error("index queue saturated")]
    Saturated,
    #[error("index queue closed")]
    Closed,
}

/// Searchable projection of one agent record's head version.
#[derive(Clone, Debug)]
pub struct AgentView {
    pub agent_id: Hash,
    pub tenant: String,
    pub publisher: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
    pub security: Vec<String>,
    pub transport: String,
    pub public: bool,
    pub federated_from: Option<Hash>,
    pub updated_at: UnixMillis,
}

impl AgentView {
    pub fn build(record: &AgentRecord, version: &AgentVersion, publisher_name: &str) -> Self {
        let card = &version.card;
        let mut tags: Vec<String> = Vec::new();
        for skill in &card.skills {
            for tag in &skill.tags {
                let tag = tag.to_lowercase();
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        let security = card
            .security_schemes
            .iter()
            .map(|scheme| scheme.type_name().to_string())
            .collect();

        Self {
            agent_id: record.id.clone(),
            tenant: record.tenant.clone(),
            publisher: publisher_name.to_string(),
            name: card.name.clone(),
            description: card.description.clone(),
            version: card.version.clone(),
            tags,
            capabilities: card.capabilities.enabled_flags(),
            security,
            transport: card.interface.preferred_transport.as_str().to_string(),
            public: record.public,
            federated_from: record.federated_from.clone(),
            updated_at: record.updated_at,
        }
    }

    /// Full-text tokens over name, description and skill text.
    fn tokens(&self) -> HashSet<String> {
        let mut tokens = HashSet::new();
        collect_tokens(&self.name, &mut tokens);
        collect_tokens(&self.description, &mut tokens);
        for tag in &self.tags {
            collect_tokens(tag, &mut tokens);
        }
        tokens
    }
}

fn collect_tokens(text: &str, into: &mut HashSet<String>) {
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        into.insert(token.to_lowercase());
    }
}

#[derive(Clone, Debug)]
pub enum IndexJob {
    Upsert(Box<AgentView>),
    Delete(Hash),
}

impl IndexJob {
    pub fn agent_id(&self) -> &Hash {
        match self {
            Self::Upsert(view) => &view.agent_id,
            Self::Delete(id) => id,
        }
    }
}

/// Port consumed by the index workers; the in-process implementation below
/// never fails, but the retry and repair machinery is written against the
/// trait so a remote document index can slot in.
pub trait DocumentIndex: Send + Sync {
    fn apply(&self, job: &IndexJob) -> Result<(), IndexError>;
}

#[derive(Default)]
struct IndexState {
    docs: HashMap<Hash, AgentView>,
    by_term: HashMap<String, HashSet<Hash>>,
    by_tag: HashMap<String, HashSet<Hash>>,
}

impl IndexState {
    fn remove(&mut self, agent_id: &Hash) {
        if let Some(view) = self.docs.remove(agent_id) {
            for token in view.tokens() {
                if let Some(ids) = self.by_term.get_mut(&token) {
                    ids.remove(agent_id);
                    if ids.is_empty() {
                        self.by_term.remove(&token);
                    }
                }
            }
            for tag in &view.tags {
                if let Some(ids) = self.by_tag.get_mut(tag) {
                    ids.remove(agent_id);
                    if ids.is_empty() {
                        self.by_tag.remove(tag);
                    }
                }
            }
        }
    }

    fn insert(&mut self, view: AgentView) {
        let agent_id = view.agent_id.clone();
        self.remove(&agent_id);
        for token in view.tokens() {
            self.by_term.entry(token).or_default().insert(agent_id.clone());
        }
        for tag in &view.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(agent_id.clone());
        }
        self.docs.insert(agent_id, view);
    }
}

/// In-process inverted index. Writes arrive through the worker pool in
/// per-agent FIFO order; reads take the shared lock only long enough to
/// clone the matching views.
pub struct SearchIndex {
    state: RwLock<IndexState>,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, agent_id: &Hash) -> Option<AgentView> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.docs.get(agent_id).cloned())
    }

    /// Execute a query under a visibility predicate. Results are ordered by
    /// relevance, then recency, then id; the total matching count is
    /// returned alongside the requested page.
    pub fn search(
        &self,
        query: Option<&str>,
        filters: &SearchFilters,
        visible: impl Fn(&AgentView) -> bool,
        top: usize,
        skip: usize,
    ) -> (Vec<AgentView>, usize) {
        let Ok(state) = self.state.read() else {
            return (Vec::new(), 0);
        };

        let query_tokens: Vec<String> = query
            .map(|q| {
                let mut tokens = HashSet::new();
                collect_tokens(q, &mut tokens);
                tokens.into_iter().collect()
            })
            .unwrap_or_default();

        let mut scored: Vec<(usize, &AgentView)> = Vec::new();
        for view in state.docs.values() {
            if !matches_filters(view, filters) || !visible(view) {
                continue;
            }
            if query_tokens.is_empty() {
                scored.push((0, view));
                continue;
            }
            let mut score = 0usize;
            for token in &query_tokens {
                if let Some(ids) = state.by_term.get(token) {
                    if ids.contains(&view.agent_id) {
                        score += 1;
                    }
                }
            }
            // Prefix hits on the agent name rank above body matches
            if let Some(q) = query {
                if view.name.to_lowercase().starts_with(&q.to_lowercase()) {
                    score += 2;
                }
            }
            if score > 0 {
                scored.push((score, view));
            }
        }

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.cmp(sa)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| b.agent_id.cmp(&a.agent_id))
        });

        let total = scored.len();
        let page = scored
            .into_iter()
            .skip(skip)
            .take(top)
            .map(|(_, view)| view.clone())
            .collect();
        (page, total)
    }
}

impl DocumentIndex for SearchIndex {
    fn apply(&self, job: &IndexJob) -> Result<(), IndexError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| IndexError::Apply("index lock poisoned".to_string()))?;
        match job {
            IndexJob::Upsert(view) => state.insert(view.as_ref().clone()),
            IndexJob::Delete(agent_id) => state.remove(agent_id),
        }
        Ok(())
    }
}

fn matches_filters(view: &AgentView, filters: &SearchFilters) -> bool {
    if let Some(public) = filters.public {
        if view.public != public {
            return false;
        }
    }
    if let Some(publisher) = &filters.publisher {
        if &view.publisher != publisher {
            return false;
        }
    }
    if let Some(transport) = &filters.transport {
        if &view.transport != transport {
            return false;
        }
    }
    if !filters.tags.is_empty() {
        let any = filters
            .tags
            .iter()
            .any(|tag| view.tags.contains(&tag.to_lowercase()));
        if !any {
            return false;
        }
    }
    if !filters.security.is_empty() {
        let any = filters
            .security
            .iter()
            .any(|scheme| view.security.iter().any(|s| s == scheme));
        if !any {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use areg_common::crypto::hash;

    fn view(name: &str, tags: &[&str], public: bool, updated_at: u64) -> AgentView {
        AgentView {
            agent_id: hash(name.as_bytes()),
            tenant: "tenant-a".to_string(),
            publisher: "acme".to_string(),
            name: name.to_string(),
            description: format!("{name} does things"),
            version: "1.0.0".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            capabilities: vec!["streaming".to_string()],
            security: vec!["oauth2".to_string()],
            transport: "jsonrpc".to_string(),
            public,
            federated_from: None,
            updated_at,
        }
    }

    #[test]
    fn upsert_is_idempotent_by_agent_id() {
        let index = SearchIndex::new();
        let v = view("recipe-agent", &["cooking"], true, 1);
        index.apply(&IndexJob::Upsert(Box::new(v.clone()))).unwrap();
        index.apply(&IndexJob::Upsert(Box::new(v))).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn search_matches_name_and_ranks_prefix_first() {
        let index = SearchIndex::new();
        index
            .apply(&IndexJob::Upsert(Box::new(view(
                "recipe-agent",
                &["cooking"],
                true,
                1,
            ))))
            .unwrap();
        index
            .apply(&IndexJob::Upsert(Box::new(view(
                "meal-planner",
                &["cooking", "recipe"],
                true,
                2,
            ))))
            .unwrap();

        let (results, total) =
            index.search(Some("recipe"), &SearchFilters::default(), |_| true, 10, 0);
        assert_eq!(total, 2);
        assert_eq!(results[0].name, "recipe-agent");
    }

    #[test]
    fn filters_narrow_results() {
        let index = SearchIndex::new();
        index
            .apply(&IndexJob::Upsert(Box::new(view("a", &["x"], true, 1))))
            .unwrap();
        index
            .apply(&IndexJob::Upsert(Box::new(view("b", &["y"], false, 2))))
            .unwrap();

        let filters = SearchFilters {
            tags: vec!["y".to_string()],
            ..Default::default()
        };
        let (results, total) = index.search(None, &filters, |_| true, 10, 0);
        assert_eq!(total, 1);
        assert_eq!(results[0].name, "b");

        let filters = SearchFilters {
            public: Some(true),
            ..Default::default()
        };
        let (results, _) = index.search(None, &filters, |_| true, 10, 0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "a");
    }

    #[test]
    fn delete_removes_postings() {
        let index = SearchIndex::new();
        let v = view("recipe-agent", &["cooking"], true, 1);
        let id = v.agent_id.clone();
        index.apply(&IndexJob::Upsert(Box::new(v))).unwrap();
        index.apply(&IndexJob::Delete(id)).unwrap();
        let (results, total) =
            index.search(Some("recipe"), &SearchFilters::default(), |_| true, 10, 0);
        assert!(results.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn visibility_predicate_is_applied_before_paging() {
        let index = SearchIndex::new();
        for i in 0..5 {
            index
                .apply(&IndexJob::Upsert(Box::new(view(
                    &format!("agent-{i}"),
                    &["t"],
                    i % 2 == 0,
                    i,
                ))))
                .unwrap();
        }
        let (results, total) = index.search(None, &SearchFilters::default(), |v| v.public, 2, 0);
        assert_eq!(total, 3);
        assert_eq!(results.len(), 2);
    }
}
