//! In-memory knowledge and feedback collections with atomic disk snapshots.
//!
//! [`StorageEngine`] is the source of truth while the daemon runs. Every mutation
//! bumps a generation counter; a flush serializes the collections, writes them with
//! [`snapshot::write_atomic`], and marks the generation it captured as persisted.
//! [`Storage`] is the shared handle the rest of the daemon holds.

pub mod snapshot;
pub mod types;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use snapshot::{FeedbackSnapshot, KnowledgeSnapshot, FEEDBACK_FILE, KNOWLEDGE_FILE, SNAPSHOT_VERSION};
pub use types::{
    normalize_domain, FeedbackEntry, KnowledgeEntry, NewKnowledge, Outcome, PatternQuery,
};

/// Storage counters reported by `getStatus`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub knowledge_count: usize,
    pub feedback_count: usize,
    pub domain_count: usize,
    pub approx_bytes: usize,
    pub dirty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_error: Option<String>,
}

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since the last successful flush.
    Clean,
    /// Snapshots were rewritten.
    Written,
}

/// Serialized collections captured under the lock, written outside it.
struct PendingFlush {
    generation: u64,
    knowledge: Vec<u8>,
    feedback: Vec<u8>,
}

pub struct StorageEngine {
    dir: PathBuf,
    knowledge: HashMap<String, KnowledgeEntry>,
    domain_index: BTreeMap<String, BTreeSet<String>>,
    tag_index: HashMap<String, BTreeSet<String>>,
    feedback: Vec<FeedbackEntry>,
    generation: u64,
    flushed_generation: u64,
    last_flush: Option<DateTime<Utc>>,
    last_flush_error: Option<String>,
}

impl StorageEngine {
    /// Open the engine rooted at `dir`, creating the directory and loading any
    /// snapshots. A corrupt snapshot is logged and replaced by empty state.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;

        let mut engine = Self::empty(dir);

        let knowledge_path = engine.dir.join(KNOWLEDGE_FILE);
        let feedback_path = engine.dir.join(FEEDBACK_FILE);
        snapshot::remove_stale_tmp(&knowledge_path);
        snapshot::remove_stale_tmp(&feedback_path);

        match snapshot::read_snapshot::<KnowledgeSnapshot>(&knowledge_path) {
            Ok(Some(snap)) => {
                for entry in snap.entries {
                    engine.index(entry);
                }
            }
            Ok(None) => tracing::debug!(path = %knowledge_path.display(), "no knowledge snapshot, starting empty"),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "knowledge snapshot unreadable, starting empty"),
        }

        match snapshot::read_snapshot::<FeedbackSnapshot>(&feedback_path) {
            Ok(Some(snap)) => engine.feedback = snap.feedback,
            Ok(None) => tracing::debug!(path = %feedback_path.display(), "no feedback snapshot, starting empty"),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "feedback snapshot unreadable, starting empty"),
        }

        tracing::info!(
            dir = %engine.dir.display(),
            knowledge = engine.knowledge.len(),
            feedback = engine.feedback.len(),
            "storage loaded"
        );
        Ok(engine)
    }

    fn empty(dir: PathBuf) -> Self {
        Self {
            dir,
            knowledge: HashMap::new(),
            domain_index: BTreeMap::new(),
            tag_index: HashMap::new(),
            feedback: Vec::new(),
            generation: 0,
            flushed_generation: 0,
            last_flush: None,
            last_flush_error: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_dirty(&self) -> bool {
        self.generation != self.flushed_generation
    }

    fn mark_dirty(&mut self) {
        self.generation += 1;
    }

    fn index(&mut self, entry: KnowledgeEntry) {
        if let Some(previous) = self.knowledge.remove(&entry.id) {
            self.unindex(&previous);
        }
        self.domain_index
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry.id.clone());
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        self.knowledge.insert(entry.id.clone(), entry);
    }

    fn unindex(&mut self, entry: &KnowledgeEntry) {
        if let Some(ids) = self.domain_index.get_mut(&entry.domain) {
            ids.remove(&entry.id);
            if ids.is_empty() {
                self.domain_index.remove(&entry.domain);
            }
        }
        for tag in &entry.tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(&entry.id);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    /// Store a new knowledge entry and return it.
    pub fn store_knowledge(&mut self, new: NewKnowledge) -> Result<KnowledgeEntry> {
        let domain = normalize_domain(&new.domain);
        if domain.is_empty() {
            return Err(anyhow!("domain must contain at least one segment"));
        }
        let quality = new.quality.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&quality) {
            return Err(anyhow!("quality must be between 0.0 and 1.0"));
        }

        let now = Utc::now();
        let entry = KnowledgeEntry {
            id: uuid::Uuid::now_v7().to_string(),
            content: new.content,
            category: new
                .category
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "general".to_string()),
            domain,
            tags: new
                .tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            quality,
            usage_count: 0,
            last_used: now,
            created_at: now,
            metadata: new.metadata,
        };

        self.index(entry.clone());
        self.mark_dirty();
        tracing::debug!(id = %entry.id, domain = %entry.domain, "knowledge stored");
        Ok(entry)
    }

    /// Read one entry by id, recording the read.
    pub fn get_knowledge(&mut self, id: &str) -> Option<KnowledgeEntry> {
        let now = Utc::now();
        let entry = self.knowledge.get_mut(id)?;
        entry.touch(now);
        let entry = entry.clone();
        self.mark_dirty();
        Some(entry)
    }

    /// Entries in `domain` (and nested domains when requested), best quality first.
    pub fn knowledge_by_domain(
        &mut self,
        domain: &str,
        include_subdomains: bool,
        limit: usize,
    ) -> Vec<KnowledgeEntry> {
        let domain = normalize_domain(domain);
        let ids: Vec<String> = self
            .domain_index
            .range(domain.clone()..)
            .take_while(|(key, _)| key.starts_with(domain.as_str()))
            .filter(|(key, _)| types::domain_matches(key, &domain, include_subdomains))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        self.read_ranked(ids, limit)
    }

    /// Entries carrying any (or, with `match_all`, every) tag in `tags`.
    pub fn knowledge_by_tags(
        &mut self,
        tags: &[String],
        match_all: bool,
        limit: usize,
    ) -> Vec<KnowledgeEntry> {
        let wanted: BTreeSet<&str> = tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if wanted.is_empty() {
            return Vec::new();
        }

        let mut candidates: BTreeSet<String> = BTreeSet::new();
        for tag in &wanted {
            if let Some(ids) = self.tag_index.get(*tag) {
                candidates.extend(ids.iter().cloned());
            }
        }
        let ids: Vec<String> = candidates
            .into_iter()
            .filter(|id| {
                !match_all
                    || self
                        .knowledge
                        .get(id)
                        .is_some_and(|e| wanted.iter().all(|t| e.tags.contains(*t)))
            })
            .collect();
        self.read_ranked(ids, limit)
    }

    /// Rank by quality (desc) then creation time, truncate, and record the reads.
    fn read_ranked(&mut self, ids: Vec<String>, limit: usize) -> Vec<KnowledgeEntry> {
        let mut hits: Vec<&KnowledgeEntry> =
            ids.iter().filter_map(|id| self.knowledge.get(id)).collect();
        hits.sort_by(|a, b| {
            b.quality
                .total_cmp(&a.quality)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let selected: Vec<String> = hits.into_iter().take(limit).map(|e| e.id.clone()).collect();
        self.touch_all(&selected)
    }

    fn touch_all(&mut self, ids: &[String]) -> Vec<KnowledgeEntry> {
        if ids.is_empty() {
            return Vec::new();
        }
        let now = Utc::now();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.knowledge.get_mut(id) {
                entry.touch(now);
                out.push(entry.clone());
            }
        }
        self.mark_dirty();
        out
    }

    /// Delete an entry. Returns `false` if it did not exist.
    pub fn delete_knowledge(&mut self, id: &str) -> bool {
        match self.knowledge.remove(id) {
            Some(entry) => {
                self.unindex(&entry);
                self.mark_dirty();
                tracing::debug!(id = %id, "knowledge deleted");
                true
            }
            None => false,
        }
    }

    /// Append a feedback record. Unknown trajectory ids are accepted.
    pub fn append_feedback(
        &mut self,
        trajectory_id: &str,
        quality: f64,
        outcome: Option<Outcome>,
        feedback: Option<String>,
    ) -> Result<FeedbackEntry> {
        if !(0.0..=1.0).contains(&quality) {
            return Err(anyhow!("quality must be between 0.0 and 1.0"));
        }
        let entry = FeedbackEntry {
            id: uuid::Uuid::now_v7().to_string(),
            trajectory_id: trajectory_id.to_string(),
            quality,
            outcome: outcome.unwrap_or_else(|| Outcome::from_quality(quality)),
            feedback,
            timestamp: Utc::now(),
        };
        self.feedback.push(entry.clone());
        self.mark_dirty();
        Ok(entry)
    }

    /// Feedback recorded for one trajectory, oldest first.
    pub fn feedback_for(&self, trajectory_id: &str) -> Vec<&FeedbackEntry> {
        self.feedback
            .iter()
            .filter(|f| f.trajectory_id == trajectory_id)
            .collect()
    }

    /// Term search over content, category and tags.
    ///
    /// Entries are ranked by the number of matched terms, then quality, then usage.
    /// Without a query every entry passing the filters is a candidate.
    pub fn query_patterns(&mut self, query: &PatternQuery) -> Vec<KnowledgeEntry> {
        let terms: Vec<String> = query
            .query
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        let domain = query.domain.as_deref().map(normalize_domain);
        let min_quality = query.min_quality.unwrap_or(0.0);

        let mut scored: Vec<(usize, &KnowledgeEntry)> = self
            .knowledge
            .values()
            .filter(|e| e.quality >= min_quality)
            .filter(|e| domain.as_deref().map_or(true, |d| e.in_domain(d, true)))
            .filter(|e| {
                query
                    .category
                    .as_deref()
                    .map_or(true, |c| e.category.eq_ignore_ascii_case(c))
            })
            .filter_map(|e| {
                if terms.is_empty() {
                    return Some((0, e));
                }
                let haystack = format!(
                    "{} {} {}",
                    e.content.to_lowercase(),
                    e.category.to_lowercase(),
                    e.tags.iter().map(|t| t.to_lowercase()).collect::<Vec<_>>().join(" ")
                );
                let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (hits > 0).then_some((hits, e))
            })
            .collect();

        scored.sort_by(|(ha, a), (hb, b)| {
            hb.cmp(ha)
                .then_with(|| b.quality.total_cmp(&a.quality))
                .then_with(|| b.usage_count.cmp(&a.usage_count))
                .then_with(|| a.id.cmp(&b.id))
        });
        let selected: Vec<String> = scored
            .into_iter()
            .take(query.limit)
            .map(|(_, e)| e.id.clone())
            .collect();
        self.touch_all(&selected)
    }

    pub fn knowledge_len(&self) -> usize {
        self.knowledge.len()
    }

    pub fn feedback_len(&self) -> usize {
        self.feedback.len()
    }

    pub fn approx_bytes(&self) -> usize {
        let knowledge: usize = self.knowledge.values().map(KnowledgeEntry::approx_bytes).sum();
        let feedback: usize = self.feedback.iter().map(FeedbackEntry::approx_bytes).sum();
        knowledge + feedback
    }

    /// Evict up to `count` knowledge entries, least recently used first.
    pub fn evict_least_recent(&mut self, count: usize) -> usize {
        if count == 0 || self.knowledge.is_empty() {
            return 0;
        }
        let mut order: Vec<(&DateTime<Utc>, &DateTime<Utc>, &String)> = self
            .knowledge
            .values()
            .map(|e| (&e.last_used, &e.created_at, &e.id))
            .collect();
        order.sort();
        let victims: Vec<String> = order
            .into_iter()
            .take(count)
            .map(|(_, _, id)| id.clone())
            .collect();

        for id in &victims {
            if let Some(entry) = self.knowledge.remove(id) {
                self.unindex(&entry);
            }
        }
        self.mark_dirty();
        tracing::info!(evicted = victims.len(), remaining = self.knowledge.len(), "knowledge evicted");
        victims.len()
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            knowledge_count: self.knowledge.len(),
            feedback_count: self.feedback.len(),
            domain_count: self.domain_index.len(),
            approx_bytes: self.approx_bytes(),
            dirty: self.is_dirty(),
            last_flush: self.last_flush,
            last_flush_error: self.last_flush_error.clone(),
        }
    }

    fn prepare_flush(&self) -> Result<PendingFlush> {
        let saved_at = Utc::now();
        let mut entries: Vec<KnowledgeEntry> = self.knowledge.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let knowledge = serde_json::to_vec_pretty(&KnowledgeSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at,
            entries,
        })
        .context("failed to serialize knowledge snapshot")?;
        let feedback = serde_json::to_vec_pretty(&FeedbackSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at,
            feedback: self.feedback.clone(),
        })
        .context("failed to serialize feedback snapshot")?;

        Ok(PendingFlush {
            generation: self.generation,
            knowledge,
            feedback,
        })
    }

    fn finish_flush(&mut self, generation: u64, result: &Result<()>) {
        match result {
            Ok(()) => {
                // Mutations made while the files were written keep the engine dirty.
                self.flushed_generation = self.flushed_generation.max(generation);
                self.last_flush = Some(Utc::now());
                self.last_flush_error = None;
            }
            Err(e) => self.last_flush_error = Some(format!("{e:#}")),
        }
    }
}

/// Shared, cloneable handle to the storage engine.
///
/// The engine sits behind a single-writer mutex that is never held across an
/// `.await`. Flushes are serialized by a second lock so two writers never race
/// on the same temp file.
#[derive(Clone)]
pub struct Storage {
    engine: Arc<Mutex<StorageEngine>>,
    flush_lock: Arc<Mutex<()>>,
}

impl Storage {
    pub fn new(engine: StorageEngine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            flush_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(StorageEngine::open(dir)?))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, StorageEngine>> {
        self.engine
            .lock()
            .map_err(|e| anyhow!("storage lock poisoned: {e}"))
    }

    /// Write both snapshots if anything changed since the last flush.
    ///
    /// On failure the engine stays dirty, so the next periodic tick retries.
    pub fn flush(&self) -> Result<FlushOutcome> {
        let _serial = self
            .flush_lock
            .lock()
            .map_err(|e| anyhow!("flush lock poisoned: {e}"))?;

        let (pending, dir) = {
            let engine = self.lock()?;
            if !engine.is_dirty() {
                return Ok(FlushOutcome::Clean);
            }
            (engine.prepare_flush()?, engine.dir.clone())
        };

        let result = snapshot::write_atomic(&dir.join(KNOWLEDGE_FILE), &pending.knowledge)
            .and_then(|()| snapshot::write_atomic(&dir.join(FEEDBACK_FILE), &pending.feedback));

        self.lock()?.finish_flush(pending.generation, &result);
        result?;

        tracing::debug!(generation = pending.generation, "storage flushed");
        Ok(FlushOutcome::Written)
    }

    /// [`Storage::flush`] on the blocking pool.
    pub async fn flush_async(&self) -> Result<FlushOutcome> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.flush())
            .await
            .map_err(|e| anyhow!("flush task failed: {e}"))?
    }

    pub fn stats(&self) -> Result<StorageStats> {
        Ok(self.lock()?.stats())
    }
}
