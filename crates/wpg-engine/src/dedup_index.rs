use std::collections::{HashMap, HashSet};
use wpg_core::{normalize_prompt, normalize_topic, Record};
use wpg_storage::{RecordStore, StorageError};

#[derive(Debug, Default, Clone)]
struct TopicEntries {
    prompts: HashSet<String>,
    images: HashSet<String>,
}

/// Derived per-topic index of prompt keys and image hashes. Never persisted;
/// rebuild it from the store whenever in doubt.
#[derive(Debug, Default, Clone)]
pub struct DedupIndex {
    topics: HashMap<String, TopicEntries>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(store: &RecordStore) -> Result<Self, StorageError> {
        Ok(Self::from_records(&store.list(None)?))
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut index = Self::new();
        for record in records {
            index.insert(record);
        }
        index
    }

    pub fn insert(&mut self, record: &Record) {
        let entries = self
            .topics
            .entry(normalize_topic(&record.topic))
            .or_default();
        entries.prompts.insert(normalize_prompt(&record.prompt));
        entries.images.insert(record.image_hash.clone());
    }

    pub fn is_duplicate_prompt(&self, topic: &str, prompt: &str) -> bool {
        self.topics
            .get(&normalize_topic(topic))
            .is_some_and(|entries| entries.prompts.contains(&normalize_prompt(prompt)))
    }

    pub fn is_duplicate_image(&self, topic: &str, content_hash: &str) -> bool {
        self.topics
            .get(&normalize_topic(topic))
            .is_some_and(|entries| entries.images.contains(content_hash))
    }

    pub fn prompt_count(&self, topic: &str) -> usize {
        self.topics
            .get(&normalize_topic(topic))
            .map(|entries| entries.prompts.len())
            .unwrap_or(0)
    }
}
