//! Derived lookup indices over registry records
//!
//! Indices are rebuilt from records on load and kept in step with every
//! write; they are never persisted.

use super::PluginRecord;
use std::collections::{BTreeMap, BTreeSet};

const EXACT_NAME_SCORE: u32 = 1000;
const NAME_PREFIX_SCORE: u32 = 500;
const NAME_TERM_SCORE: u32 = 10;
const TAG_TERM_SCORE: u32 = 5;
const CATEGORY_TERM_SCORE: u32 = 3;
const DESCRIPTION_TERM_SCORE: u32 = 2;

/// A search result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub plugin_id: String,
    pub score: u32,
}

#[derive(Debug, Default)]
pub(crate) struct Index {
    by_category: BTreeMap<String, BTreeSet<String>>,
    by_tag: BTreeMap<String, BTreeSet<String>>,
}

impl Index {
    pub(crate) fn insert(&mut self, record: &PluginRecord) {
        self.by_category
            .entry(normalize(&record.manifest.category))
            .or_default()
            .insert(record.id.clone());

        for tag in &record.manifest.tags {
            self.by_tag
                .entry(normalize(tag))
                .or_default()
                .insert(record.id.clone());
        }
    }

    pub(crate) fn remove(&mut self, record: &PluginRecord) {
        remove_member(&mut self.by_category, &normalize(&record.manifest.category), &record.id);
        for tag in &record.manifest.tags {
            remove_member(&mut self.by_tag, &normalize(tag), &record.id);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.by_category.clear();
        self.by_tag.clear();
    }

    pub(crate) fn category(&self, category: &str) -> Vec<String> {
        members(&self.by_category, &normalize(category))
    }

    pub(crate) fn tag(&self, tag: &str) -> Vec<String> {
        members(&self.by_tag, &normalize(tag))
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn members(map: &BTreeMap<String, BTreeSet<String>>, key: &str) -> Vec<String> {
    map.get(key)
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default()
}

fn remove_member(map: &mut BTreeMap<String, BTreeSet<String>>, key: &str, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

/// Relevance of a record for a free-text query; zero means no match
pub(crate) fn score(record: &PluginRecord, query: &str) -> u32 {
    let query = normalize(query);
    if query.is_empty() {
        return 0;
    }

    let name = record.manifest.name.to_lowercase();
    let description = record.manifest.description.to_lowercase();
    let category = record.manifest.category.to_lowercase();
    let tags: Vec<String> = record.manifest.tags.iter().map(|t| t.to_lowercase()).collect();

    let mut score = 0;
    if name == query {
        score += EXACT_NAME_SCORE;
    } else if name.starts_with(&query) {
        score += NAME_PREFIX_SCORE;
    }

    for term in query.split_whitespace() {
        if name.contains(term) {
            score += NAME_TERM_SCORE;
        }
        if tags.iter().any(|t| t.contains(term)) {
            score += TAG_TERM_SCORE;
        }
        if category.contains(term) {
            score += CATEGORY_TERM_SCORE;
        }
        if description.contains(term) {
            score += DESCRIPTION_TERM_SCORE;
        }
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::manifest::Manifest;
    use sdk::types::PluginStatus;

    fn record(name: &str, description: &str, tags: &[&str]) -> PluginRecord {
        let mut manifest = Manifest::from_json(r#"{"id": "x"}"#).unwrap();
        manifest.id = name.to_lowercase().replace(' ', "-");
        manifest.name = name.to_string();
        manifest.description = description.to_string();
        manifest.tags = tags.iter().map(|t| t.to_string()).collect();
        PluginRecord::new(manifest, String::new(), PluginStatus::Installed, 0)
    }

    #[test]
    fn test_exact_beats_prefix_beats_terms() {
        let exact = record("Weather", "forecasts", &[]);
        let prefix = record("Weather Radar", "radar maps", &[]);
        let term = record("Radar", "shows weather cells", &["weather"]);

        let e = score(&exact, "weather");
        let p = score(&prefix, "weather");
        let t = score(&term, "weather");
        assert!(e > p && p > t && t > 0);
        assert_eq!(t, TAG_TERM_SCORE + DESCRIPTION_TERM_SCORE);
    }

    #[test]
    fn test_no_match_scores_zero() {
        let r = record("Notes", "take notes", &["text"]);
        assert_eq!(score(&r, "calendar"), 0);
        assert_eq!(score(&r, "   "), 0);
    }

    #[test]
    fn test_index_removal_drops_empty_keys() {
        let r = record("Notes", "", &["Text"]);
        let mut index = Index::default();
        index.insert(&r);
        assert_eq!(index.tag("text"), vec!["notes".to_string()]);

        index.remove(&r);
        assert!(index.by_tag.is_empty());
        assert!(index.by_category.is_empty());
    }
}
