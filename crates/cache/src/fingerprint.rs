//! Signatures for spotting probable duplicate titles.
//!
//! A title's fingerprint is its normalized title plus one `table_id` entry
//! per linked item in every field, unioned over every title reachable
//! through intralinks. Two titles sharing enough entries are probably the
//! same work; the threshold belongs to the caller.

use std::collections::BTreeSet;

use shelfmark_core::MainId;

use crate::cache::Cache;
use crate::error::CacheError;

pub type Fingerprint = BTreeSet<String>;

const ARTICLES: &[&str] = &["the", "a", "an"];

/// Lower-cased, punctuation dropped, whitespace collapsed, leading article
/// removed.
pub fn normalize_title(title: &str) -> String {
    let cleaned = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    if words.len() > 1 && ARTICLES.contains(&words[0]) {
        words.remove(0);
    }
    words.join(" ")
}

pub fn fingerprint(cache: &Cache, id: MainId) -> Result<Fingerprint, CacheError> {
    if !cache.contains_title(id) {
        return Err(CacheError::UnknownTitle(id));
    }
    let mut print = Fingerprint::new();
    let mut visited = BTreeSet::new();
    let mut pending = vec![id];
    while let Some(current) = pending.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(record) = cache.title(current) {
            print.insert(format!("title_{}", normalize_title(&record.title)));
        }
        for table in cache.tables() {
            for item in table.main_links(current) {
                print.insert(format!("{}_{}", table.table(), item.get()));
            }
        }
        pending.extend(cache.intralinks().linked(current));
    }
    Ok(print)
}

pub fn overlap(a: &Fingerprint, b: &Fingerprint) -> usize {
    a.intersection(b).count()
}

/// Jaccard similarity in `[0, 1]`.
pub fn similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    overlap(a, b) as f64 / union as f64
}

/// Other titles whose similarity to `id` reaches `threshold`, most similar
/// first.
pub fn probable_duplicates(
    cache: &Cache,
    id: MainId,
    threshold: f64,
) -> Result<Vec<(MainId, f64)>, CacheError> {
    let target = fingerprint(cache, id)?;
    let mut matches = Vec::new();
    for other in cache.all_title_ids() {
        if other == id {
            continue;
        }
        let score = similarity(&target, &fingerprint(cache, other)?);
        if score >= threshold {
            matches.push((other, score));
        }
    }
    matches.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_articles_and_punctuation() {
        assert_eq!(
            normalize_title("The Hobbit, or There and Back Again"),
            "hobbit or there and back again"
        );
        assert_eq!(normalize_title("  A  Game of   Thrones! "), "game of thrones");
        assert_eq!(normalize_title("The"), "the");
    }

    #[test]
    fn similarity_is_jaccard() {
        let a: Fingerprint = ["title_x", "tags_1", "tags_2"].map(String::from).into();
        let b: Fingerprint = ["title_x", "tags_1", "tags_3"].map(String::from).into();
        assert_eq!(overlap(&a, &b), 2);
        assert!((similarity(&a, &b) - 0.5).abs() < f64::EPSILON);
        assert_eq!(similarity(&Fingerprint::new(), &Fingerprint::new()), 0.0);
    }
}
