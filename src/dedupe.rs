//! Near-duplicate removal by title similarity within a (day, kind) bucket.
//! Shared events belong to every day, so they are bucketed by kind alone.
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::config::{Dedupe, SimilarityMetric};
use crate::model::{Day, Event, EventKind};

/// A candidate dropped because it matched an already accepted event.
#[derive(Debug, Clone, PartialEq)]
pub struct Discard {
    pub kept_id: String,
    pub discarded_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub events: Vec<Event>,
    pub discards: Vec<Discard>,
}

fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Similarity in `0.0..=1.0` between two titles.
pub fn similarity(metric: SimilarityMetric, a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    match metric {
        SimilarityMetric::Levenshtein => strsim::normalized_levenshtein(&a, &b),
        SimilarityMetric::JaroWinkler => strsim::jaro_winkler(&a, &b),
        SimilarityMetric::TokenSet => {
            let ta: HashSet<&str> = a.split_whitespace().collect();
            let tb: HashSet<&str> = b.split_whitespace().collect();
            let union = ta.union(&tb).count();
            if union == 0 {
                return 0.0;
            }
            ta.intersection(&tb).count() as f64 / union as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateResolver {
    metric: SimilarityMetric,
    threshold: f64,
}

impl DuplicateResolver {
    pub fn new(metric: SimilarityMetric, threshold: f64) -> Self {
        Self { metric, threshold }
    }

    pub fn from_config(cfg: &Dedupe) -> Self {
        Self::new(cfg.metric, cfg.threshold)
    }

    /// Drop candidates scoring at or above the threshold against an event
    /// already accepted into the same bucket. Events with a numeric id are
    /// considered before synthetic ones; the output keeps the order in which
    /// events were accepted.
    pub fn resolve(&self, events: Vec<Event>) -> Resolution {
        let mut ordered: Vec<Event> = events;
        // Stable, so input order holds within each group.
        ordered.sort_by_key(|e| e.numeric_id().is_none());

        let mut buckets: HashMap<(Option<Day>, EventKind), Vec<usize>> = HashMap::new();
        let mut resolution = Resolution::default();

        for event in ordered {
            let day = (!event.shared).then_some(event.day);
            let bucket = buckets.entry((day, event.kind)).or_default();
            let matched = bucket
                .iter()
                .map(|&i| {
                    let kept: &Event = &resolution.events[i];
                    (i, similarity(self.metric, &kept.title, &event.title))
                })
                .find(|(_, score)| *score >= self.threshold);

            match matched {
                Some((i, score)) => {
                    let kept_id = resolution.events[i].id.clone();
                    warn!(kept = %kept_id, discarded = %event.id, score, "duplicate event dropped");
                    resolution.discards.push(Discard {
                        kept_id,
                        discarded_id: event.id,
                        score,
                    });
                }
                None => {
                    bucket.push(resolution.events.len());
                    resolution.events.push(event);
                }
            }
        }

        info!(
            kept = resolution.events.len(),
            dropped = resolution.discards.len(),
            "duplicates resolved"
        );
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Contact, PublishStatus, TimeOfDay};

    fn event(id: &str, title: &str, day: Day, kind: EventKind) -> Event {
        Event {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            kind,
            day,
            start_time: TimeOfDay::Undetermined,
            end_time: None,
            location: "tbd".into(),
            speaker_name: None,
            organization: None,
            website: None,
            image_ref: None,
            speaker_image_ref: None,
            tags: vec![],
            status: PublishStatus::Published,
            contact: Contact::default(),
            shared: false,
        }
    }

    #[test]
    fn near_identical_titles_collapse() {
        let resolver = DuplicateResolver::new(SimilarityMetric::Levenshtein, 0.9);
        let out = resolver.resolve(vec![
            event("workshop-1", "Initiation à la robotique", Day::Thursday, EventKind::Workshop),
            event("workshop-2", "Initiation a la robotique", Day::Thursday, EventKind::Workshop),
        ]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].id, "workshop-1");
        assert_eq!(out.discards[0].discarded_id, "workshop-2");
        assert!(out.discards[0].score >= 0.9);
    }

    #[test]
    fn below_threshold_both_survive() {
        let resolver = DuplicateResolver::new(SimilarityMetric::Levenshtein, 0.9);
        let out = resolver.resolve(vec![
            event("talk-1", "Robots in class", Day::Friday, EventKind::Talk),
            event("talk-2", "Drones in class", Day::Friday, EventKind::Talk),
        ]);
        assert_eq!(out.events.len(), 2);
        assert!(out.discards.is_empty());
    }

    #[test]
    fn buckets_are_independent() {
        let resolver = DuplicateResolver::new(SimilarityMetric::Levenshtein, 0.9);
        let out = resolver.resolve(vec![
            event("talk-1", "Same title", Day::Friday, EventKind::Talk),
            event("talk-2", "Same title", Day::Thursday, EventKind::Talk),
            event("workshop-3", "Same title", Day::Friday, EventKind::Workshop),
        ]);
        assert_eq!(out.events.len(), 3);
    }

    #[test]
    fn shared_events_ignore_day() {
        let resolver = DuplicateResolver::new(SimilarityMetric::Levenshtein, 0.9);
        let booth = |id: &str, day| Event {
            shared: true,
            ..event(id, "Fablab Namur", day, EventKind::Booth)
        };
        let out = resolver.resolve(vec![
            booth("booth-3", Day::Wednesday),
            booth("booth-7", Day::Thursday),
            event("booth-9", "Fablab Namur", Day::Friday, EventKind::Booth),
        ]);
        let ids: Vec<&str> = out.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["booth-3", "booth-9"]);
        assert_eq!(out.discards[0].discarded_id, "booth-7");
    }

    #[test]
    fn numeric_ids_win_over_synthetic() {
        let resolver = DuplicateResolver::new(SimilarityMetric::Levenshtein, 0.9);
        let out = resolver.resolve(vec![
            event("talk-x", "Keynote", Day::Friday, EventKind::Talk),
            event("talk-8", "Keynote", Day::Friday, EventKind::Talk),
        ]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].id, "talk-8");
        assert_eq!(out.discards[0].discarded_id, "talk-x");
    }

    #[test]
    fn token_set_ignores_word_order() {
        let score = similarity(SimilarityMetric::TokenSet, "Code with blocks", "blocks with CODE");
        assert!((score - 1.0).abs() < f64::EPSILON);
        let partial = similarity(SimilarityMetric::TokenSet, "a b", "a c");
        assert!((partial - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn jaro_winkler_is_available() {
        let score = similarity(SimilarityMetric::JaroWinkler, "Robotique", "robotique ");
        assert!((score - 1.0).abs() < f64::EPSILON);
    }
}
