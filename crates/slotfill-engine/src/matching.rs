use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Result};
use serde_json::json;
use slotfill_contracts::config::{FallbackConfig, FallbackStep, ImageConfig, MatchBoosts, MatchWeights};
use slotfill_contracts::events::{payload, EventWriter};
use slotfill_contracts::models::{AnalysisResult, ImageRecord, MatchOrigin, Slot};

use crate::cancel::CancelToken;
use crate::registry::ImageRegistry;
use crate::stock::StockPhotoService;

const STOPWORDS: &[&str] = &[
    "the", "and", "with", "for", "from", "our", "your", "image", "photo", "picture", "showing", "section",
];

/// Relevance of one analyzed image to one slot, 0-100.
pub trait SlotScorer: Send + Sync {
    fn score(&self, slot: &Slot, image: &ImageRecord, analysis: &AnalysisResult) -> u32;
}

/// Weighted overlap of slot words with subjects, tags and description, plus
/// component-appropriate business flags and image quality, plus filename
/// boosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedScorer {
    pub weights: MatchWeights,
    pub boosts: MatchBoosts,
}

impl WeightedScorer {
    pub fn new(weights: MatchWeights, boosts: MatchBoosts) -> Self {
        Self { weights, boosts }
    }

    fn business_ratio(slot: &Slot, analysis: &AnalysisResult) -> f64 {
        let flags = analysis.business_relevance;
        let component = slot.component.to_ascii_lowercase();
        let context = slot.context.to_ascii_lowercase();
        let wants_team = component.contains("team")
            || component.contains("about")
            || ["team", "staff", "crew", "owner"].iter().any(|word| context.contains(word));
        let wants_before_after = component.contains("gallery")
            || context.contains("before")
            || context.contains("after")
            || context.contains("transformation");
        let wants_service = component.contains("service")
            || component.contains("card")
            || component.contains("feature")
            || component.contains("hero");
        let wants_building = component.contains("hero")
            || component.contains("about")
            || ["exterior", "house", "building", "property", "roof"]
                .iter()
                .any(|word| context.contains(word));

        let hit = (wants_team && flags.is_team_photo)
            || (wants_before_after && flags.is_before_after)
            || (wants_service && flags.is_service_action)
            || (wants_building && flags.is_building);
        if hit {
            1.0
        } else if !(wants_team || wants_before_after || wants_service || wants_building) && flags.any() {
            0.5
        } else {
            0.0
        }
    }
}

impl SlotScorer for WeightedScorer {
    fn score(&self, slot: &Slot, image: &ImageRecord, analysis: &AnalysisResult) -> u32 {
        // The component feeds the business flags and the filename boost; the
        // overlap terms only see it when the slot has no context.
        let mut slot_words = words(&slot.context);
        if slot_words.is_empty() {
            slot_words = words(&slot.component);
        }
        let subject_words = words(&analysis.subjects.join(" "));
        let tag_words = words(&analysis.tags.join(" "));
        let description_words = words(&format!("{} {}", analysis.description, analysis.scene));

        let weights = self.weights;
        let total = weights.total();
        let base = if total > 0.0 {
            (weights.subject_match * overlap_ratio(&slot_words, &subject_words)
                + weights.tag_match * overlap_ratio(&slot_words, &tag_words)
                + weights.description_match * overlap_ratio(&slot_words, &description_words)
                + weights.business_relevance * Self::business_ratio(slot, analysis)
                + weights.quality * (f64::from(analysis.quality.min(100)) / 100.0))
                / total
                * 100.0
        } else {
            0.0
        };

        let mut boost = 0.0;
        let wanted_stem = file_stem_lower(&slot.current_path);
        let image_stem = file_stem_lower(&image.filename);
        if !wanted_stem.is_empty() && wanted_stem == image_stem {
            boost += self.boosts.exact_filename_match;
        }
        let component = slot.component.to_ascii_lowercase();
        if !component.is_empty() && words(&image.filename_words()).contains(&component) {
            boost += self.boosts.component_name_match;
        }

        (base + boost).clamp(0.0, 100.0).round() as u32
    }
}

/// Share of the slot's first words found among the image's words; a slot
/// needs at most three hits for a full ratio.
fn overlap_ratio(slot_words: &[String], image_words: &[String]) -> f64 {
    if slot_words.is_empty() || image_words.is_empty() {
        return 0.0;
    }
    let matched = slot_words
        .iter()
        .filter(|word| image_words.iter().any(|candidate| words_match(word, candidate)))
        .count();
    let needed = slot_words.len().clamp(1, 3);
    (matched as f64 / needed as f64).min(1.0)
}

fn words_match(left: &str, right: &str) -> bool {
    if left == right {
        return true;
    }
    // Cheap stemming: "roofs"/"roofing" match "roof".
    let (short, long) = if left.len() <= right.len() { (left, right) } else { (right, left) };
    short.len() >= 4 && long.starts_with(short)
}

fn words(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text
        .to_ascii_lowercase()
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| word.len() >= 3 && !STOPWORDS.contains(word))
    {
        if !out.iter().any(|existing| existing == word) {
            out.push(word.to_string());
        }
    }
    out
}

fn file_stem_lower(path: &str) -> String {
    Path::new(path.split(['?', '#']).next().unwrap_or(""))
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub slot_id: String,
    pub image: String,
    pub score: u32,
    pub origin: MatchOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    Matched(Assignment),
    NoCandidates,
    BelowThreshold { best_image: String, best_score: u32 },
    StockMiss,
    StockFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOutcome {
    pub slot_id: String,
    pub required: bool,
    pub status: SlotStatus,
    /// Unmatched slot left to the renderer's placeholder.
    pub placeholder: bool,
    pub warning: Option<String>,
}

impl SlotOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self.status, SlotStatus::Matched(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchRun {
    pub assignments: Vec<Assignment>,
    pub outcomes: Vec<SlotOutcome>,
    pub cancelled: bool,
}

impl MatchRun {
    pub fn unmatched_required(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.required && !outcome.is_matched())
            .map(|outcome| outcome.slot_id.as_str())
            .collect()
    }
}

/// Assigns images to unmatched slots: required slots first, each image used
/// by at most one slot, best score wins (first candidate on ties), scores
/// under the threshold rejected, then stock escalation for what is left.
pub struct MatchingEngine {
    scorer: Box<dyn SlotScorer>,
    min_relevance: u32,
    stock_relevance: u32,
    fallback: Vec<FallbackStep>,
    events: EventWriter,
}

impl MatchingEngine {
    pub fn new(scorer: Box<dyn SlotScorer>, min_relevance: u32) -> Self {
        Self {
            scorer,
            min_relevance,
            stock_relevance: 75,
            fallback: vec![FallbackStep::User, FallbackStep::Stock, FallbackStep::Placeholder],
            events: EventWriter::disabled(),
        }
    }

    pub fn from_config(config: &ImageConfig) -> Self {
        let scorer = WeightedScorer::new(config.matching.weights, config.matching.boosts);
        let mut engine = Self::new(Box::new(scorer), config.fallback.min_relevance_score);
        engine.stock_relevance = config.matching.stock_relevance_score.min(100);
        engine.fallback = config.fallback.chain.clone();
        engine
    }

    pub fn with_fallback(mut self, fallback: &FallbackConfig) -> Self {
        self.fallback = fallback.chain.clone();
        self.min_relevance = fallback.min_relevance_score;
        self
    }

    pub fn with_stock_relevance(mut self, score: u32) -> Self {
        self.stock_relevance = score.min(100);
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    fn allows(&self, step: FallbackStep) -> bool {
        self.fallback.contains(&step)
    }

    /// Scores every candidate for one slot, in pool order.
    pub fn score_candidates(&self, slot: &Slot, candidates: &[&ImageRecord]) -> Vec<(String, u32)> {
        candidates
            .iter()
            .filter_map(|image| {
                let analysis = image.analysis.as_ref()?;
                Some((image.path.clone(), self.scorer.score(slot, image, analysis).min(100)))
            })
            .collect()
    }

    /// Runs matching against the registry, saving after every accepted
    /// slot. Per-slot failures are recorded in the outcome; only manifest
    /// persistence errors abort the run.
    pub fn match_slots(
        &self,
        registry: &mut ImageRegistry,
        stock: Option<&StockPhotoService>,
        cancel: &CancelToken,
    ) -> Result<MatchRun> {
        let mut run = MatchRun::default();
        let order = matching_order(registry);
        let mut used = registry.manifest().consumed_identities();
        let mut pending: Vec<SlotOutcome> = Vec::new();

        for slot_id in order {
            if cancel.is_cancelled() {
                run.cancelled = true;
                break;
            }
            let Some(slot) = registry.manifest().slots.get(&slot_id).cloned() else {
                continue;
            };
            let mut outcome = SlotOutcome {
                slot_id: slot.id.clone(),
                required: slot.required,
                status: SlotStatus::NoCandidates,
                placeholder: false,
                warning: None,
            };
            if !self.allows(FallbackStep::User) {
                pending.push(outcome);
                continue;
            }

            let best = {
                let candidates = candidate_pool(registry, &used);
                let scored = self.score_candidates(&slot, &candidates);
                let mut best: Option<(String, u32)> = None;
                for (image, score) in scored {
                    if best.as_ref().map(|(_, top)| score > *top).unwrap_or(true) {
                        best = Some((image, score));
                    }
                }
                best
            };

            match best {
                Some((image, score)) if score >= self.min_relevance => {
                    let identity = identity_of(registry, &image);
                    let accepted = registry.accept_match(&slot.id, &image, score, MatchOrigin::Engine)?;
                    used.insert(identity);
                    outcome.warning = accepted.warning;
                    let assignment = Assignment {
                        slot_id: slot.id.clone(),
                        image: accepted.image,
                        score,
                        origin: MatchOrigin::Engine,
                    };
                    self.log_match(&assignment);
                    run.assignments.push(assignment.clone());
                    outcome.status = SlotStatus::Matched(assignment);
                    registry.save_manifest()?;
                    run.outcomes.push(outcome);
                }
                Some((image, score)) => {
                    outcome.status = SlotStatus::BelowThreshold {
                        best_image: image,
                        best_score: score,
                    };
                    pending.push(outcome);
                }
                None => pending.push(outcome),
            }
        }

        let stock = stock.filter(|service| self.allows(FallbackStep::Stock) && service.is_available());
        for mut outcome in pending {
            if let Some(service) = stock {
                if !run.cancelled && cancel.is_cancelled() {
                    run.cancelled = true;
                }
                if !run.cancelled {
                    let assigned = self.escalate_to_stock(registry, service, None, &mut outcome, &mut used)?;
                    run.assignments.extend(assigned);
                }
            }
            if !outcome.is_matched() {
                outcome.placeholder = self.allows(FallbackStep::Placeholder);
                self.log_unmatched(&outcome);
            }
            run.outcomes.push(outcome);
        }

        registry.save_manifest()?;
        Ok(run)
    }

    /// Fetches a stock photo for one slot outside a matching run. Photos
    /// already serving other slots are excluded, as in [`Self::match_slots`].
    /// `query` overrides the slot's own search query.
    pub fn assign_stock(
        &self,
        registry: &mut ImageRegistry,
        service: &StockPhotoService,
        slot_id: &str,
        query: Option<&str>,
    ) -> Result<SlotOutcome> {
        let Some(slot) = registry.manifest().slots.get(slot_id) else {
            bail!("unknown slot {slot_id}");
        };
        let mut outcome = SlotOutcome {
            slot_id: slot.id.clone(),
            required: slot.required,
            status: SlotStatus::StockMiss,
            placeholder: false,
            warning: None,
        };
        let mut used = registry.manifest().consumed_identities();
        self.escalate_to_stock(registry, service, query, &mut outcome, &mut used)?;
        if !outcome.is_matched() {
            self.log_unmatched(&outcome);
        }
        Ok(outcome)
    }

    fn escalate_to_stock(
        &self,
        registry: &mut ImageRegistry,
        service: &StockPhotoService,
        query: Option<&str>,
        outcome: &mut SlotOutcome,
        used: &mut BTreeSet<String>,
    ) -> Result<Option<Assignment>> {
        let Some(slot) = registry.manifest().slots.get(&outcome.slot_id).cloned() else {
            return Ok(None);
        };
        let query = query.map(str::to_string).unwrap_or_else(|| slot.search_query());
        let exclude = registry.stock_photos_in_use();
        let dest = registry.layout().stock.clone();
        let fetch = match service.fetch_best_match_excluding(&query, &dest, &exclude) {
            Ok(fetch) => fetch,
            Err(err) => {
                outcome.status = SlotStatus::StockFailed(format!("{err:#}"));
                return Ok(None);
            }
        };
        let Some(record) = fetch.image else {
            outcome.status = SlotStatus::StockMiss;
            return Ok(None);
        };

        let identity = record.identity();
        if used.contains(&identity) {
            outcome.status = SlotStatus::StockMiss;
            outcome.warning = Some(format!("stock photo {} already serves another slot", record.filename));
            return Ok(None);
        }
        let key = registry.register_stock(record);
        let accepted = registry.accept_match(&slot.id, &key, self.stock_relevance, MatchOrigin::Stock)?;
        used.insert(identity);
        let assignment = Assignment {
            slot_id: slot.id.clone(),
            image: accepted.image,
            score: self.stock_relevance,
            origin: MatchOrigin::Stock,
        };
        self.log_match(&assignment);
        outcome.warning = accepted.warning;
        outcome.status = SlotStatus::Matched(assignment.clone());
        registry.save_manifest()?;
        Ok(Some(assignment))
    }

    fn log_match(&self, assignment: &Assignment) {
        self.events.record(
            "slot_matched",
            payload(json!({
                "slot": assignment.slot_id,
                "image": assignment.image,
                "score": assignment.score,
                "origin": assignment.origin,
            })),
        );
    }

    fn log_unmatched(&self, outcome: &SlotOutcome) {
        let (reason, best_score) = match &outcome.status {
            SlotStatus::NoCandidates => ("no_candidates".to_string(), None),
            SlotStatus::BelowThreshold { best_score, .. } => ("below_threshold".to_string(), Some(*best_score)),
            SlotStatus::StockMiss => ("stock_miss".to_string(), None),
            SlotStatus::StockFailed(err) => (format!("stock_failed: {err}"), None),
            SlotStatus::Matched(_) => return,
        };
        self.events.record(
            "slot_unmatched",
            payload(json!({
                "slot": outcome.slot_id,
                "required": outcome.required,
                "reason": reason,
                "best_score": best_score,
                "placeholder": outcome.placeholder,
            })),
        );
    }
}

/// Unmatched slot ids: required first, then optional, manifest order within
/// each group.
pub fn matching_order(registry: &ImageRegistry) -> Vec<String> {
    let slots = &registry.manifest().slots;
    let unmatched = || slots.values().filter(|slot| !slot.is_matched());
    unmatched()
        .filter(|slot| slot.required)
        .chain(unmatched().filter(|slot| !slot.required))
        .map(|slot| slot.id.clone())
        .collect()
}

/// Analyzed images present on disk whose content is not yet in use, one per
/// identity, in registry order.
fn candidate_pool<'r>(registry: &'r ImageRegistry, used: &BTreeSet<String>) -> Vec<&'r ImageRecord> {
    let mut seen = BTreeSet::new();
    registry
        .manifest()
        .images
        .values()
        .filter(|image| image.analyzed && image.analysis.is_some())
        .filter(|image| !used.contains(&image.identity()))
        .filter(|image| registry.absolute(&image.path).is_file())
        .filter(|image| seen.insert(image.identity()))
        .collect()
}

fn identity_of(registry: &ImageRegistry, image_key: &str) -> String {
    registry
        .manifest()
        .images
        .get(image_key)
        .map(ImageRecord::identity)
        .unwrap_or_else(|| format!("path:{image_key}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use slotfill_contracts::models::{AnalysisResult, BusinessRelevance, ImageRecord, ImageSource, MatchOrigin, Slot};

    use super::{MatchingEngine, SlotScorer, SlotStatus, WeightedScorer};
    use crate::cancel::CancelToken;
    use crate::registry::tests::{definition, open, write_pending};
    use crate::registry::ImageRegistry;
    use crate::stock::tests::FakeStock;
    use crate::stock::{StockChain, StockPhotoService};
    use crate::vision::tests::sample_analysis;

    /// Scores by filename from a fixed table; unknown files score 0.
    struct TableScorer(BTreeMap<&'static str, u32>);

    impl SlotScorer for TableScorer {
        fn score(&self, _slot: &Slot, image: &ImageRecord, _analysis: &AnalysisResult) -> u32 {
            self.0.get(image.filename.as_str()).copied().unwrap_or(0)
        }
    }

    fn table(rows: &[(&'static str, u32)]) -> Box<TableScorer> {
        Box::new(TableScorer(rows.iter().copied().collect()))
    }

    fn analyzed(registry: &mut ImageRegistry, key: &str, hash: &str) {
        registry.record_analysis(key, sample_analysis(&["roof"]), hash.to_string());
    }

    #[test]
    fn hero_slot_takes_the_higher_scoring_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let low = write_pending(temp.path(), "low.jpg", b"low")?;
        let high = write_pending(temp.path(), "high.jpg", b"high")?;
        let mut registry = open(
            temp.path(),
            vec![definition("backgroundImage", "hero", "wide exterior photo", true)],
        )?;
        registry.update_registry()?;
        analyzed(&mut registry, &low, "h-low");
        analyzed(&mut registry, &high, "h-high");

        let engine = MatchingEngine::new(table(&[("low.jpg", 40), ("high.jpg", 85)]), 70);
        let run = engine.match_slots(&mut registry, None, &CancelToken::new())?;
        assert_eq!(run.assignments.len(), 1);
        assert_eq!(run.assignments[0].score, 85);

        let slot = &registry.manifest().slots["src/content/homepage.json:backgroundImage"];
        assert_eq!(slot.relevance_score, Some(85));
        assert_eq!(slot.matched_image.as_deref(), Some("business-images/approved/high.jpg"));
        assert_eq!(slot.matched_by, Some(MatchOrigin::Engine));
        Ok(())
    }

    #[test]
    fn below_threshold_stays_unmatched_and_is_reported() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let only = write_pending(temp.path(), "meh.jpg", b"meh")?;
        let mut registry = open(temp.path(), vec![definition("hero", "hero", "x", true)])?;
        registry.update_registry()?;
        analyzed(&mut registry, &only, "h-meh");

        let engine = MatchingEngine::new(table(&[("meh.jpg", 69)]), 70);
        let run = engine.match_slots(&mut registry, None, &CancelToken::new())?;
        assert!(run.assignments.is_empty());
        assert_eq!(
            run.outcomes[0].status,
            SlotStatus::BelowThreshold {
                best_image: only.clone(),
                best_score: 69
            }
        );
        assert!(run.outcomes[0].placeholder);
        assert_eq!(run.unmatched_required(), vec!["src/content/homepage.json:hero"]);
        assert_eq!(
            registry.generate_report().unmatched_slots,
            vec!["src/content/homepage.json:hero"]
        );
        Ok(())
    }

    #[test]
    fn required_slot_wins_the_contested_image_and_images_are_unique() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let best = write_pending(temp.path(), "best.jpg", b"best")?;
        let other = write_pending(temp.path(), "other.jpg", b"other")?;
        let mut registry = open(
            temp.path(),
            vec![
                definition("optional", "card", "roof", false),
                definition("required", "card", "roof", true),
            ],
        )?;
        registry.update_registry()?;
        analyzed(&mut registry, &best, "h-best");
        analyzed(&mut registry, &other, "h-other");

        let engine = MatchingEngine::new(table(&[("best.jpg", 95), ("other.jpg", 80)]), 70);
        let run = engine.match_slots(&mut registry, None, &CancelToken::new())?;
        assert_eq!(run.assignments[0].slot_id, "src/content/homepage.json:required");
        assert_eq!(run.assignments[0].score, 95);
        assert_eq!(run.assignments[1].slot_id, "src/content/homepage.json:optional");
        assert_eq!(run.assignments[1].score, 80);

        let mut matched: Vec<&str> = registry
            .manifest()
            .slots
            .values()
            .filter_map(|slot| slot.matched_image.as_deref())
            .collect();
        let count = matched.len();
        matched.dedup();
        assert_eq!(matched.len(), count);
        Ok(())
    }

    #[test]
    fn equal_scores_pick_the_first_discovered_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = write_pending(temp.path(), "a-first.jpg", b"1")?;
        let second = write_pending(temp.path(), "b-second.jpg", b"2")?;
        let mut registry = open(temp.path(), vec![definition("card", "card", "roof", false)])?;
        registry.update_registry()?;
        analyzed(&mut registry, &first, "h1");
        analyzed(&mut registry, &second, "h2");

        let engine = MatchingEngine::new(table(&[("a-first.jpg", 80), ("b-second.jpg", 80)]), 70);
        let run = engine.match_slots(&mut registry, None, &CancelToken::new())?;
        assert_eq!(run.assignments[0].image, "business-images/approved/a-first.jpg");
        Ok(())
    }

    #[test]
    fn images_already_serving_a_slot_are_not_reused_across_runs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let only = write_pending(temp.path(), "only.jpg", b"only")?;
        let mut registry = open(
            temp.path(),
            vec![definition("one", "card", "x", true), definition("two", "card", "x", true)],
        )?;
        registry.update_registry()?;
        analyzed(&mut registry, &only, "h-only");
        let engine = MatchingEngine::new(table(&[("only.jpg", 90)]), 70);

        engine.match_slots(&mut registry, None, &CancelToken::new())?;
        // The approved copy now exists too; it shares the original's identity.
        registry.update_registry()?;
        let second = engine.match_slots(&mut registry, None, &CancelToken::new())?;
        assert!(second.assignments.is_empty());
        assert_eq!(second.outcomes[0].status, SlotStatus::NoCandidates);
        Ok(())
    }

    #[test]
    fn no_images_and_no_stock_credentials_leaves_required_slot_reported() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = open(temp.path(), vec![definition("hero", "hero", "wide exterior photo", true)])?;
        registry.update_registry()?;
        let mut unconfigured = FakeStock::with_photo("unsplash", "1");
        unconfigured.configured = false;
        let stock = StockPhotoService::new(StockChain::new(vec![Box::new(unconfigured)]));

        let engine = MatchingEngine::new(Box::new(WeightedScorer::default()), 70);
        let run = engine.match_slots(&mut registry, Some(&stock), &CancelToken::new())?;
        assert!(run.assignments.is_empty());
        assert_eq!(run.outcomes[0].status, SlotStatus::NoCandidates);
        assert_eq!(
            registry.generate_report().unmatched_slots,
            vec!["src/content/homepage.json:hero"]
        );
        Ok(())
    }

    #[test]
    fn stock_escalation_fills_leftover_slots_with_distinct_photos() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = open(
            temp.path(),
            vec![definition("team", "team", "our crew", true), definition("gallery", "gallery", "roof", false)],
        )?;
        registry.update_registry()?;
        let vendor = FakeStock::new(
            "pexels",
            vec![
                Ok(crate::stock::tests::result_with("pexels", "10")),
                Ok(crate::stock::tests::result_with("pexels", "10")),
            ],
        );
        let stock = StockPhotoService::new(StockChain::new(vec![Box::new(vendor)])).with_cooldown(Duration::ZERO);

        let engine = MatchingEngine::new(table(&[]), 70).with_stock_relevance(75);
        let run = engine.match_slots(&mut registry, Some(&stock), &CancelToken::new())?;
        assert_eq!(run.assignments.len(), 1);
        assert_eq!(run.assignments[0].origin, MatchOrigin::Stock);
        assert_eq!(run.assignments[0].score, 75);
        assert_eq!(run.assignments[0].slot_id, "src/content/homepage.json:team");
        // Same photo offered again for the second slot: excluded, so a miss.
        assert_eq!(run.outcomes[1].status, SlotStatus::StockMiss);

        let slot = &registry.manifest().slots["src/content/homepage.json:team"];
        assert_eq!(slot.matched_by, Some(MatchOrigin::Stock));
        assert!(temp.path().join("business-images/stock/pexels-10.jpg").exists());
        Ok(())
    }

    #[test]
    fn single_slot_stock_fetch_skips_photos_serving_other_slots() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = open(
            temp.path(),
            vec![definition("team", "team", "our crew", true), definition("gallery", "gallery", "roof", false)],
        )?;
        registry.update_registry()?;
        let vendor = FakeStock::new(
            "pexels",
            vec![
                Ok(crate::stock::tests::result_with("pexels", "10")),
                Ok(crate::stock::tests::result_with("pexels", "10")),
            ],
        );
        let stock = StockPhotoService::new(StockChain::new(vec![Box::new(vendor)])).with_cooldown(Duration::ZERO);
        let engine = MatchingEngine::new(table(&[]), 70).with_stock_relevance(75);

        let first = engine.assign_stock(&mut registry, &stock, "src/content/homepage.json:team", None)?;
        assert!(first.is_matched());
        assert!(registry.stock_photos_in_use().contains("pexels:10"));

        let second = engine.assign_stock(&mut registry, &stock, "src/content/homepage.json:gallery", Some("roof"))?;
        assert_eq!(second.status, SlotStatus::StockMiss);
        assert!(!registry.manifest().slots["src/content/homepage.json:gallery"].is_matched());
        assert!(engine.assign_stock(&mut registry, &stock, "nope", None).is_err());
        Ok(())
    }

    #[test]
    fn cancelled_run_keeps_saved_progress() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = open(temp.path(), vec![definition("hero", "hero", "x", true)])?;
        registry.update_registry()?;
        let cancel = CancelToken::new();
        cancel.cancel();
        let run = MatchingEngine::new(table(&[]), 70).match_slots(&mut registry, None, &cancel)?;
        assert!(run.cancelled);
        assert!(run.outcomes.is_empty());
        Ok(())
    }

    #[test]
    fn weighted_scorer_prefers_domain_appropriate_imagery() {
        let slot = Slot::from_definition(&definition("team", "team", "our friendly crew", false));
        let mut team_analysis = sample_analysis(&["team", "crew", "uniform"]);
        team_analysis.business_relevance = BusinessRelevance {
            is_team_photo: true,
            ..BusinessRelevance::default()
        };
        team_analysis.tags = vec!["friendly".to_string(), "crew".to_string(), "team".to_string()];
        team_analysis.quality = 90;
        let mut roof_analysis = sample_analysis(&["roof"]);
        roof_analysis.quality = 90;

        let scorer = WeightedScorer::default();
        let team_image = ImageRecord::new("a/staff.jpg", ImageSource::User);
        let roof_image = ImageRecord::new("a/roof.jpg", ImageSource::User);
        let team_score = scorer.score(&slot, &team_image, &team_analysis);
        let roof_score = scorer.score(&slot, &roof_image, &roof_analysis);
        assert!(team_score > roof_score, "{team_score} vs {roof_score}");
        assert!(team_score >= 70);
        assert!(roof_score < 70);
    }

    #[test]
    fn component_name_does_not_dilute_context_overlap() {
        let slot = Slot::from_definition(&definition("backgroundImage", "hero", "wide exterior photo", true));
        let mut analysis = sample_analysis(&["house", "lawn"]);
        analysis.tags = vec!["exterior".to_string(), "wide".to_string(), "sunny".to_string()];
        analysis.description = "wide exterior view of a brick house".to_string();
        analysis.business_relevance = BusinessRelevance {
            is_building: true,
            ..BusinessRelevance::default()
        };
        analysis.quality = 80;
        let scorer = WeightedScorer::default();
        let image = ImageRecord::new("x/front.jpg", ImageSource::User);
        // tags 15 + description 10 + business 30 + quality 20
        assert_eq!(scorer.score(&slot, &image, &analysis), 75);

        analysis.quality = 95;
        assert!(scorer.score(&slot, &image, &analysis) > 75);
    }

    #[test]
    fn slot_without_context_falls_back_to_component_words() {
        let slot = Slot::from_definition(&definition("image", "gallery", "", false));
        let mut analysis = sample_analysis(&["gallery"]);
        analysis.quality = 0;
        let scorer = WeightedScorer::default();
        // subjects 20 + business 0 (gallery wants before/after)
        assert_eq!(scorer.score(&slot, &ImageRecord::new("x/a.jpg", ImageSource::User), &analysis), 20);
    }

    #[test]
    fn weighted_scorer_applies_filename_boosts_and_clamps() {
        let slot = Slot::from_definition(&definition("hero", "hero", "wide exterior", true));
        let analysis = sample_analysis(&["sky"]);
        let scorer = WeightedScorer::default();
        let plain = scorer.score(&slot, &ImageRecord::new("x/sky.jpg", ImageSource::User), &analysis);
        let named = scorer.score(&slot, &ImageRecord::new("x/hero.jpg", ImageSource::User), &analysis);
        assert!(named > plain);
        assert!(named <= 100);
    }
}
