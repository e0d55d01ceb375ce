//! Selection sessions and their stage machine.
//!
//! Every mutation goes through [`next_stage`], the single transition table.
//! A rejected operation leaves the session untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use streamdigest_shared::{
    ArtifactType, BatchRef, Candidate, ContentItem, DateRange, DigestError, NewsletterDocument,
    Operation, Picks, Result, SessionId, SessionSnapshot, Stage,
};

/// Outcome of a permitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to a new stage.
    Advance(Stage),
    /// Allowed without a stage change (cached batch, re-pick, repeated finalize).
    Stay,
}

/// The transition table.
pub fn next_stage(stage: Stage, operation: Operation) -> Result<Transition> {
    use ArtifactType::{Banner, Intro, Tagline};
    use Operation::*;
    use Stage::*;
    use Transition::{Advance, Stay};

    let transition = match (stage, operation) {
        (Initialized, Ingest) => Advance(Scraped),
        (Scraped, SelectContent) => Stay,

        (Scraped, GenerateCandidates(Tagline)) => Advance(TaglinesGenerated),
        (TaglinesGenerated, GenerateCandidates(Tagline)) => Stay,
        (TaglinesGenerated, SelectCandidate(Tagline)) => Advance(TaglineChosen),
        (TaglineChosen, SelectCandidate(Tagline)) => Stay,

        (TaglineChosen, GenerateCandidates(Intro)) => Advance(IntrosGenerated),
        (IntrosGenerated, GenerateCandidates(Intro)) => Stay,
        (IntrosGenerated, SelectCandidate(Intro)) => Advance(IntroChosen),
        (IntroChosen, SelectCandidate(Intro)) => Stay,

        (IntroChosen, GenerateCandidates(Banner)) => Advance(BannersGenerated),
        (BannersGenerated, GenerateCandidates(Banner)) => Stay,
        (BannersGenerated, SelectCandidate(Banner)) => Advance(BannerChosen),
        (BannerChosen, SelectCandidate(Banner)) => Stay,

        (BannerChosen, Assemble) => Advance(Assembled),
        (Assembled, Finalize) => Advance(Finalized),
        (Finalized, Finalize) => Stay,

        (Aborted, Abort) => Stay,
        (s, Abort) if !s.is_terminal() => Advance(Aborted),

        (stage, operation) => {
            return Err(DigestError::InvalidStateTransition { stage, operation });
        }
    };
    Ok(transition)
}

/// One operator's progress from content range to final document.
#[derive(Debug, Clone)]
pub struct SelectionSession {
    id: SessionId,
    range: DateRange,
    stage: Stage,
    picks: Picks,
    items: Vec<ContentItem>,
    skipped: usize,
    /// Indices into `items` kept for the newsletter; `None` keeps all.
    included: Option<Vec<usize>>,
    /// Recorded batches by (artifact, prompt version).
    batches: HashMap<(ArtifactType, String), Arc<Vec<Candidate>>>,
    batch_order: Vec<BatchRef>,
    document: Option<Arc<NewsletterDocument>>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl SelectionSession {
    pub fn new(id: SessionId, range: DateRange) -> Self {
        let now = Utc::now();
        Self {
            id,
            range,
            stage: Stage::Initialized,
            picks: Picks::default(),
            items: Vec::new(),
            skipped: 0,
            included: None,
            batches: HashMap::new(),
            batch_order: Vec::new(),
            document: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a session from its snapshot and the batches it references.
    pub fn restore(
        snapshot: SessionSnapshot,
        batches: Vec<(BatchRef, Vec<Candidate>)>,
        document: Option<NewsletterDocument>,
    ) -> Self {
        let batches = batches
            .into_iter()
            .map(|(r, c)| ((r.artifact, r.prompt_version), Arc::new(c)))
            .collect();
        let mut session = Self {
            id: snapshot.id,
            range: snapshot.range,
            stage: snapshot.stage,
            picks: snapshot.picks,
            items: snapshot.items,
            skipped: snapshot.skipped,
            included: snapshot.included,
            batches,
            batch_order: snapshot.batches,
            document: document.map(Arc::new),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        };
        // Batches are stored as generated; chosen flags follow the picks.
        for artifact in ArtifactType::ALL {
            if let Some(index) = session.picks.get(artifact) {
                session.mark_chosen(artifact, index);
            }
        }
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn range(&self) -> &DateRange {
        &self.range
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn picks(&self) -> &Picks {
        &self.picks
    }

    /// Every ingested entry, selected or not.
    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    /// The entries that go into the newsletter.
    pub fn included_items(&self) -> Vec<ContentItem> {
        match &self.included {
            Some(indices) => indices
                .iter()
                .filter_map(|&i| self.items.get(i).cloned())
                .collect(),
            None => self.items.clone(),
        }
    }

    pub fn document(&self) -> Option<&Arc<NewsletterDocument>> {
        self.document.as_ref()
    }

    /// Validate `operation` against the current stage without changing anything.
    pub fn check(&self, operation: Operation) -> Result<Transition> {
        next_stage(self.stage, operation)
    }

    /// The batch already recorded for `artifact` at `version`, while the
    /// session can still be worked on.
    pub fn recorded_batch(
        &self,
        artifact: ArtifactType,
        version: &str,
    ) -> Option<Arc<Vec<Candidate>>> {
        if self.stage.is_terminal() {
            return None;
        }
        self.batch(artifact, version)
    }

    /// The recorded batch for `artifact` at `version`.
    pub fn batch(&self, artifact: ArtifactType, version: &str) -> Option<Arc<Vec<Candidate>>> {
        self.batches.get(&(artifact, version.to_string())).cloned()
    }

    /// The most recently recorded batch for `artifact`, any version.
    pub fn latest_batch(&self, artifact: ArtifactType) -> Option<Arc<Vec<Candidate>>> {
        self.batch_order
            .iter()
            .rev()
            .find(|r| r.artifact == artifact)
            .and_then(|r| self.batch(artifact, &r.prompt_version))
    }

    /// The chosen candidate for `artifact`.
    pub fn chosen(&self, artifact: ArtifactType) -> Option<Candidate> {
        let index = self.picks.get(artifact)?;
        self.latest_batch(artifact)?.get(index).cloned()
    }

    /// Record ingested content: `Initialized → Scraped`.
    pub fn record_content(&mut self, items: Vec<ContentItem>, skipped: usize) -> Result<()> {
        let transition = self.check(Operation::Ingest)?;
        self.items = items;
        self.skipped = skipped;
        self.apply(transition);
        Ok(())
    }

    /// Keep only the entries at `indices` (positions in [`Self::items`]).
    ///
    /// Allowed until the first batch is generated; a repeated call replaces
    /// the earlier selection.
    pub fn select_content(&mut self, indices: &[usize]) -> Result<usize> {
        let transition = self.check(Operation::SelectContent)?;
        if indices.is_empty() {
            return Err(DigestError::validation("select at least one entry"));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.items.len()) {
            return Err(DigestError::validation(format!(
                "entry index {bad} out of range ({} entries)",
                self.items.len()
            )));
        }
        let mut kept = indices.to_vec();
        kept.sort_unstable();
        kept.dedup();
        let count = kept.len();
        self.included = Some(kept);
        self.apply(transition);
        Ok(count)
    }

    /// Record a complete batch. The caller guarantees the exact count.
    pub fn record_batch(
        &mut self,
        artifact: ArtifactType,
        version: &str,
        candidates: Vec<Candidate>,
    ) -> Result<()> {
        let transition = self.check(Operation::GenerateCandidates(artifact))?;
        let key = (artifact, version.to_string());
        if !self.batches.contains_key(&key) {
            self.batch_order.push(BatchRef {
                artifact,
                prompt_version: version.to_string(),
            });
        }
        self.batches.insert(key, Arc::new(candidates));
        self.apply(transition);
        Ok(())
    }

    /// Choose candidate `index` of the current batch for `artifact`.
    pub fn select(&mut self, artifact: ArtifactType, index: usize) -> Result<()> {
        let transition = self.check(Operation::SelectCandidate(artifact))?;
        let batch = self.latest_batch(artifact).ok_or(DigestError::InvalidStateTransition {
            stage: self.stage,
            operation: Operation::SelectCandidate(artifact),
        })?;
        if index >= batch.len() {
            return Err(DigestError::validation(format!(
                "{artifact} index {index} out of range (batch has {})",
                batch.len()
            )));
        }

        self.mark_chosen(artifact, index);
        self.picks.set(artifact, index);
        self.apply(transition);
        Ok(())
    }

    /// Attach the assembled document: `BannerChosen → Assembled`.
    pub fn record_assembled(&mut self, document: Arc<NewsletterDocument>) -> Result<()> {
        let transition = self.check(Operation::Assemble)?;
        self.document = Some(document);
        self.apply(transition);
        Ok(())
    }

    /// `Assembled → Finalized`; repeated calls are no-ops.
    pub fn finalize(&mut self) -> Result<Arc<NewsletterDocument>> {
        let transition = self.check(Operation::Finalize)?;
        let document = self.document.clone().ok_or_else(|| DigestError::Finalization {
            stage: self.stage,
            message: "no assembled document".into(),
        })?;
        self.apply(transition);
        Ok(document)
    }

    /// Move to `Aborted`. Aborting an aborted session is a no-op.
    pub fn abort(&mut self) -> Result<()> {
        let transition = self.check(Operation::Abort)?;
        self.apply(transition);
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            range: self.range,
            stage: self.stage,
            picks: self.picks,
            batches: self.batch_order.clone(),
            items: self.items.clone(),
            skipped: self.skipped,
            included: self.included.clone(),
            document_id: self.document.as_ref().map(|d| d.id.clone()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn mark_chosen(&mut self, artifact: ArtifactType, index: usize) {
        let Some(r) = self.batch_order.iter().rev().find(|r| r.artifact == artifact) else {
            return;
        };
        let key = (artifact, r.prompt_version.clone());
        if let Some(batch) = self.batches.get(&key) {
            let marked: Vec<Candidate> = batch
                .iter()
                .cloned()
                .map(|mut c| {
                    c.chosen = c.index == index;
                    c
                })
                .collect();
            self.batches.insert(key, Arc::new(marked));
        }
    }

    fn apply(&mut self, transition: Transition) {
        if let Transition::Advance(stage) = transition {
            self.stage = stage;
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use streamdigest_shared::CandidatePayload;

    use super::*;

    fn session() -> SelectionSession {
        let range = DateRange::parse("2024-01-01", "2024-01-03").unwrap();
        SelectionSession::new(SessionId::new(), range)
    }

    fn batch(artifact: ArtifactType, n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|index| Candidate {
                artifact,
                index,
                payload: CandidatePayload::Text {
                    text: format!("{artifact} {index}"),
                },
                chosen: false,
            })
            .collect()
    }

    #[test]
    fn happy_path_stages() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();
        assert_eq!(s.stage(), Stage::Scraped);

        for (artifact, generated, chosen) in [
            (ArtifactType::Tagline, Stage::TaglinesGenerated, Stage::TaglineChosen),
            (ArtifactType::Intro, Stage::IntrosGenerated, Stage::IntroChosen),
            (ArtifactType::Banner, Stage::BannersGenerated, Stage::BannerChosen),
        ] {
            s.record_batch(artifact, "v1", batch(artifact, 3)).unwrap();
            assert_eq!(s.stage(), generated);
            s.select(artifact, 1).unwrap();
            assert_eq!(s.stage(), chosen);
        }

        assert_eq!(s.picks().get(ArtifactType::Banner), Some(1));
        assert!(s.chosen(ArtifactType::Intro).unwrap().chosen);
    }

    #[test]
    fn select_before_generate_is_rejected() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();

        let err = s.select(ArtifactType::Tagline, 0).unwrap_err();
        assert!(matches!(
            err,
            DigestError::InvalidStateTransition {
                stage: Stage::Scraped,
                operation: Operation::SelectCandidate(ArtifactType::Tagline),
            }
        ));
        assert_eq!(s.stage(), Stage::Scraped);
        assert!(s.picks().tagline.is_none());
    }

    #[test]
    fn out_of_order_generation_is_rejected() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();
        assert!(s.record_batch(ArtifactType::Intro, "v1", batch(ArtifactType::Intro, 3)).is_err());
        assert!(s.record_batch(ArtifactType::Banner, "v1", batch(ArtifactType::Banner, 6)).is_err());
        assert_eq!(s.stage(), Stage::Scraped);
    }

    #[test]
    fn re_pick_replaces_choice() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();
        s.record_batch(ArtifactType::Tagline, "v1", batch(ArtifactType::Tagline, 3)).unwrap();
        s.select(ArtifactType::Tagline, 0).unwrap();
        s.select(ArtifactType::Tagline, 2).unwrap();

        assert_eq!(s.stage(), Stage::TaglineChosen);
        let batch = s.latest_batch(ArtifactType::Tagline).unwrap();
        let chosen: Vec<_> = batch.iter().filter(|c| c.chosen).map(|c| c.index).collect();
        assert_eq!(chosen, vec![2]);
    }

    #[test]
    fn index_out_of_range_is_validation_error() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();
        s.record_batch(ArtifactType::Tagline, "v1", batch(ArtifactType::Tagline, 3)).unwrap();
        assert!(matches!(
            s.select(ArtifactType::Tagline, 3),
            Err(DigestError::Validation { .. })
        ));
        assert_eq!(s.stage(), Stage::TaglinesGenerated);
    }

    #[test]
    fn abort_is_terminal() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();
        s.abort().unwrap();
        s.abort().unwrap();
        assert_eq!(s.stage(), Stage::Aborted);

        assert!(s.record_batch(ArtifactType::Tagline, "v1", batch(ArtifactType::Tagline, 3)).is_err());
        assert!(s.select(ArtifactType::Tagline, 0).is_err());
        assert_eq!(s.stage(), Stage::Aborted);
    }

    #[test]
    fn finalized_cannot_be_aborted() {
        assert!(next_stage(Stage::Finalized, Operation::Abort).is_err());
        assert_eq!(
            next_stage(Stage::Finalized, Operation::Finalize).unwrap(),
            Transition::Stay
        );
        assert!(next_stage(Stage::BannerChosen, Operation::Finalize).is_err());
    }

    #[test]
    fn stages_never_move_backwards() {
        let order = [
            Stage::Initialized,
            Stage::Scraped,
            Stage::TaglinesGenerated,
            Stage::TaglineChosen,
            Stage::IntrosGenerated,
            Stage::IntroChosen,
            Stage::BannersGenerated,
            Stage::BannerChosen,
            Stage::Assembled,
            Stage::Finalized,
        ];
        let rank = |s: Stage| order.iter().position(|o| *o == s);
        let mut operations = vec![
            Operation::Ingest,
            Operation::SelectContent,
            Operation::Assemble,
            Operation::Finalize,
        ];
        for a in ArtifactType::ALL {
            operations.push(Operation::GenerateCandidates(a));
            operations.push(Operation::SelectCandidate(a));
        }

        for stage in order {
            for op in &operations {
                if let Ok(Transition::Advance(next)) = next_stage(stage, *op) {
                    assert!(rank(next) > rank(stage), "{stage} -> {next} via {op}");
                }
            }
        }
    }

    #[test]
    fn snapshot_round_trip_restores_batches() {
        let mut s = session();
        s.record_content(Vec::new(), 2).unwrap();
        s.record_batch(ArtifactType::Tagline, "v1", batch(ArtifactType::Tagline, 3)).unwrap();
        s.select(ArtifactType::Tagline, 1).unwrap();

        let snapshot = s.snapshot();
        assert_eq!(snapshot.skipped, 2);
        assert_eq!(snapshot.batches.len(), 1);

        let candidates = s.latest_batch(ArtifactType::Tagline).unwrap().as_ref().clone();
        let restored = SelectionSession::restore(
            snapshot.clone(),
            vec![(snapshot.batches[0].clone(), candidates)],
            None,
        );
        assert_eq!(restored.stage(), Stage::TaglineChosen);
        assert_eq!(
            restored.chosen(ArtifactType::Tagline).unwrap().payload.as_text(),
            Some("tagline 1")
        );
    }

    fn item(title: &str) -> ContentItem {
        ContentItem {
            title: title.into(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            platform: "Hulu".into(),
            kind: None,
            description: None,
            platform_logo: None,
            image_url: None,
            link: None,
            country: None,
        }
    }

    #[test]
    fn content_selection_keeps_chosen_entries() {
        let mut s = session();
        s.record_content(vec![item("A"), item("B"), item("C")], 0).unwrap();
        assert_eq!(s.included_items().len(), 3);

        assert_eq!(s.select_content(&[2, 0, 2]).unwrap(), 2);
        let titles: Vec<String> = s.included_items().into_iter().map(|i| i.title).collect();
        assert_eq!(titles, vec!["A", "C"]);
        assert_eq!(s.stage(), Stage::Scraped);
        assert_eq!(s.snapshot().included, Some(vec![0, 2]));
        // All entries stay on the session.
        assert_eq!(s.items().len(), 3);
    }

    #[test]
    fn content_selection_is_validated() {
        let mut s = session();
        assert!(matches!(
            s.select_content(&[0]),
            Err(DigestError::InvalidStateTransition { .. })
        ));

        s.record_content(vec![item("A")], 0).unwrap();
        assert!(matches!(s.select_content(&[]), Err(DigestError::Validation { .. })));
        assert!(matches!(s.select_content(&[1]), Err(DigestError::Validation { .. })));
        assert_eq!(s.snapshot().included, None);

        s.record_batch(ArtifactType::Tagline, "v1", batch(ArtifactType::Tagline, 3)).unwrap();
        assert!(matches!(
            s.select_content(&[0]),
            Err(DigestError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn recorded_batch_survives_the_pick() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();
        s.record_batch(ArtifactType::Tagline, "v1", batch(ArtifactType::Tagline, 3)).unwrap();
        s.select(ArtifactType::Tagline, 1).unwrap();

        assert!(s.recorded_batch(ArtifactType::Tagline, "v1").is_some());
        assert!(s.recorded_batch(ArtifactType::Tagline, "v2").is_none());
        s.abort().unwrap();
        assert!(s.recorded_batch(ArtifactType::Tagline, "v1").is_none());
    }

    #[test]
    fn restore_marks_chosen_from_picks() {
        let mut s = session();
        s.record_content(Vec::new(), 0).unwrap();
        s.record_batch(ArtifactType::Tagline, "v1", batch(ArtifactType::Tagline, 3)).unwrap();
        s.select(ArtifactType::Tagline, 2).unwrap();

        let snapshot = s.snapshot();
        // Stored as generated, before the pick.
        let stored = batch(ArtifactType::Tagline, 3);
        let restored =
            SelectionSession::restore(snapshot.clone(), vec![(snapshot.batches[0].clone(), stored)], None);

        let flags: Vec<bool> = restored
            .latest_batch(ArtifactType::Tagline)
            .unwrap()
            .iter()
            .map(|c| c.chosen)
            .collect();
        assert_eq!(flags, vec![false, false, true]);
    }
}
