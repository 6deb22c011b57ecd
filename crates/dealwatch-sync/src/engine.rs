use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealwatch_core::{
    detect_changes, CandidateDeal, ChangeSet, DealInvalid, DealPatch, NotificationState,
    PersistedDeal,
};
use dealwatch_notify::{is_transient, Notifier};
use dealwatch_scrape::{DetailSource, ListingSource};
use dealwatch_storage::{DealStore, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    ContentEnricher, CycleError, CycleReport, EngineOptions, NoopContentEnricher, RecordFailure,
};

/// A validated candidate on its way through one cycle.
struct Pending {
    candidate: CandidateDeal,
    snapshot: Option<PersistedDeal>,
    changes: ChangeSet,
    enriched: bool,
}

impl Pending {
    fn needs_detail(&self) -> bool {
        self.snapshot.is_none() || self.changes.needs_enrichment()
    }
}

/// Runs scrape → reconcile → enrich → notify → persist → trim, one cycle at a time.
pub struct ReconciliationEngine {
    listing: Arc<dyn ListingSource>,
    details: Arc<dyn DetailSource>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn DealStore>,
    content: Arc<dyn ContentEnricher>,
    options: EngineOptions,
    in_flight: Mutex<()>,
}

impl ReconciliationEngine {
    pub fn new(
        listing: Arc<dyn ListingSource>,
        details: Arc<dyn DetailSource>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn DealStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            listing,
            details,
            notifier,
            store,
            content: Arc::new(NoopContentEnricher),
            options,
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_content_enricher(mut self, content: Arc<dyn ContentEnricher>) -> Self {
        self.content = content;
        self
    }

    pub async fn reconcile(&self) -> Result<CycleReport, CycleError> {
        self.reconcile_at(Utc::now()).await
    }

    /// Runs one cycle as of `now`. A trigger arriving mid-cycle returns a skipped report.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            info!("cycle already running; trigger skipped");
            return Ok(CycleReport::skipped(now));
        };
        let span = info_span!("reconcile", cycle_id = %Uuid::new_v4());
        self.run_cycle(now).instrument(span).await
    }

    async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport {
            started_at: Some(now),
            ..CycleReport::default()
        };
        let mut failures = Vec::new();

        let scraped = self.listing.scrape_list().await?;
        report.scraped = scraped.len();
        let candidates = identify(scraped, &mut report, &mut failures);

        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let mut snapshots = if ids.is_empty() {
            HashMap::new()
        } else {
            match self.store.get_by_ids(&ids).await {
                Ok(found) => found,
                Err(error) => {
                    warn!(error = %error, "batch read failed; treating every candidate as new");
                    report.degraded_read = true;
                    HashMap::new()
                }
            }
        };

        let mut pending = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match snapshots.remove(&candidate.id) {
                None => {
                    report.new += 1;
                    pending.push(Pending {
                        candidate,
                        snapshot: None,
                        changes: ChangeSet::default(),
                        enriched: false,
                    });
                }
                Some(snapshot) => {
                    let changes = detect_changes(&snapshot, &candidate);
                    let unnotified = snapshot.notification_state() == NotificationState::Unnotified;
                    if changes.any() {
                        report.changed += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    if changes.any() || unnotified {
                        pending.push(Pending {
                            candidate,
                            snapshot: Some(snapshot),
                            changes,
                            enriched: false,
                        });
                    }
                }
            }
        }

        self.enrich(&mut pending, &mut report).await;

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for item in pending {
            match item.snapshot {
                None => match self.prepare_create(&item.candidate, now, &mut report).await {
                    Ok(record) => creates.push(record),
                    Err(invalid) => failures.push(RecordFailure::Invalid(invalid)),
                },
                Some(snapshot) => {
                    let patch = self
                        .prepare_update(
                            snapshot,
                            &item.candidate,
                            item.changes,
                            item.enriched,
                            now,
                            &mut report,
                        )
                        .await;
                    updates.extend(patch);
                }
            }
        }

        let outcome = self.store.batch_write(creates, updates).await;
        report.created = outcome.created.len();
        report.updated = outcome.updated.len();
        failures.extend(outcome.failures.into_iter().map(|f| RecordFailure::Store {
            id: f.id,
            source: f.error,
        }));
        for attempted in outcome.conflicts {
            match self.recover_conflict(attempted).await {
                Ok(()) => report.conflicts_recovered += 1,
                Err(failure) => failures.push(failure),
            }
        }

        if report.created > 0 {
            match self.store.trim_oldest(self.options.retention_cap).await {
                Ok(removed) => report.trimmed = removed,
                Err(error) => {
                    warn!(error = %error, "retention trim failed");
                    failures.push(RecordFailure::Trim(error));
                }
            }
        } else {
            debug!("no new deals written; retention trim skipped");
        }

        report.write_failures = failures
            .iter()
            .filter(|f| matches!(f, RecordFailure::Store { .. }))
            .count();
        report.finished_at = Some(Utc::now());
        info!(
            scraped = report.scraped,
            new = report.new,
            changed = report.changed,
            created = report.created,
            updated = report.updated,
            sent = report.sent,
            updates_sent = report.updates_sent,
            trimmed = report.trimmed,
            failures = failures.len(),
            "cycle complete"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(CycleError::Records(failures))
        }
    }

    /// Fetches detail pages for new deals and deals whose thread URL moved.
    async fn enrich(&self, pending: &mut [Pending], report: &mut CycleReport) {
        let mut batch: Vec<CandidateDeal> = pending
            .iter()
            .filter(|p| p.needs_detail())
            .map(|p| p.candidate.clone())
            .collect();
        if batch.is_empty() {
            return;
        }

        let outcome = self.details.fetch_details(&mut batch).await;
        report.enriched = outcome.resolved;
        report.enrichment_failed = outcome.failed_ids.len();

        let failed: HashSet<&str> = outcome.failed_ids.iter().map(String::as_str).collect();
        for (slot, candidate) in pending.iter_mut().filter(|p| p.needs_detail()).zip(batch) {
            slot.enriched = !failed.contains(candidate.id.as_str());
            slot.candidate = candidate;
        }
    }

    async fn prepare_create(
        &self,
        candidate: &CandidateDeal,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<PersistedDeal, DealInvalid> {
        let mut record = PersistedDeal::from_candidate(candidate, now)?;
        match self.content.summarize(&record).await {
            Ok(Some(extra)) => {
                record.ai_summary = Some(extra.summary);
                record.ai_tags = extra.tags;
            }
            Ok(None) => {}
            Err(error) => {
                warn!(id = record.id.as_str(), error = %error, "content enrichment failed")
            }
        }
        self.deliver_create(&mut record, now, report).await;
        Ok(record)
    }

    async fn deliver_create(
        &self,
        record: &mut PersistedDeal,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        match self.notifier.send(record).await {
            Ok(message_id) => {
                record.mark_sent(message_id, now);
                report.sent += 1;
            }
            Err(error) => {
                report.send_failed += 1;
                warn!(
                    id = record.id.as_str(),
                    transient = is_transient(&error),
                    error = %error,
                    "notification send failed; retrying next cycle"
                );
            }
        }
    }

    /// Merges changes into the snapshot and decides on delivery.
    /// Returns the patch to persist, if any.
    async fn prepare_update(
        &self,
        snapshot: PersistedDeal,
        candidate: &CandidateDeal,
        changes: ChangeSet,
        enriched: bool,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Option<DealPatch> {
        let mut record = snapshot.clone();
        if changes.any() {
            record.merge_candidate(candidate, enriched, now);
        }

        match record.notification_state() {
            NotificationState::Unnotified => self.deliver_create(&mut record, now, report).await,
            NotificationState::Notified { message_id, synced_at } if changes.any() => {
                if self.update_due(synced_at, now) {
                    match self.notifier.update(&message_id, &record).await {
                        Ok(()) => {
                            record.mark_synced(now);
                            report.updates_sent += 1;
                        }
                        Err(error) => {
                            report.update_failed += 1;
                            warn!(
                                id = record.id.as_str(),
                                error = %error,
                                "notification update failed"
                            );
                        }
                    }
                } else {
                    report.deferred += 1;
                    debug!(id = record.id.as_str(), "update inside throttle window; deferred");
                }
            }
            NotificationState::Notified { .. } => {}
        }

        let patch = DealPatch::between(&snapshot, &record);
        (!patch.is_empty()).then_some(patch)
    }

    fn update_due(&self, synced_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        synced_at.map_or(true, |last| {
            (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.options.min_update_interval)
        })
    }

    /// A create lost a race with another writer: re-read and fold our version in as an update.
    async fn recover_conflict(&self, attempted: PersistedDeal) -> Result<(), RecordFailure> {
        let id = attempted.id.clone();
        let store_failure = |source: StoreError| RecordFailure::Store {
            id: id.clone(),
            source,
        };

        let current = self
            .store
            .get_by_id(&id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| store_failure(StoreError::NotFound { id: id.clone() }))?;

        let mut target = attempted;
        target.created_at = current.created_at;
        if target.merchant_url.is_none() {
            target.merchant_url = current.merchant_url.clone();
        }
        if target.content.is_none() {
            target.content = current.content.clone();
        }
        if target.ai_summary.is_none() {
            target.ai_summary = current.ai_summary.clone();
            target.ai_tags = current.ai_tags.clone();
        }
        if target.synced_at.is_none() {
            target.synced_at = current.synced_at;
        }

        let patch = DealPatch::between(&current, &target);
        if !patch.is_empty() {
            self.store.update(&patch).await.map_err(store_failure)?;
        }
        debug!(id = id.as_str(), "create race resolved as update");
        Ok(())
    }
}

/// Validates and stamps identities.
/// Invalid rows become failures; repeated identities keep the first.
fn identify(
    scraped: Vec<CandidateDeal>,
    report: &mut CycleReport,
    failures: &mut Vec<RecordFailure>,
) -> Vec<CandidateDeal> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(scraped.len());
    for mut candidate in scraped {
        if let Err(invalid) = candidate.assign_identity() {
            report.invalid += 1;
            warn!(error = %invalid, "dropping invalid listing record");
            failures.push(RecordFailure::Invalid(invalid));
            continue;
        }
        if !seen.insert(candidate.id.clone()) {
            report.duplicates += 1;
            debug!(id = candidate.id.as_str(), "duplicate identity in one scrape; keeping first");
            continue;
        }
        out.push(candidate);
    }
    out
}
