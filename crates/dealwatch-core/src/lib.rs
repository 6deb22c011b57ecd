//! Core deal model, identity derivation and change detection for dealwatch.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One listing entry as scraped during a single cycle. Discarded after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateDeal {
    /// Empty until [`CandidateDeal::assign_identity`] succeeds.
    pub id: String,
    pub title: String,
    pub url: String,
    pub author_name: String,
    pub author_url: String,
    pub thumbnail_url: String,
    pub like_count: u64,
    pub comment_count: u64,
    pub view_count: u64,
    pub published_at: Option<DateTime<Utc>>,
    pub merchant_url: Option<String>,
    pub content: Option<String>,
}

/// Canonical stored record for a known deal, keyed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDeal {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_url: String,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub view_count: u64,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub merchant_url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ai_summary: Option<String>,
    #[serde(default)]
    pub ai_tags: Vec<String>,
}

/// Delivery state derived from the message identity and sync time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationState {
    Unnotified,
    Notified {
        message_id: String,
        synced_at: Option<DateTime<Utc>>,
    },
}

/// Stable key for a deal: UUIDv5 over the UTC publish instant.
///
/// Author edits to title or URL leave the publish instant untouched, so the identity of an edited
/// thread never moves.
pub fn derive_identity(published_at: DateTime<Utc>) -> String {
    let key = format!(
        "dealwatch:published:{}",
        published_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Missing,
    Unparsable,
}

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ViolationKind::Missing => write!(f, "{} is missing", self.field),
            ViolationKind::Unparsable => write!(f, "{} is unparsable", self.field),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid deal {label}: {}", join_violations(.violations))]
pub struct DealInvalid {
    pub label: String,
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CandidateDeal {
    /// Field-level checks. Only an anonymous record (no title and no URL) or one without a
    /// publish time is invalid; everything else is optional.
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        if self.title.trim().is_empty() && self.url.trim().is_empty() {
            violations.push(Violation {
                field: "title_or_url",
                kind: ViolationKind::Missing,
            });
        }
        if self.published_at.is_none() {
            violations.push(Violation {
                field: "published_at",
                kind: ViolationKind::Unparsable,
            });
        }
        violations
    }

    /// Validates and, on success, stamps the derived identity into `id`.
    pub fn assign_identity(&mut self) -> Result<&str, DealInvalid> {
        let violations = self.validate();
        match (violations.is_empty(), self.published_at) {
            (true, Some(published_at)) => {
                self.id = derive_identity(published_at);
                Ok(&self.id)
            }
            _ => Err(DealInvalid {
                label: self.label(),
                violations,
            }),
        }
    }

    /// Human-readable handle for logs and error messages.
    pub fn label(&self) -> String {
        if !self.title.trim().is_empty() {
            self.title.trim().to_string()
        } else if !self.url.trim().is_empty() {
            self.url.trim().to_string()
        } else {
            "<untitled>".to_string()
        }
    }
}

impl PersistedDeal {
    /// Builds the first stored version of a candidate. The candidate must carry a publish time.
    pub fn from_candidate(
        candidate: &CandidateDeal,
        now: DateTime<Utc>,
    ) -> Result<Self, DealInvalid> {
        let Some(published_at) = candidate.published_at else {
            return Err(DealInvalid {
                label: candidate.label(),
                violations: candidate.validate(),
            });
        };
        let id = if candidate.id.is_empty() {
            derive_identity(published_at)
        } else {
            candidate.id.clone()
        };
        Ok(Self {
            id,
            title: candidate.title.clone(),
            url: candidate.url.clone(),
            author_name: candidate.author_name.clone(),
            author_url: candidate.author_url.clone(),
            thumbnail_url: candidate.thumbnail_url.clone(),
            like_count: candidate.like_count,
            comment_count: candidate.comment_count,
            view_count: candidate.view_count,
            published_at,
            merchant_url: candidate.merchant_url.clone(),
            content: candidate.content.clone(),
            message_id: None,
            synced_at: None,
            created_at: now,
            updated_at: now,
            ai_summary: None,
            ai_tags: Vec::new(),
        })
    }

    /// Copies the listing fields of `candidate` over this record.
    ///
    /// Merchant link and content are replaced wholesale when the candidate was enriched this
    /// cycle; otherwise only a link the candidate already carries is taken.
    pub fn merge_candidate(
        &mut self,
        candidate: &CandidateDeal,
        enriched: bool,
        now: DateTime<Utc>,
    ) {
        self.title = candidate.title.clone();
        self.url = candidate.url.clone();
        self.author_name = candidate.author_name.clone();
        self.author_url = candidate.author_url.clone();
        self.thumbnail_url = candidate.thumbnail_url.clone();
        self.like_count = candidate.like_count;
        self.comment_count = candidate.comment_count;
        self.view_count = candidate.view_count;
        if enriched {
            self.merchant_url = candidate.merchant_url.clone();
            self.content = candidate.content.clone();
        } else if candidate.merchant_url.is_some() {
            self.merchant_url = candidate.merchant_url.clone();
        }
        self.updated_at = now;
    }

    pub fn notification_state(&self) -> NotificationState {
        match self.message_id.as_deref() {
            Some(id) if !id.is_empty() => NotificationState::Notified {
                message_id: id.to_string(),
                synced_at: self.synced_at,
            },
            _ => NotificationState::Unnotified,
        }
    }

    /// Records a confirmed first delivery. A message identity, once set, is never replaced.
    pub fn mark_sent(&mut self, message_id: String, now: DateTime<Utc>) {
        if self.message_id.as_deref().is_some_and(|id| !id.is_empty()) {
            return;
        }
        self.message_id = Some(message_id);
        self.synced_at = Some(now);
    }

    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.synced_at = Some(now);
    }
}

/// Which parts of a listing entry moved relative to the stored snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub counters: bool,
    pub content: bool,
    pub link: bool,
    pub merchant: bool,
}

impl ChangeSet {
    pub fn any(&self) -> bool {
        self.counters || self.content || self.link || self.merchant
    }

    /// Only a moved thread URL can change what the detail page resolves to.
    pub fn needs_enrichment(&self) -> bool {
        self.link
    }
}

/// Compares a candidate against its stored snapshot over the fixed comparison set.
pub fn detect_changes(snapshot: &PersistedDeal, candidate: &CandidateDeal) -> ChangeSet {
    ChangeSet {
        counters: snapshot.like_count != candidate.like_count
            || snapshot.comment_count != candidate.comment_count
            || snapshot.view_count != candidate.view_count,
        content: snapshot.title != candidate.title
            || snapshot.author_name != candidate.author_name
            || snapshot.author_url != candidate.author_url
            || snapshot.thumbnail_url != candidate.thumbnail_url,
        link: snapshot.url != candidate.url,
        // The listing page never carries a merchant link; compare only once one is known.
        merchant: candidate
            .merchant_url
            .as_ref()
            .is_some_and(|m| snapshot.merchant_url.as_ref() != Some(m)),
    }
}

/// Field-level update for one stored deal. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealPatch {
    pub id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub author_name: Option<String>,
    pub author_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub view_count: Option<u64>,
    pub merchant_url: Option<Option<String>>,
    pub content: Option<Option<String>>,
    pub message_id: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub ai_summary: Option<Option<String>>,
    pub ai_tags: Option<Vec<String>>,
}

fn changed<T: PartialEq + Clone>(before: &T, after: &T) -> Option<T> {
    (before != after).then(|| after.clone())
}

impl DealPatch {
    /// Minimal patch turning `before` into `after`.
    pub fn between(before: &PersistedDeal, after: &PersistedDeal) -> Self {
        Self {
            id: after.id.clone(),
            title: changed(&before.title, &after.title),
            url: changed(&before.url, &after.url),
            author_name: changed(&before.author_name, &after.author_name),
            author_url: changed(&before.author_url, &after.author_url),
            thumbnail_url: changed(&before.thumbnail_url, &after.thumbnail_url),
            like_count: changed(&before.like_count, &after.like_count),
            comment_count: changed(&before.comment_count, &after.comment_count),
            view_count: changed(&before.view_count, &after.view_count),
            merchant_url: changed(&before.merchant_url, &after.merchant_url),
            content: changed(&before.content, &after.content),
            message_id: changed(&before.message_id, &after.message_id).flatten(),
            synced_at: changed(&before.synced_at, &after.synced_at).flatten(),
            updated_at: changed(&before.updated_at, &after.updated_at),
            ai_summary: changed(&before.ai_summary, &after.ai_summary),
            ai_tags: changed(&before.ai_tags, &after.ai_tags),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self
            == Self {
                id: self.id.clone(),
                ..Self::default()
            }
    }

    /// Applies the patch. An already-set message identity is kept.
    pub fn apply(&self, deal: &mut PersistedDeal) {
        if let Some(v) = &self.title {
            deal.title = v.clone();
        }
        if let Some(v) = &self.url {
            deal.url = v.clone();
        }
        if let Some(v) = &self.author_name {
            deal.author_name = v.clone();
        }
        if let Some(v) = &self.author_url {
            deal.author_url = v.clone();
        }
        if let Some(v) = &self.thumbnail_url {
            deal.thumbnail_url = v.clone();
        }
        if let Some(v) = self.like_count {
            deal.like_count = v;
        }
        if let Some(v) = self.comment_count {
            deal.comment_count = v;
        }
        if let Some(v) = self.view_count {
            deal.view_count = v;
        }
        if let Some(v) = &self.merchant_url {
            deal.merchant_url = v.clone();
        }
        if let Some(v) = &self.content {
            deal.content = v.clone();
        }
        if let Some(v) = &self.message_id {
            if deal.message_id.as_deref().map_or(true, str::is_empty) {
                deal.message_id = Some(v.clone());
            }
        }
        if let Some(v) = self.synced_at {
            deal.synced_at = Some(v);
        }
        if let Some(v) = self.updated_at {
            deal.updated_at = v;
        }
        if let Some(v) = &self.ai_summary {
            deal.ai_summary = v.clone();
        }
        if let Some(v) = &self.ai_tags {
            deal.ai_tags = v.clone();
        }
    }
}
