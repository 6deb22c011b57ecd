//! Webhook embed rendering.

use chrono::SecondsFormat;
use dealwatch_core::PersistedDeal;
use serde::Serialize;

pub const MAX_TITLE_CHARS: usize = 256;
pub const MAX_DESCRIPTION_CHARS: usize = 4096;
pub const MAX_FOOTER_CHARS: usize = 2048;

/// Engagement per view. Zero when the view counter is zero.
pub fn heat_score(likes: u64, comments: u64, views: u64) -> f64 {
    if views == 0 {
        return 0.0;
    }
    (likes as f64 + comments as f64) / views as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatTier {
    Mild,
    Warm,
    Hot,
    Scorching,
}

impl HeatTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.20 {
            Self::Scorching
        } else if score >= 0.10 {
            Self::Hot
        } else if score >= 0.05 {
            Self::Warm
        } else {
            Self::Mild
        }
    }

    pub fn for_deal(deal: &PersistedDeal) -> Self {
        Self::from_score(heat_score(deal.like_count, deal.comment_count, deal.view_count))
    }

    pub fn color(self) -> u32 {
        match self {
            Self::Mild => 0x95a5a6,
            Self::Warm => 0xf1c40f,
            Self::Hot => 0xe67e22,
            Self::Scorching => 0xe74c3c,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Mild => "mild",
            Self::Warm => "warm",
            Self::Hot => "hot",
            Self::Scorching => "scorching",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn embed_title(deal: &PersistedDeal) -> String {
    let suffix = format!(
        " ({}/{}/{})",
        deal.like_count, deal.comment_count, deal.view_count
    );
    let room = MAX_TITLE_CHARS.saturating_sub(suffix.chars().count());
    format!("{}{suffix}", truncate_with_ellipsis(&deal.title, room))
}

fn embed_description(deal: &PersistedDeal) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(merchant) = deal.merchant_url.as_deref().filter(|m| !m.is_empty()) {
        lines.push(format!("[Go to deal]({merchant})"));
    }
    if let Some(summary) = deal.ai_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        lines.push(summary.to_string());
    }
    (!lines.is_empty()).then(|| truncate_with_ellipsis(&lines.join("\n"), MAX_DESCRIPTION_CHARS))
}

pub fn render_embed(deal: &PersistedDeal) -> Embed {
    let tier = HeatTier::for_deal(deal);
    let footer = if deal.author_name.trim().is_empty() {
        format!("heat: {}", tier.label())
    } else {
        format!("{} | heat: {}", deal.author_name.trim(), tier.label())
    };

    Embed {
        title: embed_title(deal),
        url: deal.url.clone(),
        description: embed_description(deal),
        timestamp: deal.published_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        color: tier.color(),
        thumbnail: (!deal.thumbnail_url.is_empty()).then(|| EmbedImage {
            url: deal.thumbnail_url.clone(),
        }),
        footer: Some(EmbedFooter {
            text: truncate_with_ellipsis(&footer, MAX_FOOTER_CHARS),
        }),
    }
}

pub fn render_payload(deal: &PersistedDeal) -> WebhookPayload {
    WebhookPayload {
        embeds: vec![render_embed(deal)],
    }
}
