//! Selector configuration: YAML data compiled once into immutable selector chains.

use std::path::Path;

use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::referral::ReferralRules;

#[derive(Debug, Error)]
pub enum SelectorConfigError {
    #[error("reading selector file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing selector file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("selector chain for {field} is empty")]
    Empty { field: &'static str },
    #[error("invalid selector {selector:?} for {field}: {reason}")]
    Invalid {
        field: &'static str,
        selector: String,
        reason: String,
    },
}

/// One entry of a fallback chain: a selector, optionally reading an attribute instead of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSpec {
    Text(String),
    Rule {
        selector: String,
        #[serde(default)]
        attr: Option<String>,
    },
}

impl RuleSpec {
    fn attr(selector: &str, attr: &str) -> Self {
        RuleSpec::Rule {
            selector: selector.to_string(),
            attr: Some(attr.to_string()),
        }
    }

    fn text(selector: &str) -> Self {
        RuleSpec::Text(selector.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListingSelectorSpec {
    pub item: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    pub title: Vec<RuleSpec>,
    pub url: Vec<RuleSpec>,
    #[serde(default)]
    pub author_name: Vec<RuleSpec>,
    #[serde(default)]
    pub author_url: Vec<RuleSpec>,
    #[serde(default)]
    pub thumbnail: Vec<RuleSpec>,
    #[serde(default)]
    pub likes: Vec<RuleSpec>,
    #[serde(default)]
    pub comments: Vec<RuleSpec>,
    #[serde(default)]
    pub views: Vec<RuleSpec>,
    pub published: Vec<RuleSpec>,
}

impl Default for ListingSelectorSpec {
    fn default() -> Self {
        Self {
            item: vec!["li.deal-item".to_string(), "div.deal-item".to_string()],
            ignore: vec![".notice".to_string(), ".sponsored".to_string(), ".pinned".to_string()],
            title: vec![RuleSpec::text(".deal-title a"), RuleSpec::text(".deal-title")],
            url: vec![RuleSpec::attr(".deal-title a[href]", "href")],
            author_name: vec![RuleSpec::text(".deal-author a"), RuleSpec::text(".deal-author")],
            author_url: vec![RuleSpec::attr(".deal-author a[href]", "href")],
            thumbnail: vec![
                RuleSpec::attr(".deal-thumb img[src]", "src"),
                RuleSpec::attr(".deal-thumb img[data-src]", "data-src"),
            ],
            likes: vec![RuleSpec::text(".deal-likes")],
            comments: vec![RuleSpec::text(".deal-comments"), RuleSpec::text(".deal-reply-count")],
            views: vec![RuleSpec::text(".deal-views")],
            published: vec![
                RuleSpec::attr("time[datetime]", "datetime"),
                RuleSpec::text(".deal-date"),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailSelectorSpec {
    pub deal_link: Vec<RuleSpec>,
    #[serde(default)]
    pub fallback_link: Vec<String>,
    #[serde(default)]
    pub content: Vec<RuleSpec>,
}

impl Default for DetailSelectorSpec {
    fn default() -> Self {
        Self {
            deal_link: vec![
                RuleSpec::attr("a.get-deal[href]", "href"),
                RuleSpec::attr(".deal-link a[href]", "href"),
            ],
            fallback_link: vec![".post-content a[href]".to_string()],
            content: vec![RuleSpec::text(".post-content")],
        }
    }
}

/// On-disk selector file. Every section is optional and falls back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorConfig {
    #[serde(default)]
    pub listing: ListingSelectorSpec,
    #[serde(default)]
    pub detail: DetailSelectorSpec,
    #[serde(default)]
    pub referral: ReferralRules,
}

impl SelectorConfig {
    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, SelectorConfigError> {
        serde_yaml::from_str(text).map_err(|source| SelectorConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Reads and compiles `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<CompiledSelectors, SelectorConfigError> {
        let config = match path {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).map_err(|source| SelectorConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                Self::from_yaml(&text, &path.display().to_string())?
            }
            None => Self::default(),
        };
        config.compile()
    }

    /// Compiles every selector up front so a bad one fails here, never mid-scrape.
    pub fn compile(&self) -> Result<CompiledSelectors, SelectorConfigError> {
        let l = &self.listing;
        let d = &self.detail;
        Ok(CompiledSelectors {
            listing: ListingSelectors {
                item: compile_list("listing.item", &l.item)?,
                ignore: l
                    .ignore
                    .iter()
                    .map(|s| compile_one("listing.ignore", s))
                    .collect::<Result<_, _>>()?,
                title: FieldChain::compile("listing.title", &l.title, true)?,
                url: FieldChain::compile("listing.url", &l.url, true)?,
                author_name: FieldChain::compile("listing.author_name", &l.author_name, false)?,
                author_url: FieldChain::compile("listing.author_url", &l.author_url, false)?,
                thumbnail: FieldChain::compile("listing.thumbnail", &l.thumbnail, false)?,
                likes: FieldChain::compile("listing.likes", &l.likes, false)?,
                comments: FieldChain::compile("listing.comments", &l.comments, false)?,
                views: FieldChain::compile("listing.views", &l.views, false)?,
                published: FieldChain::compile("listing.published", &l.published, true)?,
            },
            detail: DetailSelectors {
                deal_link: FieldChain::compile("detail.deal_link", &d.deal_link, true)?,
                fallback_link: d
                    .fallback_link
                    .iter()
                    .map(|s| compile_one("detail.fallback_link", s))
                    .collect::<Result<_, _>>()?,
                content: FieldChain::compile("detail.content", &d.content, false)?,
            },
            referral: self.referral.clone(),
        })
    }
}

fn compile_one(field: &'static str, selector: &str) -> Result<Selector, SelectorConfigError> {
    if selector.trim().is_empty() {
        return Err(SelectorConfigError::Empty { field });
    }
    Selector::parse(selector).map_err(|e| SelectorConfigError::Invalid {
        field,
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn compile_list(
    field: &'static str,
    selectors: &[String],
) -> Result<Vec<Selector>, SelectorConfigError> {
    if selectors.is_empty() {
        return Err(SelectorConfigError::Empty { field });
    }
    selectors.iter().map(|s| compile_one(field, s)).collect()
}

#[derive(Debug, Clone)]
struct CompiledRule {
    selector: Selector,
    attr: Option<String>,
}

/// Ordered fallback chain; the first rule producing non-empty output wins.
#[derive(Debug, Clone, Default)]
pub struct FieldChain {
    rules: Vec<CompiledRule>,
}

impl FieldChain {
    fn compile(
        field: &'static str,
        specs: &[RuleSpec],
        required: bool,
    ) -> Result<Self, SelectorConfigError> {
        if required && specs.is_empty() {
            return Err(SelectorConfigError::Empty { field });
        }
        let rules = specs
            .iter()
            .map(|spec| -> Result<CompiledRule, SelectorConfigError> {
                let (selector, attr) = match spec {
                    RuleSpec::Text(selector) => (selector, None),
                    RuleSpec::Rule { selector, attr } => (selector, attr.clone()),
                };
                Ok(CompiledRule {
                    selector: compile_one(field, selector)?,
                    attr,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    pub fn extract(&self, scope: ElementRef<'_>) -> Option<String> {
        self.rules.iter().find_map(|rule| {
            scope.select(&rule.selector).find_map(|node| {
                let raw = match &rule.attr {
                    Some(attr) => node.value().attr(attr).map(ToString::to_string),
                    None => Some(node.text().collect::<String>()),
                };
                raw.map(|s| collapse_whitespace(&s)).filter(|s| !s.is_empty())
            })
        })
    }
}

pub(crate) fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct ListingSelectors {
    pub item: Vec<Selector>,
    pub ignore: Vec<Selector>,
    pub title: FieldChain,
    pub url: FieldChain,
    pub author_name: FieldChain,
    pub author_url: FieldChain,
    pub thumbnail: FieldChain,
    pub likes: FieldChain,
    pub comments: FieldChain,
    pub views: FieldChain,
    pub published: FieldChain,
}

#[derive(Debug, Clone)]
pub struct DetailSelectors {
    pub deal_link: FieldChain,
    pub fallback_link: Vec<Selector>,
    pub content: FieldChain,
}

/// Immutable, validated selector set injected into the scraper and enricher.
#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    pub listing: ListingSelectors,
    pub detail: DetailSelectors,
    pub referral: ReferralRules,
}
