//! Referral cleanup for resolved merchant links.

use serde::{Deserialize, Serialize};
use url::Url;

/// Nested redirector hops are unwrapped at most this many times.
const MAX_UNWRAP_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectorRule {
    pub domain: String,
    /// Query parameter carrying the encoded destination.
    pub param: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetailerRule {
    pub domain: String,
    pub tag_param: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralRules {
    #[serde(default)]
    pub redirectors: Vec<RedirectorRule>,
    #[serde(default)]
    pub retailers: Vec<RetailerRule>,
    /// Operator tag written onto retailer links; links lose any tag when unset.
    #[serde(default)]
    pub affiliate_tag: Option<String>,
}

impl Default for ReferralRules {
    fn default() -> Self {
        let redirector = |domain: &str, param: &str| RedirectorRule {
            domain: domain.to_string(),
            param: param.to_string(),
        };
        let retailer = |domain: &str| RetailerRule {
            domain: domain.to_string(),
            tag_param: "tag".to_string(),
        };
        Self {
            redirectors: vec![
                redirector("go.redirectingat.com", "url"),
                redirector("go.skimresources.com", "url"),
                redirector("click.linksynergy.com", "murl"),
                redirector("l.facebook.com", "u"),
            ],
            retailers: vec![
                retailer("amazon.com"),
                retailer("amazon.co.uk"),
                retailer("amazon.de"),
                retailer("amazon.co.jp"),
            ],
            affiliate_tag: None,
        }
    }
}

pub(crate) fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim().to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

impl ReferralRules {
    pub fn with_affiliate_tag(mut self, tag: Option<String>) -> Self {
        self.affiliate_tag = tag.filter(|t| !t.trim().is_empty());
        self
    }

    /// Unwraps redirectors, then rewrites retailer tracking tags. Unparsable or unrecognized
    /// links are returned unchanged.
    pub fn clean(&self, raw: &str) -> String {
        let Ok(mut url) = Url::parse(raw) else {
            return raw.to_string();
        };

        for _ in 0..MAX_UNWRAP_DEPTH {
            match self.unwrap_redirector(&url) {
                Some(next) => url = next,
                None => break,
            }
        }

        let host = url.host_str().unwrap_or_default().to_string();
        if let Some(rule) = self.retailers.iter().find(|r| host_matches(&host, &r.domain)) {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != rule.tag_param.as_str())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if kept.is_empty() && self.affiliate_tag.is_none() {
                url.set_query(None);
            } else {
                let mut query = url.query_pairs_mut();
                query.clear();
                query.extend_pairs(kept);
                if let Some(tag) = &self.affiliate_tag {
                    query.append_pair(&rule.tag_param, tag);
                }
            }
        }

        url.to_string()
    }

    fn unwrap_redirector(&self, url: &Url) -> Option<Url> {
        let host = url.host_str()?;
        let rule = self.redirectors.iter().find(|r| host_matches(host, &r.domain))?;
        let destination = url
            .query_pairs()
            .find(|(k, _)| k == rule.param.as_str())
            .map(|(_, v)| v.into_owned())?;
        let next = Url::parse(&destination).ok()?;
        matches!(next.scheme(), "http" | "https").then_some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(tag: Option<&str>) -> ReferralRules {
        ReferralRules::default().with_affiliate_tag(tag.map(ToString::to_string))
    }

    #[test]
    fn redirector_is_unwrapped_to_decoded_destination() {
        let cleaned = rules(None).clean(
            "https://go.redirectingat.com/?id=77&url=https%3A%2F%2Fshop.example%2Fitem%3Fsku%3D9",
        );
        assert_eq!(cleaned, "https://shop.example/item?sku=9");
    }

    #[test]
    fn retailer_tag_is_replaced_with_operator_tag() {
        let cleaned =
            rules(Some("ours-20")).clean("https://www.amazon.com/dp/B0TEST?tag=poster-21&psc=1");
        assert_eq!(cleaned, "https://www.amazon.com/dp/B0TEST?psc=1&tag=ours-20");
    }

    #[test]
    fn retailer_tag_is_dropped_without_operator_tag() {
        let cleaned = rules(None).clean("https://amazon.co.uk/dp/B0TEST?tag=poster-21");
        assert_eq!(cleaned, "https://amazon.co.uk/dp/B0TEST");
    }

    #[test]
    fn nested_redirector_into_retailer() {
        let wrapped = concat!(
            "https://go.redirectingat.com/?url=",
            "https%3A%2F%2Fwww.amazon.com%2Fdp%2FB0TEST%3Ftag%3Dposter-21"
        );
        let cleaned = rules(Some("ours-20")).clean(wrapped);
        assert_eq!(cleaned, "https://www.amazon.com/dp/B0TEST?tag=ours-20");
    }

    #[test]
    fn unknown_domains_and_garbage_pass_through() {
        let r = rules(Some("ours-20"));
        assert_eq!(
            r.clean("https://shop.example/item?tag=keep&ref=x"),
            "https://shop.example/item?tag=keep&ref=x"
        );
        assert_eq!(r.clean("not a url"), "not a url");
        assert!(!host_matches("notamazon.com", "amazon.com"));
    }
}
