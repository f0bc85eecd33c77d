//! Field extraction helpers shared by every scraper variant.
//!
//! Fields are read through ordered [`Locator`] tables: the first locator that
//! yields non-empty content wins, so a new site layout is a new table row
//! rather than a new branch.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Selector};
use tracing::debug;

use crate::models::Location;

/// Where to read one field from, relative to a listing card.
///
/// An empty selector addresses the card element itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub selector: &'static str,
    pub attr: Option<&'static str>,
}

impl Locator {
    pub const fn text(selector: &'static str) -> Self {
        Self {
            selector,
            attr: None,
        }
    }

    pub const fn attr(selector: &'static str, attr: &'static str) -> Self {
        Self {
            selector,
            attr: Some(attr),
        }
    }

    fn resolve(&self, card: ElementRef<'_>) -> Option<String> {
        if self.selector.is_empty() {
            return self.read(card);
        }
        let selector = match Selector::parse(self.selector) {
            Ok(selector) => selector,
            Err(e) => {
                debug!("Skipping invalid selector {:?}: {:?}", self.selector, e);
                return None;
            }
        };
        card.select(&selector).find_map(|el| self.read(el))
    }

    fn read(&self, element: ElementRef<'_>) -> Option<String> {
        let value = match self.attr {
            Some(name) => element.value().attr(name)?.trim().to_string(),
            None => collapse_whitespace(&element.text().collect::<String>()),
        };
        (!value.is_empty()).then_some(value)
    }
}

/// Evaluate locators in priority order, stopping at the first hit.
pub fn first_match(card: ElementRef<'_>, rules: &[Locator]) -> Option<String> {
    rules.iter().find_map(|rule| rule.resolve(card))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

static AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(billion|million|thousand|mil|mm|bn|b|m|k)?\b")
        .expect("amount pattern is valid")
});

const UNDISCLOSED_MARKERS: &[&str] = &[
    "not disclosed",
    "undisclosed",
    "disclosed",
    "call",
    "contact",
    "request",
    "n/a",
];

/// Normalize money text to cents.
///
/// Ranges resolve to their lower bound, `k`/`m` suffixes scale the figure, and
/// "not disclosed" style text yields `None` rather than zero.
pub fn parse_money(text: &str) -> Option<i64> {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() || UNDISCLOSED_MARKERS.iter().any(|m| lowered.contains(m)) {
        return None;
    }

    let mut bounds = lowered
        .split(&['-', '–', '—'][..])
        .flat_map(|part| part.split(" to "))
        .filter_map(parse_amount);
    let (lower, lower_scale) = bounds.next()?;
    let scale = match (lower_scale, bounds.next()) {
        // "$1 - 2M" reads as one to two million
        (None, Some((_, Some(upper_scale)))) => upper_scale,
        (scale, _) => scale.unwrap_or(1.0),
    };

    Some((lower * scale * 100.0).round() as i64)
}

fn parse_amount(text: &str) -> Option<(f64, Option<f64>)> {
    let captures = AMOUNT.captures(text)?;
    let value: f64 = captures.get(1)?.as_str().replace(',', "").parse().ok()?;
    let scale = captures.get(2).map(|suffix| match suffix.as_str() {
        "billion" | "bn" | "b" => 1_000_000_000.0,
        "million" | "mil" | "mm" | "m" => 1_000_000.0,
        _ => 1_000.0,
    });
    Some((value, scale))
}

static ZIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{5})(?:-\d{4})?\b").expect("zip pattern is valid"));

/// Split `"City, ST 12345"` style text into its parts.
pub fn parse_location(text: &str) -> Location {
    let text = collapse_whitespace(text);
    let mut location = Location::default();
    if text.is_empty() {
        return location;
    }

    location.zip_code = ZIP.captures(&text).map(|c| c[1].to_string());

    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    if parts.len() >= 2 {
        if !parts[0].is_empty() {
            location.city = Some(parts[0].to_string());
        }
        location.state = parts[1]
            .split_whitespace()
            .next()
            .filter(|token| token.chars().all(|c| c.is_ascii_alphabetic()))
            .map(|token| token.to_uppercase());
    } else if text.len() == 2 && text.chars().all(|c| c.is_ascii_alphabetic()) {
        location.state = Some(text.to_uppercase());
    }

    location
}

/// Recover a source-native id from a listing URL using ordered patterns.
pub fn id_from_url(url: &str, patterns: &[Regex]) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(url).and_then(|c| c.get(1)))
        .map(|m| m.as_str().to_string())
}

static NON_ALNUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("separator pattern is valid"));

/// Last-resort id for a URL no pattern understands.
pub fn url_slug(url: &str) -> String {
    NON_ALNUM.replace_all(url, "-").trim_matches('-').to_string()
}

const BLOCK_MARKERS: &[&str] = &[
    "access denied",
    "captcha",
    "just a moment",
    "attention required",
    "cf-browser-verification",
    "checking your browser",
    "request blocked",
    "are you a robot",
];

/// Detect anti-bot challenge or access-denial pages.
pub fn block_marker(html: &str) -> Option<&'static str> {
    let lowered = html.to_lowercase();
    BLOCK_MARKERS.iter().copied().find(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn slug_ids_are_stable() {
        assert_eq!(
            url_slug("https://www.bizbuysell.com/some-shop/?ref=1"),
            "https-www-bizbuysell-com-some-shop-ref-1"
        );
    }

    #[test]
    fn money_examples() {
        assert_eq!(parse_money("$1,250,000"), Some(125_000_000));
        assert_eq!(parse_money("Call for price"), None);
        assert_eq!(parse_money("$500K"), Some(50_000_000));
        assert_eq!(parse_money("$1M - $2M"), Some(100_000_000));
    }

    #[test]
    fn money_edge_cases() {
        assert_eq!(parse_money("Not Disclosed"), None);
        assert_eq!(parse_money(""), None);
        assert_eq!(parse_money("Asking Price: $1.25 million"), Some(125_000_000));
        assert_eq!(parse_money("$1 - 2M"), Some(100_000_000));
        assert_eq!(parse_money("$250,000 monthly"), Some(25_000_000));
        assert_eq!(parse_money("$0"), Some(0));
        assert_eq!(parse_money("Price TBD"), None);
    }

    #[test]
    fn location_forms() {
        let loc = parse_location("Austin,  tx 78701");
        assert_eq!(loc.city.as_deref(), Some("Austin"));
        assert_eq!(loc.state.as_deref(), Some("TX"));
        assert_eq!(loc.zip_code.as_deref(), Some("78701"));

        let state_only = parse_location("fl");
        assert_eq!(state_only.city, None);
        assert_eq!(state_only.state.as_deref(), Some("FL"));

        assert_eq!(parse_location("  "), Location::default());
    }

    #[test]
    fn ids_come_from_first_matching_pattern() {
        let patterns = vec![
            Regex::new(r"listing-(\d+)").unwrap(),
            Regex::new(r"/(\d+)/?$").unwrap(),
        ];
        assert_eq!(
            id_from_url("/Business-Opportunity/cafe/listing-2214/", &patterns).as_deref(),
            Some("2214")
        );
        assert_eq!(id_from_url("/buy/99887/", &patterns).as_deref(), Some("99887"));
        assert_eq!(id_from_url("/about", &patterns), None);
    }

    #[test]
    fn locators_fall_back_in_order() {
        let html = Html::parse_fragment(
            r#"<div class="card" data-id="77">
                 <span class="title"> </span>
                 <h3><a href="/x">  Corner   Bakery </a></h3>
               </div>"#,
        );
        let card_sel = Selector::parse("div.card").unwrap();
        let card = html.select(&card_sel).next().unwrap();

        let title = first_match(
            card,
            &[Locator::text("span.title"), Locator::text("h3 a")],
        );
        assert_eq!(title.as_deref(), Some("Corner Bakery"));

        let own_attr = first_match(card, &[Locator::attr("", "data-id")]);
        assert_eq!(own_attr.as_deref(), Some("77"));

        assert_eq!(first_match(card, &[Locator::text("p.missing")]), None);
    }

    #[test]
    fn detects_challenge_pages() {
        assert_eq!(
            block_marker("<title>Just a moment...</title>"),
            Some("just a moment")
        );
        assert_eq!(block_marker("<h1>Businesses for sale</h1>"), None);
    }
}
