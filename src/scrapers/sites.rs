//! Per-site knowledge expressed as data.
//!
//! A [`SiteProfile`] says where a site's results live, how its cards are
//! marked up and how to page through them. Both scraper variants read the same
//! profile, so switching a source between static and browser fetching is a
//! configuration change.

use std::collections::HashSet;

use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::crawl::Page;
use super::extract::{
    collapse_whitespace, first_match, id_from_url, parse_location, parse_money, url_slug, Locator,
};
use crate::models::Listing;

/// Ordered locators for each listing field
#[derive(Debug)]
pub struct FieldRules {
    pub link: &'static [Locator],
    pub external_id: &'static [Locator],
    pub title: &'static [Locator],
    pub description: &'static [Locator],
    pub asking_price: &'static [Locator],
    pub cash_flow: &'static [Locator],
    pub revenue: &'static [Locator],
    pub location: &'static [Locator],
    pub industry: &'static [Locator],
}

/// Where to look when no card selector matches, e.g. on a rendered page
/// whose card markup changed.
#[derive(Debug)]
pub struct Fallback {
    /// Read schema.org `ItemList` entries from JSON-LD scripts
    pub json_ld: bool,
    /// Detail links scanned for an id and anchor-text title
    pub links: Option<&'static str>,
    /// Shorter anchor text is navigation rather than a title
    pub min_title_len: usize,
}

#[derive(Debug)]
pub struct SiteProfile {
    pub slug: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    pub start_path: &'static str,
    /// Path template for numbered pages, `{n}` is the 1-based page number
    pub page_path: Option<&'static str>,
    pub page_size: usize,
    /// Card selectors; the first one matching anything wins
    pub cards: &'static [&'static str],
    pub next_page: &'static [Locator],
    /// Patterns recovering the external id from a detail URL
    pub id_patterns: &'static [&'static str],
    pub fields: FieldRules,
    pub fallback: Fallback,
}

pub static BIZBUYSELL: SiteProfile = SiteProfile {
    slug: "bizbuysell",
    name: "BizBuySell",
    base_url: "https://www.bizbuysell.com",
    start_path: "/businesses-for-sale/",
    page_path: Some("/businesses-for-sale/{n}/"),
    page_size: 20,
    cards: &[
        "div.listing, div.listing-card, article.listing",
        "div[data-listing-id]",
    ],
    next_page: &[Locator::attr("a.next, a[rel='next']", "href")],
    id_patterns: &[r"listing-(\d+)", r"-(\d+)\.aspx", r"/(\d+)/?$"],
    fields: FieldRules {
        link: &[
            Locator::attr("a.title", "href"),
            Locator::attr("a.listing-title", "href"),
            Locator::attr("h3 a", "href"),
            Locator::attr("a[href*='/Business-Opportunity/']", "href"),
        ],
        external_id: &[Locator::attr("", "data-listing-id")],
        title: &[
            Locator::text("a.title"),
            Locator::text("a.listing-title"),
            Locator::text("h3 a"),
            Locator::text("h2"),
        ],
        description: &[Locator::text(
            ".listing-description, .description, p.desc",
        )],
        asking_price: &[
            Locator::text(".price, .asking-price, .listing-price"),
            Locator::attr("span[data-price]", "data-price"),
        ],
        cash_flow: &[
            Locator::text(".cash-flow, .cashflow"),
            Locator::attr("[data-cashflow]", "data-cashflow"),
        ],
        revenue: &[
            Locator::text(".revenue, .gross-revenue"),
            Locator::attr("[data-revenue]", "data-revenue"),
        ],
        location: &[Locator::text(".location, .listing-location, .city-state")],
        industry: &[Locator::text(".category, .industry, .listing-category")],
    },
    fallback: Fallback {
        json_ld: true,
        links: Some("a[href*='/Business-Opportunity/']"),
        min_title_len: 5,
    },
};

pub static BIZQUEST: SiteProfile = SiteProfile {
    slug: "bizquest",
    name: "BizQuest",
    base_url: "https://www.bizquest.com",
    start_path: "/businesses-for-sale/",
    page_path: None,
    page_size: 20,
    cards: &["div.listing-item, article.listing, div.search-result-item"],
    next_page: &[
        Locator::attr("a.next, a[rel='next']", "href"),
        Locator::attr(".pagination a:last-child", "href"),
    ],
    id_patterns: &[r"/detail/(\d+)", r"/listing/(\d+)", r"-(\d+)/?$"],
    fields: FieldRules {
        link: &[
            Locator::attr("a.listing-title", "href"),
            Locator::attr("h3 a", "href"),
            Locator::attr("a[href*='/business-for-sale/']", "href"),
        ],
        external_id: &[Locator::attr("", "data-id")],
        title: &[
            Locator::text("a.listing-title"),
            Locator::text("h3 a"),
            Locator::text("h2"),
            Locator::text(".title"),
        ],
        description: &[Locator::text(".description, .listing-description, p.summary")],
        asking_price: &[Locator::text(".price, .asking-price")],
        cash_flow: &[Locator::text(".cash-flow, .cashflow")],
        revenue: &[Locator::text(".revenue, .gross-revenue")],
        location: &[Locator::text(".location, .listing-location")],
        industry: &[Locator::text(".category, .industry")],
    },
    fallback: Fallback {
        json_ld: true,
        links: None,
        min_title_len: 5,
    },
};

/// Every site the crate knows how to read
pub static ALL: &[&SiteProfile] = &[&BIZBUYSELL, &BIZQUEST];

pub fn profile(slug: &str) -> Option<&'static SiteProfile> {
    ALL.iter().copied().find(|p| p.slug == slug)
}

impl SiteProfile {
    pub fn start_url(&self) -> String {
        format!("{}{}", self.base_url, self.start_path)
    }

    pub fn page_url(&self, page_number: usize) -> Option<String> {
        if page_number <= 1 {
            return Some(self.start_url());
        }
        self.page_path.map(|path| {
            format!(
                "{}{}",
                self.base_url,
                path.replace("{n}", &page_number.to_string())
            )
        })
    }

    /// Resolve a possibly relative link against the site root.
    pub fn absolute(&self, href: &str) -> Option<String> {
        let base = Url::parse(self.base_url).ok()?;
        base.join(href).ok().map(String::from)
    }

    fn id_regexes(&self) -> Vec<Regex> {
        self.id_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("{}: ignoring bad id pattern {:?}: {}", self.slug, pattern, e);
                    None
                }
            })
            .collect()
    }

    /// Parse one results page into candidate listings and the next-page link.
    pub fn extract_page(&self, page_url: &str, html: &str) -> Page {
        let document = Html::parse_document(html);
        let id_patterns = self.id_regexes();

        let cards: Vec<ElementRef<'_>> = self
            .cards
            .iter()
            .filter_map(|raw| Selector::parse(raw).ok())
            .map(|selector| document.select(&selector).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default();
        debug!("{}: {} card(s) on {}", self.slug, cards.len(), page_url);

        let candidates = if cards.is_empty() {
            self.extract_fallback(&document, &id_patterns, page_url)
        } else {
            cards
                .into_iter()
                .filter_map(|card| self.extract_card(card, &id_patterns, page_url))
                .collect()
        };

        let next_url = first_next_link(document.root_element(), self.next_page)
            .and_then(|href| self.absolute(&href))
            .filter(|next| next != page_url);

        Page {
            candidates,
            next_url,
        }
    }

    /// Build one candidate from a card. Cards without an id or title are
    /// discarded.
    pub fn extract_card(
        &self,
        card: ElementRef<'_>,
        id_patterns: &[Regex],
        page_url: &str,
    ) -> Option<Listing> {
        let fields = &self.fields;
        let url = first_match(card, fields.link).and_then(|href| self.absolute(&href));

        let external_id = first_match(card, fields.external_id)
            .or_else(|| url.as_deref().and_then(|u| id_from_url(u, id_patterns)));
        let title = first_match(card, fields.title);
        let (external_id, title) = match (external_id, title) {
            (Some(id), Some(title)) => (id, title),
            (id, title) => {
                debug!(
                    "{}: discarding card (id: {:?}, title: {:?})",
                    self.slug, id, title
                );
                return None;
            }
        };

        let price_text = first_match(card, fields.asking_price);
        let location_text = first_match(card, fields.location);
        let card_text = card.text().collect::<String>().to_lowercase();

        let mut location = location_text
            .as_deref()
            .map(parse_location)
            .unwrap_or_default();
        location.country = Some("US".to_string());

        let mut listing = Listing::new(external_id, title);
        listing.url = url.unwrap_or_default();
        listing.description = first_match(card, fields.description);
        listing.asking_price = price_text.as_deref().and_then(parse_money);
        listing.cash_flow = first_match(card, fields.cash_flow)
            .as_deref()
            .and_then(parse_money);
        listing.revenue = first_match(card, fields.revenue)
            .as_deref()
            .and_then(parse_money);
        listing.location = location;
        listing.industry = first_match(card, fields.industry);
        listing.is_franchise = card_text.contains("franchise");
        listing.real_estate_included = card_text.contains("real estate included");
        listing.raw_data = json!({
            "source": self.slug,
            "page_url": page_url,
            "price_text": price_text,
            "location_text": location_text,
        });

        Some(listing)
    }

    /// Candidates from JSON-LD item lists, then from bare detail links.
    /// Ids repeated across both are kept once.
    fn extract_fallback(
        &self,
        document: &Html,
        id_patterns: &[Regex],
        page_url: &str,
    ) -> Vec<Listing> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        if self.fallback.json_ld {
            for listing in self.json_ld_listings(document, id_patterns, page_url) {
                if seen.insert(listing.external_id.clone()) {
                    candidates.push(listing);
                }
            }
        }

        if let Some(raw) = self.fallback.links {
            match Selector::parse(raw) {
                Ok(selector) => {
                    for link in document.select(&selector) {
                        let Some(listing) = self.link_listing(link, id_patterns, page_url) else {
                            continue;
                        };
                        if seen.insert(listing.external_id.clone()) {
                            candidates.push(listing);
                        }
                    }
                }
                Err(e) => warn!("{}: bad link selector {:?}: {:?}", self.slug, raw, e),
            }
        }

        if !candidates.is_empty() {
            debug!(
                "{}: no cards on {}, recovered {} listing(s) from page data",
                self.slug,
                page_url,
                candidates.len()
            );
        }
        candidates
    }

    fn json_ld_listings(
        &self,
        document: &Html,
        id_patterns: &[Regex],
        page_url: &str,
    ) -> Vec<Listing> {
        let Ok(selector) = Selector::parse("script[type='application/ld+json']") else {
            return Vec::new();
        };

        let mut listings = Vec::new();
        for script in document.select(&selector) {
            let raw = script.text().collect::<String>();
            let data: Value = match serde_json::from_str(&raw) {
                Ok(data) => data,
                Err(e) => {
                    debug!("{}: unreadable JSON-LD on {}: {}", self.slug, page_url, e);
                    continue;
                }
            };
            let blocks = match data {
                Value::Array(blocks) => blocks,
                block => vec![block],
            };
            for block in &blocks {
                let Some(items) = block.get("itemListElement").and_then(Value::as_array) else {
                    continue;
                };
                listings.extend(
                    items
                        .iter()
                        .filter_map(|item| self.json_ld_item(item, id_patterns, page_url)),
                );
            }
        }
        listings
    }

    /// One `ItemList` entry, either the thing itself or a `ListItem`
    /// wrapping it under `item`.
    fn json_ld_item(
        &self,
        entry: &Value,
        id_patterns: &[Regex],
        page_url: &str,
    ) -> Option<Listing> {
        let item = entry.get("item").filter(|v| v.is_object()).unwrap_or(entry);
        let text = |key: &str| {
            item.get(key)
                .and_then(Value::as_str)
                .map(collapse_whitespace)
                .filter(|s| !s.is_empty())
        };

        let url = self.absolute(&text("url")?)?;
        let title = text("name")?;
        let external_id = id_from_url(&url, id_patterns).unwrap_or_else(|| url_slug(&url));

        let mut listing = Listing::new(external_id, title);
        listing.url = url;
        listing.description = text("description");
        listing.location.country = Some("US".to_string());
        listing.raw_data = json!({
            "source": self.slug,
            "page_url": page_url,
            "extracted_from": "json_ld",
        });
        Some(listing)
    }

    fn link_listing(
        &self,
        link: ElementRef<'_>,
        id_patterns: &[Regex],
        page_url: &str,
    ) -> Option<Listing> {
        let url = self.absolute(link.value().attr("href")?)?;
        let external_id = id_from_url(&url, id_patterns)?;
        let title = collapse_whitespace(&link.text().collect::<String>());
        if title.chars().count() < self.fallback.min_title_len {
            return None;
        }

        let mut listing = Listing::new(external_id, title);
        listing.url = url;
        listing.location.country = Some("US".to_string());
        listing.raw_data = json!({
            "source": self.slug,
            "page_url": page_url,
            "extracted_from": "link",
        });
        Some(listing)
    }
}

fn first_next_link(root: ElementRef<'_>, rules: &[Locator]) -> Option<String> {
    first_match(root, rules).filter(|href| !href.starts_with("javascript:") && href != "#")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIZBUYSELL_PAGE: &str = r#"
        <html><body>
          <div class="listing" data-listing-id="2214">
            <a class="title" href="/Business-Opportunity/corner-bakery/2214/">Corner Bakery</a>
            <span class="price">$1,250,000</span>
            <span class="cash-flow">$310K</span>
            <span class="revenue">Not Disclosed</span>
            <span class="location">Austin, TX</span>
            <span class="category">Food &amp; Beverage</span>
            <p class="desc">Established bakery. Real estate included.</p>
          </div>
          <div class="listing">
            <a class="title" href="/Business-Opportunity/franchise-gym/listing-9001/">Franchise Gym</a>
            <span class="price">Call for price</span>
          </div>
          <div class="listing">
            <a class="title" href="/about-us/">  </a>
          </div>
          <a class="next" href="/businesses-for-sale/2/">Next</a>
        </body></html>
    "#;

    #[test]
    fn extracts_cards_and_next_link() {
        let page = BIZBUYSELL.extract_page(&BIZBUYSELL.start_url(), BIZBUYSELL_PAGE);
        assert_eq!(page.candidates.len(), 2);

        let bakery = &page.candidates[0];
        assert_eq!(bakery.external_id, "2214");
        assert_eq!(bakery.title, "Corner Bakery");
        assert_eq!(
            bakery.url,
            "https://www.bizbuysell.com/Business-Opportunity/corner-bakery/2214/"
        );
        assert_eq!(bakery.asking_price, Some(125_000_000));
        assert_eq!(bakery.cash_flow, Some(31_000_000));
        assert_eq!(bakery.revenue, None);
        assert_eq!(bakery.location.city.as_deref(), Some("Austin"));
        assert_eq!(bakery.location.state.as_deref(), Some("TX"));
        assert_eq!(bakery.industry.as_deref(), Some("Food & Beverage"));
        assert!(bakery.real_estate_included);
        assert!(!bakery.is_franchise);

        let gym = &page.candidates[1];
        assert_eq!(gym.external_id, "9001");
        assert_eq!(gym.asking_price, None);
        assert!(gym.is_franchise);

        assert_eq!(
            page.next_url.as_deref(),
            Some("https://www.bizbuysell.com/businesses-for-sale/2/")
        );
    }

    #[test]
    fn falls_back_to_later_card_selector() {
        let html = r#"<section>
            <div data-listing-id="55"><h3><a href="/x/55">Car Wash</a></h3></div>
        </section>"#;
        let page = BIZBUYSELL.extract_page("https://www.bizbuysell.com/", html);
        assert_eq!(page.candidates.len(), 1);
        assert_eq!(page.candidates[0].external_id, "55");
        assert!(page.next_url.is_none());
    }

    #[test]
    fn javascript_next_links_are_ignored() {
        let html = r#"<div class="listing-item" data-id="7">
                <a class="listing-title" href="/business-for-sale/deli/7/">Deli</a>
            </div>
            <div class="pagination"><a href="javascript:void(0)">Next</a></div>"#;
        let page = BIZQUEST.extract_page(&BIZQUEST.start_url(), html);
        assert_eq!(page.candidates.len(), 1);
        assert!(page.next_url.is_none());
    }

    #[test]
    fn json_ld_item_list_when_cards_are_missing() {
        let html = r#"<html><head>
            <script type="application/ld+json">
              {"@context": "https://schema.org", "@type": "ItemList", "itemListElement": [
                {"@type": "ListItem", "position": 1, "item": {
                  "url": "https://www.bizbuysell.com/Business-Opportunity/laundromat/9001/",
                  "name": "Coin Laundromat",
                  "description": "Twenty washers, long lease."}},
                {"url": "/Business-Opportunity/pizzeria/9002/", "name": "Pizzeria"},
                {"url": "/no-name/9003/"}
              ]}
            </script>
            <script type="application/ld+json">{ not json</script>
            </head><body><div class="react-root"></div></body></html>"#;

        let page = BIZBUYSELL.extract_page(&BIZBUYSELL.start_url(), html);
        assert_eq!(page.candidates.len(), 2);

        let laundromat = &page.candidates[0];
        assert_eq!(laundromat.external_id, "9001");
        assert_eq!(laundromat.title, "Coin Laundromat");
        assert_eq!(
            laundromat.description.as_deref(),
            Some("Twenty washers, long lease.")
        );
        assert_eq!(laundromat.location.country.as_deref(), Some("US"));

        let pizzeria = &page.candidates[1];
        assert_eq!(pizzeria.external_id, "9002");
        assert_eq!(
            pizzeria.url,
            "https://www.bizbuysell.com/Business-Opportunity/pizzeria/9002/"
        );
    }

    #[test]
    fn detail_links_when_cards_are_missing() {
        let html = r#"<main>
            <a href="/Business-Opportunity/laundromat/9001/">Coin Laundromat</a>
            <a href="/Business-Opportunity/laundromat/9001/">  Coin   Laundromat </a>
            <a href="/Business-Opportunity/gym/9004/">More</a>
            <a href="/Business-Opportunity/">Browse all opportunities</a>
            <a href="/Business-Opportunity/hvac/9005/">HVAC Service Company</a>
        </main>"#;

        let page = BIZBUYSELL.extract_page(&BIZBUYSELL.start_url(), html);
        let ids: Vec<&str> = page
            .candidates
            .iter()
            .map(|l| l.external_id.as_str())
            .collect();
        assert_eq!(ids, ["9001", "9005"]);
        assert_eq!(page.candidates[0].title, "Coin Laundromat");
    }

    #[test]
    fn json_ld_and_links_for_the_same_listing_merge() {
        let html = r#"<script type="application/ld+json">
              {"@type": "ItemList", "itemListElement": [
                {"url": "/Business-Opportunity/laundromat/9001/", "name": "Coin Laundromat"}]}
            </script>
            <a href="/Business-Opportunity/laundromat/9001/">Coin Laundromat</a>"#;

        let page = BIZBUYSELL.extract_page(&BIZBUYSELL.start_url(), html);
        assert_eq!(page.candidates.len(), 1);
        assert_eq!(page.candidates[0].raw_data["extracted_from"], "json_ld");
    }

    #[test]
    fn fallback_is_skipped_when_cards_match() {
        let page = BIZBUYSELL.extract_page(&BIZBUYSELL.start_url(), BIZBUYSELL_PAGE);
        assert!(page
            .candidates
            .iter()
            .all(|l| l.raw_data.get("extracted_from").is_none()));
    }

    #[test]
    fn numbered_pages_only_where_supported() {
        assert_eq!(
            BIZBUYSELL.page_url(3).as_deref(),
            Some("https://www.bizbuysell.com/businesses-for-sale/3/")
        );
        assert_eq!(BIZQUEST.page_url(1), Some(BIZQUEST.start_url()));
        assert_eq!(BIZQUEST.page_url(2), None);
        assert!(profile("bizquest").is_some());
        assert!(profile("sunbelt").is_none());
    }

    #[test]
    fn id_patterns_compile() {
        for site in ALL {
            assert_eq!(site.id_regexes().len(), site.id_patterns.len());
        }
    }
}
