//! Yandex Market adapter.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use crate::models::{RawOffer, Site};
use crate::scrapers::adapters::{
    card_hints, clamp_title, extract_price, verify_region, Cookie, SiteAdapter,
};
use crate::scrapers::selectors::{select_all, select_one, SelectorRegistry, SelectorSpec};

const BASE: &str = "https://market.yandex.ru";
const FALLBACK_TITLE: &str = "Товар Маркета";

pub struct MarketAdapter {
    selectors: SelectorRegistry,
    region_map: HashMap<String, String>,
}

impl MarketAdapter {
    pub fn new(selectors: SelectorRegistry, region_map: HashMap<String, String>) -> Self {
        Self {
            selectors,
            region_map,
        }
    }

    fn listing_spec(&self, field: &str, default_css: &str) -> SelectorSpec {
        self.selectors
            .site(Site::Market)
            .and_then(|s| s.listing.field(field))
            .cloned()
            .unwrap_or_else(|| SelectorSpec::css(default_css))
    }

    fn product_spec(&self, field: &str, default_css: &str) -> SelectorSpec {
        self.selectors
            .site(Site::Market)
            .and_then(|s| s.product.field(field))
            .cloned()
            .unwrap_or_else(|| SelectorSpec::css(default_css))
    }
}

fn join_base(href: &str) -> String {
    Url::parse(BASE)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

impl SiteAdapter for MarketAdapter {
    fn site(&self) -> Site {
        Site::Market
    }

    fn listing_wait_selector(&self) -> &'static str {
        "article[data-autotest-id='product-snippet']"
    }

    fn region_cookies(&self, geoid: &str) -> Vec<Cookie> {
        vec![Cookie::new("yandex_gid", geoid, ".yandex.ru")]
    }

    fn city_from_html(&self, html: &str) -> Option<String> {
        let doc = Html::parse_document(html);
        for css in ["[data-autotest-id='region']", "[data-zone-name='region']"] {
            let sel = Selector::parse(css).expect("static selector");
            if let Some(el) = doc.select(&sel).next() {
                let text = el.text().collect::<Vec<_>>().join(" ");
                let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
        None
    }

    fn ensure_region(&self, html: &str, geoid: &str) -> bool {
        let city = self.city_from_html(html);
        verify_region(&self.region_map, city.as_deref(), geoid)
    }

    fn parse_listing(&self, html: &str, geoid: Option<&str>) -> Vec<RawOffer> {
        let doc = Html::parse_document(html);
        let card_spec =
            self.listing_spec("card", "article[data-autotest-id='product-snippet']");
        let link_spec = self.listing_spec("link", "a[href*='/product--']");
        let title_spec = self.listing_spec("title", "[data-baobab-name='title']");
        let price_spec = self.listing_spec("price", "[data-autotest-value]");
        let image_spec = self.listing_spec("image", "img");

        let cards = select_all(&doc, html, None, &card_spec);
        let mut items = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for card in cards {
            let Some(card) = card.as_element() else {
                warn!("skipping card: selector layer yielded no element");
                continue;
            };

            let link = select_one(&doc, html, Some(card), &link_spec);
            let Some(href) = link.as_ref().and_then(|l| l.attr("href")) else {
                warn!("skipping card: missing link");
                continue;
            };
            let url = join_base(&href);
            if !seen.insert(url.clone()) {
                continue;
            }

            let title = select_one(&doc, html, Some(card), &title_spec)
                .map(|hit| hit.text())
                .or_else(|| link.map(|l| l.text()))
                .unwrap_or_default();
            let title = clamp_title(&title, FALLBACK_TITLE);

            // The snippet price lives in a data attribute; the visible text is
            // only a formatting of it.
            let price = select_one(&doc, html, Some(card), &price_spec).and_then(|hit| {
                hit.attr("data-autotest-value")
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .or_else(|| extract_price(&hit.text()))
            });
            let Some(price) = price else {
                warn!(%url, "skipping card: missing price");
                continue;
            };

            let img = select_one(&doc, html, Some(card), &image_spec)
                .and_then(|hit| hit.attr("src"))
                .map(|src| join_base(&src));

            let card_text = crate::scrapers::selectors::Selected::Element(card).text();
            let hints = card_hints(&card_text);

            let mut offer = RawOffer::new(Site::Market, title, url);
            offer.price = Some(price);
            offer.img = img;
            offer.shipping_days = hints.shipping_days;
            offer.promo_flags = hints.promo_flags;
            offer.shipping_included = hints.shipping_included;
            offer.price_in_cart = hints.price_in_cart;
            offer.subscription = hints.subscription;
            offer.geoid = geoid.map(|g| g.to_string());
            items.push(offer);
        }
        items
    }

    fn parse_product(&self, html: &str, geoid: Option<&str>) -> RawOffer {
        let doc = Html::parse_document(html);

        let canonical_sel = Selector::parse("link[rel='canonical']").expect("static selector");
        let url = doc
            .select(&canonical_sel)
            .next()
            .and_then(|el| el.value().attr("href"))
            .map(join_base)
            .unwrap_or_else(|| BASE.to_string());

        let title = select_one(&doc, html, None, &self.product_spec("title", "h1"))
            .map(|hit| hit.text())
            .unwrap_or_default();
        let title = clamp_title(&title, FALLBACK_TITLE);

        let price = select_one(
            &doc,
            html,
            None,
            &self.product_spec("price", "[data-autotest-id='price']"),
        )
        .and_then(|hit| extract_price(&hit.text()));

        let img = select_one(&doc, html, None, &self.product_spec("image", "img"))
            .and_then(|hit| hit.attr("src"))
            .map(|src| join_base(&src));

        let page_text = doc.root_element().text().collect::<Vec<_>>().join(" ");
        let hints = card_hints(&page_text);

        let mut offer = RawOffer::new(Site::Market, title, url);
        offer.price = price;
        offer.img = img;
        offer.shipping_days = hints.shipping_days;
        offer.promo_flags = hints.promo_flags;
        offer.shipping_included = hints.shipping_included;
        offer.price_in_cart = hints.price_in_cart;
        offer.subscription = hints.subscription;
        offer.geoid = geoid.map(|g| g.to_string());
        offer
    }

    fn external_id_from_url(&self, url: &str) -> String {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"(\d+)(?:/|$)").expect("static regex"));
        let path = Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        re.captures(&path)
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| path.trim_matches('/').to_string())
    }
}
