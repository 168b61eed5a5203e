//! Ozon adapter.

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

const BASE: &str = "https://www.ozon.ru";
const FALLBACK_TITLE: &str = "Товар Ozon";

fn city_fallback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Товары для города\s+([\w\-\s]+)").expect("static regex"))
}

fn ruble_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d[\d\s]*)₽").expect("static regex"))
}

pub struct OzonAdapter {
    selectors: SelectorRegistry,
    region_map: HashMap<String, String>,
}

impl OzonAdapter {
    pub fn new(selectors: SelectorRegistry, region_map: HashMap<String, String>) -> Self {
        Self {
            selectors,
            region_map,
        }
    }

    fn listing_spec(&self, field: &str, default_css: &str) -> SelectorSpec {
        self.selectors
            .site(Site::Ozon)
            .and_then(|s| s.listing.field(field))
            .cloned()
            .unwrap_or_else(|| SelectorSpec::css(default_css))
    }

    fn product_spec(&self, field: &str, default_css: &str) -> SelectorSpec {
        self.selectors
            .site(Site::Ozon)
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

impl SiteAdapter for OzonAdapter {
    fn site(&self) -> Site {
        Site::Ozon
    }

    fn listing_wait_selector(&self) -> &'static str {
        "[data-widget=\"searchResultsV2\"]"
    }

    fn region_cookies(&self, geoid: &str) -> Vec<Cookie> {
        vec![Cookie::new("region", geoid, ".ozon.ru")]
    }

    fn city_from_html(&self, html: &str) -> Option<String> {
        let doc = Html::parse_document(html);
        for css in ["[data-widget='headerLocation']", "[data-widget='regionSelect']"] {
            let sel = Selector::parse(css).expect("static selector");
            if let Some(el) = doc.select(&sel).next() {
                let text = el.text().collect::<Vec<_>>().join(" ");
                let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
        city_fallback_re()
            .captures(html)
            .map(|caps| caps[1].trim().to_string())
    }

    fn ensure_region(&self, html: &str, geoid: &str) -> bool {
        let city = self.city_from_html(html);
        verify_region(&self.region_map, city.as_deref(), geoid)
    }

    fn parse_listing(&self, html: &str, geoid: Option<&str>) -> Vec<RawOffer> {
        let doc = Html::parse_document(html);
        let container_spec = self.listing_spec("container", "[data-widget=\"searchResultsV2\"]");
        let card_spec = self.listing_spec("card", "a[href*=\"/product/\"]");
        let price_spec = self.selectors.site(Site::Ozon).and_then(|s| s.listing.field("price")).cloned();
        let image_spec = self.listing_spec("image", "img");

        let container = select_one(&doc, html, None, &container_spec).and_then(|c| c.as_element());
        let cards = select_all(&doc, html, container, &card_spec);

        let mut items = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for card in cards {
            let Some(card) = card.as_element() else {
                warn!("skipping card: selector layer yielded no element");
                continue;
            };
            let href = card.value().attr("href");
            let Some(href) = href.filter(|h| h.contains("/product/")) else {
                warn!("skipping card: missing link");
                continue;
            };
            let url = join_base(href);
            if !seen.insert(url.clone()) {
                continue;
            }

            let card_sel = crate::scrapers::selectors::Selected::Element(card);
            let text = card_sel.text();
            let title = clamp_title(&text, FALLBACK_TITLE);

            let mut price = None;
            if let Some(spec) = &price_spec {
                if let Some(hit) = select_one(&doc, html, Some(card), spec) {
                    price = extract_price(&hit.text());
                }
            }
            if price.is_none() {
                price = ruble_re()
                    .captures(&text)
                    .and_then(|caps| extract_price(&caps[1]));
            }
            let Some(price) = price else {
                warn!(%url, "skipping card: missing price");
                continue;
            };

            let img = select_one(&doc, html, Some(card), &image_spec)
                .and_then(|hit| hit.attr("src"))
                .map(|src| join_base(&src));

            let hints = card_hints(&text);
            let mut offer = RawOffer::new(Site::Ozon, title, url);
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
            &self.product_spec("price", "[data-widget='webPrice']"),
        )
        .and_then(|hit| extract_price(&hit.text()));

        let img = select_one(&doc, html, None, &self.product_spec("image", "img"))
            .and_then(|hit| hit.attr("src"))
            .map(|src| join_base(&src));

        let page_text = doc.root_element().text().collect::<Vec<_>>().join(" ");
        let hints = card_hints(&page_text);

        let mut offer = RawOffer::new(Site::Ozon, title, url);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::selectors::SelectorRegistry;

    fn adapter() -> OzonAdapter {
        let mut map = HashMap::new();
        map.insert("213".to_string(), "Москва".to_string());
        map.insert("2".to_string(), "Санкт-Петербург".to_string());
        OzonAdapter::new(SelectorRegistry::default(), map)
    }

    const LISTING: &str = r#"<html><body>
      <div data-widget="searchResultsV2">
        <a href="/product/noutbuk-lenovo-123456789/">Ноутбук Lenovo IdeaPad 29 990 ₽ купон 500 доставка 3 дн
          <img src="/img/lenovo.jpg"/>
        </a>
        <a href="/product/smartfon-bez-tseny-111/">Смартфон без цены</a>
        <a href="/category/other/">Не товар 1 000 ₽</a>
        <a href="/product/noutbuk-lenovo-123456789/">Ноутбук Lenovo IdeaPad 29 990 ₽</a>
      </div>
    </body></html>"#;

    #[test]
    fn listing_parses_cards_and_skips_broken_ones() {
        let offers = adapter().parse_listing(LISTING, Some("213"));
        // One good card; the no-price card, the non-product link and the
        // duplicate URL are all dropped.
        assert_eq!(offers.len(), 1);
        let offer = &offers[0];
        assert_eq!(offer.price, Some(29990));
        assert_eq!(offer.promo_flags.instant_coupon(), 500);
        assert_eq!(offer.shipping_days, Some(3));
        assert_eq!(offer.geoid.as_deref(), Some("213"));
        assert!(offer.url.ends_with("/product/noutbuk-lenovo-123456789/"));
        assert!(offer.img.as_deref().unwrap().ends_with("/img/lenovo.jpg"));
    }

    #[test]
    fn region_cookie_carries_the_geoid() {
        let cookies = adapter().region_cookies("2");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "region");
        assert_eq!(cookies[0].value, "2");
        assert_eq!(cookies[0].domain, ".ozon.ru");
    }

    #[test]
    fn city_is_read_from_the_header_widget() {
        let html = r#"<html><body><div data-widget='headerLocation'>Москва</div></body></html>"#;
        assert_eq!(adapter().city_from_html(html), Some("Москва".into()));
        assert!(adapter().ensure_region(html, "213"));
        assert!(!adapter().ensure_region(html, "2"));
        // Unknown geoid passes.
        assert!(adapter().ensure_region(html, "54"));
    }

    #[test]
    fn external_id_is_the_trailing_number() {
        let id = adapter().external_id_from_url("https://www.ozon.ru/product/noutbuk-lenovo-123456789/");
        assert_eq!(id, "123456789");
    }

    #[test]
    fn product_page_is_parsed_with_fallbacks() {
        let html = r#"<html><head><link rel="canonical" href="/product/tv-55-987654/"/></head>
          <body><h1>Телевизор Samsung 55</h1>
          <div data-widget='webPrice'>49 990 ₽</div>
          <img src="https://cdn.ozon.ru/tv.jpg"/></body></html>"#;
        let offer = adapter().parse_product(html, None);
        assert_eq!(offer.title, "Телевизор Samsung 55");
        assert_eq!(offer.price, Some(49990));
        assert!(offer.url.ends_with("/product/tv-55-987654/"));
        assert_eq!(offer.img.as_deref(), Some("https://cdn.ozon.ru/tv.jpg"));
    }
}
