//! Declarative selector registry.
//!
//! Selectors are data, not code: a YAML file maps site → page type → field →
//! `{css?, xpath?, json?}`. Resolution tries CSS first, then XPath over the
//! full document, then embedded JSON (`<script>` payloads with a dotted
//! path). CSS hits are DOM elements and support scoped descent; the other two
//! layers yield plain string values.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use sxd_xpath::{Context as XpathContext, Factory, Value as XpathValue};
use tracing::debug;

use crate::models::Site;

/// One field's selector layers, in resolution order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorSpec {
    pub css: Option<String>,
    pub xpath: Option<String>,
    pub json: Option<String>,
}

impl SelectorSpec {
    pub fn css(selector: &str) -> Self {
        Self {
            css: Some(selector.to_string()),
            xpath: None,
            json: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageSelectors(pub HashMap<String, SelectorSpec>);

impl PageSelectors {
    pub fn field(&self, name: &str) -> Option<&SelectorSpec> {
        self.0.get(name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteSelectors {
    #[serde(default)]
    pub listing: PageSelectors,
    #[serde(default)]
    pub product: PageSelectors,
}

/// All configured selectors, keyed by site.
#[derive(Debug, Clone, Default)]
pub struct SelectorRegistry {
    sites: HashMap<String, SiteSelectors>,
}

impl SelectorRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read selectors file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let sites: HashMap<String, SiteSelectors> =
            serde_yaml::from_str(yaml).context("parse selectors yaml")?;
        Ok(Self { sites })
    }

    pub fn site(&self, site: Site) -> Option<&SiteSelectors> {
        self.sites.get(site.as_str())
    }
}

/// A resolved hit: a real DOM element (CSS layer) or a bare value (XPath and
/// JSON layers).
#[derive(Debug, Clone)]
pub enum Selected<'a> {
    Element(ElementRef<'a>),
    Value(String),
}

impl<'a> Selected<'a> {
    /// Visible text of the hit, whitespace-collapsed.
    pub fn text(&self) -> String {
        match self {
            Selected::Element(el) => {
                let joined = el.text().collect::<Vec<_>>().join(" ");
                joined.split_whitespace().collect::<Vec<_>>().join(" ")
            }
            Selected::Value(v) => v.trim().to_string(),
        }
    }

    /// Attribute lookup; only DOM hits carry attributes.
    pub fn attr(&self, name: &str) -> Option<String> {
        match self {
            Selected::Element(el) => el.value().attr(name).map(|v| v.to_string()),
            Selected::Value(_) => None,
        }
    }

    pub fn as_element(&self) -> Option<ElementRef<'a>> {
        match self {
            Selected::Element(el) => Some(*el),
            Selected::Value(_) => None,
        }
    }
}

/// Resolves a spec to the first non-empty layer.
///
/// `doc`/`raw` are the parsed and raw forms of the same document; `scope`
/// restricts the CSS layer to one subtree (XPath and JSON always see the full
/// document, which is how listings fall back when the scoped layer is empty).
pub fn select_all<'a>(
    doc: &'a Html,
    raw: &str,
    scope: Option<ElementRef<'a>>,
    spec: &SelectorSpec,
) -> Vec<Selected<'a>> {
    if let Some(css) = &spec.css {
        let hits = select_css(doc, scope, css);
        if !hits.is_empty() {
            return hits;
        }
    }
    if let Some(xpath) = &spec.xpath {
        let hits = select_xpath(raw, xpath);
        if !hits.is_empty() {
            return hits;
        }
    }
    if let Some(path) = &spec.json {
        let hits = select_embedded_json(doc, path);
        if !hits.is_empty() {
            return hits;
        }
    }
    Vec::new()
}

pub fn select_one<'a>(
    doc: &'a Html,
    raw: &str,
    scope: Option<ElementRef<'a>>,
    spec: &SelectorSpec,
) -> Option<Selected<'a>> {
    select_all(doc, raw, scope, spec).into_iter().next()
}

fn select_css<'a>(doc: &'a Html, scope: Option<ElementRef<'a>>, css: &str) -> Vec<Selected<'a>> {
    let Ok(selector) = Selector::parse(css) else {
        debug!(css, "unparseable css selector");
        return Vec::new();
    };
    match scope {
        Some(scope) => scope.select(&selector).map(Selected::Element).collect(),
        None => doc.select(&selector).map(Selected::Element).collect(),
    }
}

/// XPath layer. Only well-formed (XHTML-ish) documents survive the XML
/// parser; tag-soup pages simply fall through to the next layer.
fn select_xpath(raw: &str, xpath: &str) -> Vec<Selected<'static>> {
    let Ok(package) = sxd_document::parser::parse(raw) else {
        return Vec::new();
    };
    let document = package.as_document();
    let factory = Factory::new();
    let Ok(Some(expr)) = factory.build(xpath) else {
        debug!(xpath, "unparseable xpath expression");
        return Vec::new();
    };
    let context = XpathContext::new();
    match expr.evaluate(&context, document.root()) {
        Ok(XpathValue::Nodeset(nodes)) => nodes
            .document_order()
            .into_iter()
            .map(|node| Selected::Value(node.string_value()))
            .filter(|s| !matches!(s, Selected::Value(v) if v.trim().is_empty()))
            .collect(),
        Ok(XpathValue::String(s)) if !s.trim().is_empty() => vec![Selected::Value(s)],
        Ok(XpathValue::Number(n)) => vec![Selected::Value(n.to_string())],
        _ => Vec::new(),
    }
}

/// Embedded-JSON layer: scan `<script>` bodies, parse whichever are JSON and
/// resolve the dotted path (numeric segments index arrays).
fn select_embedded_json(doc: &Html, path: &str) -> Vec<Selected<'static>> {
    let script_sel = Selector::parse("script").expect("static selector");
    let mut hits = Vec::new();
    for script in doc.select(&script_sel) {
        let body = script.text().collect::<String>();
        let trimmed = body.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            continue;
        };
        if let Some(found) = json_path(&value, path) {
            if let Some(text) = json_to_text(found) {
                hits.push(Selected::Value(text));
            }
        }
    }
    hits
}

fn json_path<'v>(value: &'v serde_json::Value, path: &str) -> Option<&'v serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_to_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
ozon:
  listing:
    card:
      css: 'a[href*="/product/"]'
  product:
    price:
      css: '.price'
      xpath: "//span[@id='price']"
      json: 'widgetStates.webPrice.price'
market:
  product:
    title:
      css: 'h1'
"#;

    #[test]
    fn registry_loads_sites_and_fields() {
        let registry = SelectorRegistry::from_yaml(YAML).unwrap();
        let ozon = registry.site(Site::Ozon).unwrap();
        assert!(ozon.listing.field("card").is_some());
        assert!(ozon.product.field("price").is_some());
        assert!(registry.site(Site::Market).unwrap().listing.field("card").is_none());
    }

    #[test]
    fn css_layer_wins_when_it_matches() {
        let html = r#"<html><body><span class="price">1 990 ₽</span></body></html>"#;
        let doc = Html::parse_document(html);
        let spec = SelectorSpec {
            css: Some(".price".into()),
            xpath: Some("//span".into()),
            json: None,
        };
        let hit = select_one(&doc, html, None, &spec).unwrap();
        assert_eq!(hit.text(), "1 990 ₽");
        assert!(hit.as_element().is_some());
    }

    #[test]
    fn xpath_layer_kicks_in_for_well_formed_documents() {
        let html = r#"<html><body><span id="price">2990</span></body></html>"#;
        let doc = Html::parse_document(html);
        let spec = SelectorSpec {
            css: Some(".missing".into()),
            xpath: Some("//span[@id='price']".into()),
            json: None,
        };
        let hit = select_one(&doc, html, None, &spec).unwrap();
        assert_eq!(hit.text(), "2990");
        assert!(hit.as_element().is_none());
    }

    #[test]
    fn embedded_json_is_the_last_resort() {
        let html = r#"<html><head><script>{"widgetStates":{"webPrice":{"price":4990}}}</script></head><body></body></html>"#;
        let doc = Html::parse_document(html);
        let spec = SelectorSpec {
            css: Some(".missing".into()),
            xpath: Some("//em".into()),
            json: Some("widgetStates.webPrice.price".into()),
        };
        let hit = select_one(&doc, html, None, &spec).unwrap();
        assert_eq!(hit.text(), "4990");
    }

    #[test]
    fn empty_spec_selects_nothing() {
        let html = "<html><body></body></html>";
        let doc = Html::parse_document(html);
        assert!(select_one(&doc, html, None, &SelectorSpec::default()).is_none());
    }

    #[test]
    fn scoped_css_descends_into_the_card() {
        let html = r#"<html><body>
            <div class="card"><span class="t">A</span></div>
            <div class="card"><span class="t">B</span></div>
        </body></html>"#;
        let doc = Html::parse_document(html);
        let cards = select_all(&doc, html, None, &SelectorSpec::css(".card"));
        assert_eq!(cards.len(), 2);
        let second = cards[1].as_element().unwrap();
        let title = select_one(&doc, html, Some(second), &SelectorSpec::css(".t")).unwrap();
        assert_eq!(title.text(), "B");
    }

    #[test]
    fn json_path_walks_arrays() {
        let value = serde_json::json!({"items": [{"price": 10}, {"price": 20}]});
        assert_eq!(json_path(&value, "items.1.price"), Some(&serde_json::json!(20)));
        assert_eq!(json_path(&value, "items.5.price"), None);
    }
}
