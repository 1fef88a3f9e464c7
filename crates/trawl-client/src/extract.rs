//! CSS-selector extraction of listing cards from a results page.
//!
//! Each card becomes one [`RawRecord`]. A card that lacks an id or a required
//! field is reported as a [`SkippedElement`] instead of failing the page.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use trawl_core::error::AppError;
use trawl_core::models::RawRecord;
use trawl_core::traits::{Cleaner, SkippedElement};
use url::Url;

/// How to read one field from a card.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "FieldSelectorDef")]
pub struct FieldSelector {
    pub selector: String,
    /// Read this attribute instead of the text. `href`/`src` are resolved
    /// against the page URL.
    pub attr: Option<String>,
    /// Collect every match into a list.
    pub multiple: bool,
    /// Convert the matched element's inner HTML to Markdown.
    pub markdown: bool,
}

impl FieldSelector {
    pub fn text(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            attr: None,
            multiple: false,
            markdown: false,
        }
    }

    pub fn attr(selector: &str, attr: &str) -> Self {
        Self {
            attr: Some(attr.to_string()),
            ..Self::text(selector)
        }
    }

    pub fn all(selector: &str) -> Self {
        Self {
            multiple: true,
            ..Self::text(selector)
        }
    }

    pub fn markdown(selector: &str) -> Self {
        Self {
            markdown: true,
            ..Self::text(selector)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldSelectorDef {
    Css(String),
    Full {
        selector: String,
        #[serde(default)]
        attr: Option<String>,
        #[serde(default)]
        multiple: bool,
        #[serde(default)]
        markdown: bool,
    },
}

impl From<FieldSelectorDef> for FieldSelector {
    fn from(def: FieldSelectorDef) -> Self {
        match def {
            FieldSelectorDef::Css(selector) => FieldSelector::text(&selector),
            FieldSelectorDef::Full {
                selector,
                attr,
                multiple,
                markdown,
            } => FieldSelector {
                selector,
                attr,
                multiple,
                markdown,
            },
        }
    }
}

/// Selector configuration for one source's listing page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingSelectors {
    /// Matches each listing card.
    pub card: String,
    /// Where the card's stable id lives, e.g. `{"selector": ":scope", "attr": "data-id"}`.
    pub id: FieldSelector,
    /// Output field name → selector. Field names are whatever the source's
    /// normalizer expects.
    pub fields: BTreeMap<String, FieldSelector>,
    /// Fields a card must yield to be emitted.
    #[serde(default)]
    pub required: Vec<String>,
}

struct CompiledField {
    name: String,
    def: FieldSelector,
    selector: Option<Selector>,
}

/// [`ListingSelectors`] with every CSS selector parsed once.
pub struct CardExtractor {
    card: Selector,
    id: CompiledField,
    fields: Vec<CompiledField>,
    required: Vec<String>,
}

fn compile(name: &str, def: &FieldSelector) -> Result<CompiledField, AppError> {
    // `:scope` reads from the card element itself.
    let selector = if def.selector.trim() == ":scope" {
        None
    } else {
        Some(parse_selector(&def.selector)?)
    };
    Ok(CompiledField {
        name: name.to_string(),
        def: def.clone(),
        selector,
    })
}

fn parse_selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css)
        .map_err(|e| AppError::ConfigError(format!("Invalid CSS selector '{css}': {e}")))
}

impl CardExtractor {
    pub fn new(selectors: &ListingSelectors) -> Result<Self, AppError> {
        let fields = selectors
            .fields
            .iter()
            .map(|(name, def)| compile(name, def))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            card: parse_selector(&selectors.card)?,
            id: compile("id", &selectors.id)?,
            fields,
            required: selectors.required.clone(),
        })
    }

    /// Extract every card on the page.
    pub fn extract<C: Cleaner>(
        &self,
        source: &str,
        page_url: &str,
        html: &str,
        cleaner: &C,
    ) -> (Vec<RawRecord>, Vec<SkippedElement>) {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();
        let mut records = Vec::new();
        let mut skipped = Vec::new();

        for (index, card) in document.select(&self.card).enumerate() {
            match self.extract_card(source, card, base.as_ref(), cleaner) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    tracing::debug!(%source, index, %reason, "Skipping listing card");
                    skipped.push(SkippedElement { index, reason });
                }
            }
        }
        (records, skipped)
    }

    fn extract_card<C: Cleaner>(
        &self,
        source: &str,
        card: ElementRef<'_>,
        base: Option<&Url>,
        cleaner: &C,
    ) -> Result<RawRecord, String> {
        let id = read_field(&self.id, card, base, cleaner)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "missing external id".to_string())?;

        let mut record = RawRecord::new(source, Some(id));
        for field in &self.fields {
            if let Some(value) = read_field(field, card, base, cleaner) {
                record = record.with_field(&field.name, value);
            }
        }

        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !record.fields.contains_key(name.as_str()))
        {
            return Err(format!("missing required field '{missing}'"));
        }
        Ok(record)
    }
}

fn read_field<C: Cleaner>(
    field: &CompiledField,
    card: ElementRef<'_>,
    base: Option<&Url>,
    cleaner: &C,
) -> Option<serde_json::Value> {
    let matches: Vec<ElementRef<'_>> = match &field.selector {
        None => vec![card],
        Some(selector) => card.select(selector).collect(),
    };

    let values: Vec<String> = matches
        .into_iter()
        .filter_map(|el| read_one(&field.def, el, base, cleaner))
        .filter(|v| !v.is_empty())
        .collect();

    if field.def.multiple {
        (!values.is_empty()).then(|| serde_json::Value::from(values))
    } else {
        values.into_iter().next().map(serde_json::Value::from)
    }
}

fn read_one<C: Cleaner>(
    def: &FieldSelector,
    el: ElementRef<'_>,
    base: Option<&Url>,
    cleaner: &C,
) -> Option<String> {
    if let Some(attr) = &def.attr {
        let raw = el.value().attr(attr)?.trim();
        if matches!(attr.as_str(), "href" | "src")
            && let Some(base) = base
        {
            return base.join(raw).ok().map(|u| u.to_string());
        }
        return Some(raw.to_string());
    }
    if def.markdown {
        return cleaner.clean(&el.inner_html()).ok();
    }
    let text = el.text().collect::<Vec<_>>().join(" ");
    Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
}
