//! Source listing parsers: JSON records, flat delimited text and HTML
//! directory indexes, all turned into catalog entries.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use catrec_core::{CatalogEntry, ParseError, SizeValue};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "catrec-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListingFormat {
    #[default]
    Json,
    Delimited,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlSelectors {
    pub row: String,
    pub link: String,
    pub size: String,
}

impl Default for HtmlSelectors {
    fn default() -> Self {
        Self {
            row: "tr".to_string(),
            link: "a[href]".to_string(),
            size: "td.size".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingOptions {
    pub format: ListingFormat,
    pub delimiter: char,
    pub html: HtmlSelectors,
    /// Relative links in HTML listings are resolved against this.
    pub base_url: Option<String>,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            format: ListingFormat::Json,
            delimiter: '\t',
            html: HtmlSelectors::default(),
            base_url: None,
        }
    }
}

/// One record as exposed by a source listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub display_name: String,
    #[serde(default)]
    pub locator: String,
    #[serde(default)]
    pub size: SizeValue,
    #[serde(default)]
    pub position: Option<usize>,
}

/// A record left out of the catalog, with its ordinal in the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub ordinal: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedListing {
    pub entries: Vec<CatalogEntry>,
    pub skipped: Vec<SkippedRecord>,
}

/// Failures that make the whole listing unreadable, as opposed to one bad
/// record.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },
    #[error("listing is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("listing must be a JSON array of records")]
    NotArray,
}

pub type RecordResult = Result<SourceRecord, ParseError>;

pub trait ListingParser: Send + Sync {
    fn format(&self) -> ListingFormat;

    /// One result per record found, in listing order.
    fn parse_records(&self, text: &str) -> Result<Vec<RecordResult>, ListingError>;
}

pub struct JsonListingParser;

impl ListingParser for JsonListingParser {
    fn format(&self) -> ListingFormat {
        ListingFormat::Json
    }

    fn parse_records(&self, text: &str) -> Result<Vec<RecordResult>, ListingError> {
        let value: JsonValue = serde_json::from_str(text)?;
        let JsonValue::Array(items) = value else {
            return Err(ListingError::NotArray);
        };
        Ok(items
            .into_iter()
            .map(|item| {
                serde_json::from_value::<SourceRecord>(item)
                    .map_err(|e| ParseError::Malformed(e.to_string()))
            })
            .collect())
    }
}

/// `name<d>locator<d>size[<d>position]` per line. Blank lines and `#`
/// comments are ignored, as is a leading header naming the columns.
pub struct DelimitedListingParser {
    delimiter: char,
}

impl DelimitedListingParser {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    fn parse_line(&self, line: &str) -> RecordResult {
        let fields: Vec<&str> = line.split(self.delimiter).map(str::trim).collect();
        if fields.len() < 2 {
            return Err(ParseError::Malformed(format!(
                "expected at least 2 fields, found {}",
                fields.len()
            )));
        }
        let position = match fields.get(3).filter(|p| !p.is_empty()) {
            Some(p) => Some(
                p.parse::<usize>()
                    .map_err(|_| ParseError::Malformed(format!("bad position '{p}'")))?,
            ),
            None => None,
        };
        Ok(SourceRecord {
            display_name: fields[0].to_string(),
            locator: fields[1].to_string(),
            size: SizeValue::Text(fields.get(2).copied().unwrap_or_default().to_string()),
            position,
        })
    }
}

impl ListingParser for DelimitedListingParser {
    fn format(&self) -> ListingFormat {
        ListingFormat::Delimited
    }

    fn parse_records(&self, text: &str) -> Result<Vec<RecordResult>, ListingError> {
        let mut lines = text
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .peekable();

        if let Some(first) = lines.peek() {
            let head = first.split(self.delimiter).next().unwrap_or_default().trim();
            if head.eq_ignore_ascii_case("name") || head.eq_ignore_ascii_case("display_name") {
                lines.next();
            }
        }

        Ok(lines.map(|line| self.parse_line(line)).collect())
    }
}

/// Directory-index style HTML: one row per file, a link naming it and an
/// optional size cell.
pub struct HtmlListingParser {
    selectors: HtmlSelectors,
    base_url: Option<String>,
}

impl HtmlListingParser {
    pub fn new(selectors: HtmlSelectors, base_url: Option<String>) -> Self {
        Self {
            selectors,
            base_url,
        }
    }

    fn resolve(&self, href: &str) -> String {
        if href.contains("://") {
            return href.to_string();
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                href.trim_start_matches("./").trim_start_matches('/')
            ),
            None => href.to_string(),
        }
    }

    fn parse_row(&self, row: ElementRef<'_>, link: &Selector, size: &Selector) -> Option<RecordResult> {
        let anchor = row.select(link).next()?;
        let href = anchor.value().attr("href")?.trim();
        // parent links, column-sort links and sub-directories are not files
        if href.is_empty() || href.starts_with('?') || href.starts_with("..") || href.ends_with('/') {
            return None;
        }

        let name = anchor.text().collect::<String>().trim().to_string();
        let size_text = row
            .select(size)
            .next()
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        Some(Ok(SourceRecord {
            display_name: name,
            locator: self.resolve(href),
            size: SizeValue::Text(size_text),
            position: None,
        }))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ListingError> {
    Selector::parse(selector).map_err(|e| ListingError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

impl ListingParser for HtmlListingParser {
    fn format(&self) -> ListingFormat {
        ListingFormat::Html
    }

    fn parse_records(&self, text: &str) -> Result<Vec<RecordResult>, ListingError> {
        let row = parse_selector(&self.selectors.row)?;
        let link = parse_selector(&self.selectors.link)?;
        let size = parse_selector(&self.selectors.size)?;
        let document = Html::parse_document(text);
        Ok(document
            .select(&row)
            .filter_map(|r| self.parse_row(r, &link, &size))
            .collect())
    }
}

pub fn parser_for(options: &ListingOptions) -> Box<dyn ListingParser> {
    match options.format {
        ListingFormat::Json => Box::new(JsonListingParser),
        ListingFormat::Delimited => Box::new(DelimitedListingParser::new(options.delimiter)),
        ListingFormat::Html => Box::new(HtmlListingParser::new(
            options.html.clone(),
            options.base_url.clone(),
        )),
    }
}

/// Turns parsed records into catalog entries ordered by index.
///
/// A record's index is its declared `position`, else its ordinal in the
/// listing. Malformed records, blank names, unreadable sizes and reused
/// positions are skipped and reported; they never abort the listing.
pub fn build_catalog(records: Vec<RecordResult>) -> ParsedListing {
    let mut parsed = ParsedListing::default();
    let mut used_positions = BTreeSet::new();

    for (ordinal, record) in records.into_iter().enumerate() {
        match to_entry(ordinal, record, &mut used_positions) {
            Ok(entry) => parsed.entries.push(entry),
            Err(err) => {
                warn!(ordinal, reason = %err, "skipping malformed listing record");
                parsed.skipped.push(SkippedRecord {
                    ordinal,
                    reason: err.to_string(),
                });
            }
        }
    }

    parsed.entries.sort_by_key(|e| e.index);
    debug!(
        entries = parsed.entries.len(),
        skipped = parsed.skipped.len(),
        "built catalog from listing"
    );
    parsed
}

fn to_entry(
    ordinal: usize,
    record: RecordResult,
    used_positions: &mut BTreeSet<usize>,
) -> Result<CatalogEntry, ParseError> {
    let record = record?;
    let position = record.position.unwrap_or(ordinal);
    if record.display_name.trim().is_empty() {
        return Err(ParseError::EmptyName { position });
    }
    let size_bytes = record.size.to_bytes()?;
    if !used_positions.insert(position) {
        return Err(ParseError::DuplicatePosition { position });
    }
    Ok(CatalogEntry::new(
        position,
        record.display_name,
        record.locator,
        size_bytes,
    ))
}

pub fn parse_listing(text: &str, options: &ListingOptions) -> Result<ParsedListing, ListingError> {
    let parser = parser_for(options);
    let records = parser.parse_records(text)?;
    debug!(format = ?parser.format(), records = records.len(), "listing parsed");
    Ok(build_catalog(records))
}

pub fn load_listing_file(path: impl AsRef<Path>, options: &ListingOptions) -> anyhow::Result<ParsedListing> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_listing(&text, options).with_context(|| format!("parsing {}", path.display()))
}
