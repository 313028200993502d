//! Client-ready exports of a completed comparison: the email, a markdown
//! document, and a block list for PDF renderers.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::ComparisonResult;

pub fn email_subject(title: &str) -> String {
    format!("Insurance quote comparison: {}", title)
}

/// Long date as used in the document header, e.g. `16 October 2026`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%-d %B %Y").to_string()
}

/// Markdown body of a comparison: the email draft, or a summary built from
/// the structured sections when the model left the draft empty.
pub fn render_body(result: &ComparisonResult) -> String {
    if !result.email_draft.trim().is_empty() {
        return result.email_draft.clone();
    }

    let mut sections = Vec::new();
    if !result.summary.is_empty() {
        sections.push(format!("### Summary\n\n{}", result.summary));
    }
    if let Some(premiums) = premium_section(&result.premium_comparison) {
        sections.push(premiums);
    }
    if let Some(cover) = cover_section(&result.cover_comparison) {
        sections.push(cover);
    }
    if !result.recommendation.is_empty() {
        sections.push(format!("### Recommendation\n\n{}", result.recommendation));
    }
    sections.join("\n\n")
}

/// Standalone markdown document with a title header.
pub fn render_markdown(
    title: &str,
    contact_name: &str,
    result: &ComparisonResult,
    date: NaiveDate,
) -> String {
    format!(
        "# {}\n\nPrepared for {} | {}\n\n---\n\n{}\n",
        title,
        contact_name,
        format_date(date),
        render_body(result)
    )
}

/// Everything a PDF renderer needs for one comparison.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub title: String,
    pub subtitle: String,
    pub footer: String,
    pub file_name: String,
    pub blocks: Vec<Block>,
}

pub fn export_document(
    title: &str,
    contact_name: &str,
    result: &ComparisonResult,
    date: NaiveDate,
) -> ExportDocument {
    let safe_title: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    ExportDocument {
        title: title.to_string(),
        subtitle: format!("Prepared for {} | {}", contact_name, format_date(date)),
        footer: format!("Generated by QuoteCompare | {}", date.format("%Y/%m/%d")),
        file_name: format!("{}_comparison.pdf", safe_title),
        blocks: parse_blocks(&render_body(result)),
    }
}

// ============================================================================
// Markdown blocks
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    Heading { level: u8, text: String },
    Paragraph { segments: Vec<Segment> },
    Table { headers: Vec<String>, rows: Vec<Vec<String>> },
    List { ordered: bool, items: Vec<String> },
    #[serde(rename = "hr")]
    Rule,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Segment {
    pub text: String,
    pub bold: bool,
}

impl Segment {
    fn plain(text: &str) -> Self {
        Self {
            text: text.to_string(),
            bold: false,
        }
    }

    fn bold(text: &str) -> Self {
        Self {
            text: text.to_string(),
            bold: true,
        }
    }
}

struct Patterns {
    heading: Regex,
    table_separator: Regex,
    bullet: Regex,
    numbered: Regex,
    bold: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        heading: Regex::new(r"^(#{1,3})\s+(.*)").expect("heading pattern"),
        table_separator: Regex::new(r"^\s*\|?[\s\-:|]+\|").expect("separator pattern"),
        bullet: Regex::new(r"^\s*[-*]\s+(.*)").expect("bullet pattern"),
        numbered: Regex::new(r"^\s*\d+\.\s+(.*)").expect("numbered pattern"),
        bold: Regex::new(r"\*\*([^*]+)\*\*").expect("bold pattern"),
    })
}

/// Split the subset of markdown the email drafts use into blocks.
pub fn parse_blocks(markdown: &str) -> Vec<Block> {
    let p = patterns();
    let lines: Vec<&str> = markdown.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.is_empty() {
            i += 1;
            continue;
        }

        if matches!(trimmed, "---" | "***" | "___") {
            blocks.push(Block::Rule);
            i += 1;
            continue;
        }

        if let Some(caps) = p.heading.captures(line) {
            blocks.push(Block::Heading {
                level: caps[1].len() as u8,
                text: caps[2].replace("**", ""),
            });
            i += 1;
            continue;
        }

        if line.contains('|')
            && lines
                .get(i + 1)
                .is_some_and(|next| p.table_separator.is_match(next))
        {
            let headers = table_cells(line);
            i += 2;
            let mut rows = Vec::new();
            while i < lines.len() && lines[i].contains('|') && !lines[i].trim().is_empty() {
                rows.push(table_cells(lines[i]));
                i += 1;
            }
            blocks.push(Block::Table { headers, rows });
            continue;
        }

        if let Some((ordered, pattern)) = [(false, &p.bullet), (true, &p.numbered)]
            .into_iter()
            .find(|(_, pattern)| pattern.is_match(line))
        {
            let mut items = Vec::new();
            while let Some(caps) = lines.get(i).and_then(|l| pattern.captures(l)) {
                items.push(caps[1].to_string());
                i += 1;
            }
            blocks.push(Block::List { ordered, items });
            continue;
        }

        if let Some(inner) = trimmed
            .strip_prefix("**")
            .and_then(|s| s.strip_suffix("**"))
            .filter(|s| !s.is_empty() && !s.contains("**"))
        {
            blocks.push(Block::Heading {
                level: 3,
                text: inner.to_string(),
            });
            i += 1;
            continue;
        }

        blocks.push(Block::Paragraph {
            segments: bold_segments(line),
        });
        i += 1;
    }

    blocks
}

fn table_cells(line: &str) -> Vec<String> {
    line.split('|')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn bold_segments(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in patterns().bold.captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            segments.push(Segment::plain(&text[last..whole.start()]));
        }
        segments.push(Segment::bold(inner.as_str()));
        last = whole.end();
    }
    if last < text.len() {
        segments.push(Segment::plain(&text[last..]));
    }
    segments
}

// ============================================================================
// Fallback sections built from the structured result
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumComparison {
    #[serde(default)]
    items: Vec<PremiumItem>,
    #[serde(default)]
    difference: Value,
    #[serde(default)]
    cheapest: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumItem {
    #[serde(default)]
    insurer: Value,
    #[serde(default)]
    monthly_premium: Value,
    #[serde(default)]
    annual_premium: Value,
}

#[derive(Debug, Default, Deserialize)]
struct CoverComparison {
    #[serde(default)]
    features: Vec<CoverFeature>,
}

#[derive(Debug, Deserialize)]
struct CoverFeature {
    #[serde(default)]
    feature: Value,
    #[serde(default)]
    values: Map<String, Value>,
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "N/A".to_string(),
        Value::String(s) if s.trim().is_empty() => "N/A".to_string(),
        Value::String(s) => s.replace('|', "/"),
        other => other.to_string(),
    }
}

fn table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut out = format!("| {} |\n", headers.join(" | "));
    out.push_str(&format!("|{}\n", "---|".repeat(headers.len())));
    for row in rows {
        out.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    out.trim_end().to_string()
}

fn premium_section(section: &Value) -> Option<String> {
    let premiums: PremiumComparison = serde_json::from_value(section.clone()).unwrap_or_default();
    if premiums.items.is_empty() {
        return None;
    }

    let headers = ["Insurer", "Monthly", "Annual"].map(String::from);
    let rows: Vec<Vec<String>> = premiums
        .items
        .iter()
        .map(|item| {
            vec![
                cell(&item.insurer),
                cell(&item.monthly_premium),
                cell(&item.annual_premium),
            ]
        })
        .collect();

    let mut out = format!("### Premiums\n\n{}", table(&headers, &rows));
    if let Some(cheapest) = premiums.cheapest.as_str().filter(|s| !s.is_empty()) {
        out.push_str(&format!("\n\n**Cheapest:** {}", cheapest));
    }
    if let Some(difference) = premiums.difference.as_str().filter(|s| !s.is_empty()) {
        out.push_str(&format!("\n\n{}", difference));
    }
    Some(out)
}

fn cover_section(section: &Value) -> Option<String> {
    let cover: CoverComparison = serde_json::from_value(section.clone()).unwrap_or_default();
    if cover.features.is_empty() {
        return None;
    }

    let mut insurers: Vec<&String> = Vec::new();
    for feature in &cover.features {
        for name in feature.values.keys() {
            if !insurers.contains(&name) {
                insurers.push(name);
            }
        }
    }

    let headers: Vec<String> = std::iter::once("Feature".to_string())
        .chain(insurers.iter().map(|s| s.to_string()))
        .collect();
    let rows: Vec<Vec<String>> = cover
        .features
        .iter()
        .map(|feature| {
            std::iter::once(cell(&feature.feature))
                .chain(
                    insurers
                        .iter()
                        .map(|name| cell(feature.values.get(*name).unwrap_or(&Value::Null))),
                )
                .collect()
        })
        .collect();

    Some(format!("### Cover\n\n{}", table(&headers, &rows)))
}
