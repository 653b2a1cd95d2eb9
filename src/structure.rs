//! Document structure: the ordered outline every later stage walks.
//!
//! The model answers the outline request with the JSON shape described by
//! [`Outline`]; [`DocumentStructure::from_outline`] turns it into validated
//! [`Section`]s with stable ids (`chapter_1`, `chapter_2`, …) in reading order.
//!
//! Validation rules, applied both to fresh model output and to an artifact
//! loaded from disk:
//!
//! * at least one section
//! * every range has `1 ≤ start ≤ end ≤ page_count`
//! * starts never decrease
//! * no gap: a section starts at most one page after the previous one ends
//!   (overlap is allowed, chapters often share a page)
//! * ids are unique

use crate::error::UnitError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Inclusive 1-based PDF page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, page: usize) -> bool {
        page >= self.start && page <= self.end
    }

    /// Widen by `buffer` pages on each side, clamped to `1..=page_count`.
    pub fn widened(&self, buffer: usize, page_count: usize) -> PageRange {
        PageRange {
            start: self.start.saturating_sub(buffer).max(1),
            end: (self.end + buffer).min(page_count.max(1)),
        }
    }

    pub fn pages(&self) -> impl Iterator<Item = usize> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// A nested heading inside a section; informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSection {
    pub title: String,
    pub level: u8,
    pub pages: PageRange,
}

/// One unit of generation and translation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub level: u8,
    pub pages: PageRange,
    /// Pages holding figures worth extracting, as reported by the model.
    #[serde(default)]
    pub image_refs: Vec<usize>,
    #[serde(default)]
    pub subsections: Vec<SubSection>,
}

impl Section {
    /// File name of the generated chapter inside the EPUB text directory.
    pub fn file_name(&self) -> String {
        format!("{}.html", self.id)
    }
}

/// The structure artifact of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStructure {
    pub title: String,
    pub page_count: usize,
    pub cover_page: Option<usize>,
    pub toc_pages: Option<PageRange>,
    pub back_cover: Option<usize>,
    pub sections: Vec<Section>,
}

impl DocumentStructure {
    /// Build and validate from the model's outline.
    pub fn from_outline(
        outline: Outline,
        title: &str,
        page_count: usize,
    ) -> Result<Self, UnitError> {
        let sections = outline
            .chapters
            .into_iter()
            .enumerate()
            .map(|(i, ch)| Section {
                id: format!("chapter_{}", i + 1),
                title: ch.title.trim().to_string(),
                level: ch.level.unwrap_or(1),
                pages: PageRange::new(ch.start_page, ch.end_page),
                image_refs: ch.image_pages,
                subsections: ch
                    .subchapters
                    .into_iter()
                    .map(|s| SubSection {
                        title: s.title.trim().to_string(),
                        level: s.level.unwrap_or(2),
                        pages: PageRange::new(s.start_page, s.end_page),
                    })
                    .collect(),
            })
            .collect();

        let structure = DocumentStructure {
            title: title.to_string(),
            page_count,
            cover_page: outline.cover_page.map(|c| c.page_number),
            toc_pages: outline
                .table_of_contents
                .filter(|t| t.start_page >= 1 && t.start_page <= t.end_page)
                .map(|t| PageRange::new(t.start_page, t.end_page.min(page_count))),
            back_cover: outline.back_cover.map(|c| c.page_number),
            sections,
        };
        structure.validate()?;
        Ok(structure)
    }

    /// Parse the raw model answer. Tolerates code fences and prose around the JSON.
    pub fn parse_response(raw: &str, title: &str, page_count: usize) -> Result<Self, UnitError> {
        let json = extract_json_object(raw)
            .ok_or_else(|| UnitError::Validation("response contains no JSON object".into()))?;
        let outline: Outline = serde_json::from_str(json)
            .map_err(|e| UnitError::Validation(format!("outline JSON does not parse: {e}")))?;
        Self::from_outline(outline, title, page_count)
    }

    pub fn validate(&self) -> Result<(), UnitError> {
        if self.sections.is_empty() {
            return Err(UnitError::Validation("outline has no sections".into()));
        }

        let mut seen = HashSet::new();
        let mut prev: Option<&Section> = None;
        for s in &self.sections {
            if !seen.insert(s.id.as_str()) {
                return Err(UnitError::Validation(format!("duplicate section id '{}'", s.id)));
            }
            let PageRange { start, end } = s.pages;
            if start == 0 || start > end {
                return Err(UnitError::Validation(format!(
                    "section '{}' has invalid page range {start}-{end}",
                    s.title
                )));
            }
            if self.page_count > 0 && end > self.page_count {
                return Err(UnitError::Validation(format!(
                    "section '{}' ends on page {end} but the document has {} pages",
                    s.title, self.page_count
                )));
            }
            if let Some(p) = prev {
                if start < p.pages.start {
                    return Err(UnitError::Validation(format!(
                        "section '{}' starts on page {start}, before '{}' (page {})",
                        s.title, p.title, p.pages.start
                    )));
                }
                if start > p.pages.end + 1 {
                    return Err(UnitError::Validation(format!(
                        "pages {}-{} between '{}' and '{}' belong to no section",
                        p.pages.end + 1,
                        start - 1,
                        p.title,
                        s.title
                    )));
                }
            }
            prev = Some(s);
        }
        Ok(())
    }

    pub fn section(&self, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }
}

// ── Model outline wire format ─────────────────────────────────────────────

/// JSON shape requested from the model.
#[derive(Debug, Clone, Deserialize)]
pub struct Outline {
    #[serde(default)]
    pub cover_page: Option<PageRef>,
    #[serde(default)]
    pub table_of_contents: Option<TocRef>,
    #[serde(default)]
    pub chapters: Vec<OutlineChapter>,
    #[serde(default)]
    pub back_cover: Option<PageRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageRef {
    pub page_number: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TocRef {
    pub start_page: usize,
    pub end_page: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineChapter {
    pub title: String,
    pub start_page: usize,
    pub end_page: usize,
    #[serde(default)]
    pub level: Option<u8>,
    #[serde(default)]
    pub subchapters: Vec<OutlineSubchapter>,
    #[serde(default)]
    pub image_pages: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineSubchapter {
    pub title: String,
    pub start_page: usize,
    pub end_page: usize,
    #[serde(default)]
    pub level: Option<u8>,
}

/// Slice from the first `{` to the last `}`.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}
