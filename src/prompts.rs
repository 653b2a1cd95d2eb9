//! Instruction templates for every model call the pipeline makes.
//!
//! Centralising prompts here serves two purposes:
//!
//! 1. **Single source of truth**: changing what the model is asked to do
//!    (e.g. the image placeholder convention) requires editing exactly one place.
//!
//! 2. **Testability**: unit tests inspect the rendered prompts directly
//!    without a model, so regressions in the wire contracts the parsers rely
//!    on (outline JSON, placeholder attributes, numbered title lists) are
//!    caught early.
//!
//! Templates use `{name}` slots filled by the builder functions below.

use crate::structure::{PageRange, Section};

/// Outline request. The JSON shape must stay in sync with [`crate::structure::Outline`].
pub const STRUCTURE_PROMPT: &str = r#"Analyze the attached pages of the book "{title}" and describe its structure.

Include:
1. Cover page (page number)
2. Table of contents (page range)
3. All chapters and subchapters as listed in the table of contents, in reading order
4. Back cover page (page number)

Rules:
- Use the PDF page numbers shown in the image labels, NOT the printed page numbers
- Nearby chapters may overlap when there is no page break between them
- Every page after the table of contents must belong to a chapter
- Keep all titles in their original language
- List pages holding meaningful figures (photos, diagrams, illustrations) in "image_pages"

Return ONLY this JSON, with no commentary:
{
  "cover_page": {"page_number": 1},
  "table_of_contents": {"start_page": 2, "end_page": 3, "entries": [{"title": "…", "page_number": 5, "level": 1}]},
  "chapters": [
    {
      "title": "…",
      "start_page": 5,
      "end_page": 20,
      "level": 1,
      "image_pages": [],
      "subchapters": [{"title": "…", "start_page": 8, "end_page": 12, "level": 2}]
    }
  ],
  "back_cover": {"page_number": 200}
}"#;

/// Chapter conversion request.
pub const CHAPTER_PROMPT: &str = r##"Convert the chapter "{chapter}" from the book "{title}" into clean HTML.

The attached images are PDF pages {slice_start} to {slice_end}. Convert ONLY the chapter content,
which is on pages {actual_start} to {actual_end}. The surrounding pages are context; ignore text
that belongs to neighbouring chapters.

IMAGES:
- For each meaningful image (photo, diagram, illustration) insert a placeholder:
  <div class="image-placeholder" id="img1" data-page="N" data-description="Brief description"></div>
- data-page is the page index RELATIVE to the first attached page (0 = page {slice_start})
- Do NOT add placeholders for decorative elements or text-only pages
{image_hint}
REQUIREMENTS:
- Keep all original text in its original language; do not translate or summarise
- Use one <h1> for the chapter title and <h2>/<h3> for its sections
- Move footnotes to the end of the chapter inside <div class="footnotes">, linked with <sup><a href="#fn1">1</a></sup>
- Reference the stylesheet at ../stylesheet.css; do not inline CSS

Return ONLY the complete HTML document without any other commentary."##;

/// Table-of-contents page request.
pub const TOC_PROMPT: &str = r#"Create an HTML table of contents for the book "{title}".
The attached images are the book's table-of-contents pages.

The HTML must contain:
1. A heading with the table-of-contents title as printed in the book
2. A nested list of every chapter and subchapter with its original title
3. Links of the form "{chapter_file_pattern}" where X is the chapter number from this list:
{chapter_list}

Return ONLY the complete HTML document without any other commentary."#;

/// Section translation request.
pub const TRANSLATE_PROMPT: &str = r#"Translate the HTML document in the user message from {source} to {target}.

Book title: {title}
Chapter title: {chapter}

RESPONSE FORMAT:
- Begin directly with <!DOCTYPE html> or <html>
- Return raw HTML only: no JSON, no code fences, no commentary

TRANSLATION RULES:
1. Preserve every HTML tag, attribute and the nesting exactly; the element sequence must not change
2. Translate only text content and the alt/title attributes
3. Keep class names, ids, links and image references intact
4. Make the translation accurate and natural in {target}
5. Use the standard {target} rendering for names of people, places and works where one exists"#;

/// Book title translation request.
pub const TITLE_PROMPT: &str = r#"Translate the following book title from {source} to {target}.
Return only the translated title without any explanation or additional text.

Book title: {title}"#;

/// Batched chapter-title translation request.
pub const TOC_ENTRIES_PROMPT: &str = r#"Translate the following chapter titles from {source} to {target}.
Return only the translated titles, one per line, numbered exactly as in the original list.

{titles}"#;

pub fn structure_prompt(title: &str) -> String {
    STRUCTURE_PROMPT.replace("{title}", title)
}

/// `slice` is what was rendered, `actual` the section's own pages.
pub fn chapter_prompt(title: &str, section: &Section, slice: PageRange) -> String {
    CHAPTER_PROMPT
        .replace("{chapter}", &section.title)
        .replace("{title}", title)
        .replace("{slice_start}", &slice.start.to_string())
        .replace("{slice_end}", &slice.end.to_string())
        .replace("{actual_start}", &section.pages.start.to_string())
        .replace("{actual_end}", &section.pages.end.to_string())
        .replace("{image_hint}", &image_hint(&section.image_refs))
}

fn image_hint(pages: &[usize]) -> String {
    if pages.is_empty() {
        return String::new();
    }
    let list = pages.iter().map(usize::to_string).collect::<Vec<_>>().join(", ");
    format!("- The outline reports figures on PDF pages {list}\n")
}

pub fn toc_prompt(title: &str, sections: &[Section]) -> String {
    let chapter_list = sections
        .iter()
        .enumerate()
        .map(|(i, s)| format!("   {}. {} → {}", i + 1, s.title, s.file_name()))
        .collect::<Vec<_>>()
        .join("\n");
    TOC_PROMPT
        .replace("{title}", title)
        .replace("{chapter_file_pattern}", "chapter_X.html")
        .replace("{chapter_list}", &chapter_list)
}

pub fn translate_prompt(source: &str, target: &str, title: &str, chapter: &str) -> String {
    TRANSLATE_PROMPT
        .replace("{source}", source)
        .replace("{target}", target)
        .replace("{title}", title)
        .replace("{chapter}", chapter)
}

pub fn title_prompt(source: &str, target: &str, title: &str) -> String {
    TITLE_PROMPT
        .replace("{source}", source)
        .replace("{target}", target)
        .replace("{title}", title)
}

/// Titles are numbered from 1; the answer is parsed by line number.
pub fn toc_entries_prompt(source: &str, target: &str, titles: &[String]) -> String {
    let numbered = titles
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{}. {}", i + 1, t))
        .collect::<Vec<_>>()
        .join("\n");
    TOC_ENTRIES_PROMPT
        .replace("{source}", source)
        .replace("{target}", target)
        .replace("{titles}", &numbered)
}

/// Build the context message carrying prior source text.
///
/// Sent as a separate system message so it is never mistaken for the content
/// to translate.
pub fn context_block(context: &str) -> String {
    format!(
        "Previous chapter content (for context only, do not translate this again):\n\n\"\"\"{}\"\"\"",
        context
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(title: &str, start: usize, end: usize) -> Section {
        Section {
            id: "chapter_2".into(),
            title: title.into(),
            level: 1,
            pages: PageRange::new(start, end),
            image_refs: vec![],
            subsections: vec![],
        }
    }

    #[test]
    fn no_unfilled_slots_remain() {
        let s = section("Two", 10, 12);
        for p in [
            structure_prompt("Book"),
            chapter_prompt("Book", &s, PageRange::new(7, 15)),
            toc_prompt("Book", std::slice::from_ref(&s)),
            translate_prompt("English", "French", "Book", "Two"),
            title_prompt("English", "French", "Book"),
            toc_entries_prompt("English", "French", &["a".into()]),
        ] {
            for slot in ["{title}", "{chapter}", "{source}", "{target}", "{slice_start}", "{titles}"] {
                assert!(!p.contains(slot), "unfilled {slot} in:\n{p}");
            }
        }
    }

    #[test]
    fn chapter_prompt_distinguishes_slice_from_section() {
        let p = chapter_prompt("Book", &section("Two", 10, 12), PageRange::new(7, 15));
        assert!(p.contains("PDF pages 7 to 15"));
        assert!(p.contains("pages 10 to 12"));
        assert!(p.contains("0 = page 7"));
        assert!(p.contains("image-placeholder"));
    }

    #[test]
    fn chapter_prompt_keeps_literal_link_markup() {
        let p = chapter_prompt("Book", &section("Two", 1, 2), PageRange::new(1, 2));
        assert!(p.contains(r##"<sup><a href="#fn1">1</a></sup>"##));
        assert!(p.trim_end().ends_with("without any other commentary."));
    }

    #[test]
    fn chapter_prompt_names_reported_image_pages() {
        let mut s = section("Two", 10, 12);
        assert!(!chapter_prompt("Book", &s, PageRange::new(9, 13)).contains("reports figures"));
        s.image_refs = vec![10, 12];
        let p = chapter_prompt("Book", &s, PageRange::new(9, 13));
        assert!(p.contains("figures on PDF pages 10, 12"));
        assert!(!p.contains("{image_hint}"));
    }

    #[test]
    fn toc_prompt_lists_chapter_files() {
        let p = toc_prompt("Book", &[section("Two", 1, 2)]);
        assert!(p.contains("1. Two → chapter_2.html"));
    }

    #[test]
    fn toc_entries_are_numbered_from_one() {
        let p = toc_entries_prompt("en", "fr", &["Alpha".into(), "Beta".into()]);
        assert!(p.contains("1. Alpha\n2. Beta"));
    }

    #[test]
    fn context_block_quotes_the_context() {
        let c = context_block("tail of chapter one");
        assert!(c.contains("do not translate this again"));
        assert!(c.ends_with("\"\"\"tail of chapter one\"\"\""));
    }
}
