//! EPUB 2 container pieces: fixed files, package documents and navigation.
//!
//! The generated book uses a flat layout:
//!
//! ```text
//! mimetype
//! META-INF/container.xml
//! content.opf
//! toc.ncx
//! stylesheet.css
//! titlepage.xhtml
//! cover.jpg
//! images/<chapter>_img_<k>.jpg
//! text/toc.html
//! text/chapter_<n>.html
//! ```
//!
//! [`archive`] packs and unpacks the zip container, [`nav`] reads and
//! rewrites `toc.ncx` and `content.opf` of arbitrary input books.

pub mod archive;
pub mod nav;

use crate::error::PipelineError;
use crate::pipeline::markup::escape_text;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

pub const MIMETYPE: &str = "application/epub+zip";
pub const MIMETYPE_FILE: &str = "mimetype";
pub const CONTAINER_FILE: &str = "META-INF/container.xml";
pub const OPF_FILE: &str = "content.opf";
pub const NCX_FILE: &str = "toc.ncx";
pub const STYLESHEET_FILE: &str = "stylesheet.css";
pub const TITLEPAGE_FILE: &str = "titlepage.xhtml";
pub const COVER_FILE: &str = "cover.jpg";
pub const TOC_HTML_FILE: &str = "text/toc.html";
pub const TEXT_DIR: &str = "text";
pub const IMAGES_DIR: &str = "images";

/// Stylesheet href as seen from a document in `text/`.
pub const STYLESHEET_HREF: &str = "../stylesheet.css";

pub const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
   <rootfiles>
      <rootfile full-path="content.opf" media-type="application/oebps-package+xml"/>
   </rootfiles>
</container>
"#;

pub const STYLESHEET: &str = r#"@namespace h "http://www.w3.org/1999/xhtml";
body {
    font-family: serif;
    line-height: 1.8;
    margin: 2em auto;
    padding: 0 1em;
    color: #333;
}
h1 {
    text-align: center;
    margin: 1em 0 2em;
    font-size: 2em;
    border-bottom: 2px solid #ccc;
    padding-bottom: 0.5em;
}
h2 {
    font-size: 1.5em;
    margin: 2.5em 0 1em;
    border-bottom: 1px solid #ddd;
    padding-bottom: 0.3em;
}
h3 {
    font-size: 1.2em;
    margin: 2em 0 0.8em;
}
p {
    margin-bottom: 1.2em;
    text-indent: 1em;
    text-align: justify;
}
.figure {
    text-align: center;
    margin: 1.5em 0;
}
.figure img {
    max-width: 100%;
}
.image-placeholder {
    margin: 1.5em 0;
    font-style: italic;
    color: #888;
}
.footnotes {
    margin-top: 4em;
    padding-top: 1em;
    border-top: 1px solid #ccc;
    font-size: 0.9em;
}
sup {
    font-size: 0.8em;
    vertical-align: super;
}
"#;

/// Book-level metadata written into the package documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookMeta {
    pub title: String,
    pub author: Option<String>,
    /// BCP 47 code, see [`language_code`].
    pub language: String,
    /// `urn:uuid:…`, stable across runs.
    pub book_id: String,
}

/// One navigation entry, in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavEntry {
    pub id: String,
    pub title: String,
    /// Path relative to the book root, e.g. `text/chapter_1.html`.
    pub href: String,
}

/// Map a language name to a BCP 47 tag. Unknown names pass through lowercased.
pub fn language_code(language: &str) -> String {
    let lower = language.trim().to_ascii_lowercase();
    let code = match lower.as_str() {
        "english" => "en",
        "chinese" | "simplified chinese" => "zh",
        "traditional chinese" => "zh-Hant",
        "japanese" => "ja",
        "korean" => "ko",
        "french" => "fr",
        "german" => "de",
        "spanish" => "es",
        "italian" => "it",
        "portuguese" => "pt",
        "russian" => "ru",
        "arabic" => "ar",
        _ => return lower,
    };
    code.to_string()
}

/// Title page showing the cover image scaled to the viewport.
pub fn titlepage_xhtml(title: &str, cover: Option<(u32, u32)>) -> String {
    let body = match cover {
        Some((w, h)) => format!(
            r#"<div>
      <svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" version="1.1" width="100%" height="100%" viewBox="0 0 {w} {h}" preserveAspectRatio="xMidYMid meet">
        <image width="{w}" height="{h}" xlink:href="{COVER_FILE}"/>
      </svg>
    </div>"#
        ),
        None => format!("<h1>{}</h1>", escape_text(title)),
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
  <head>
    <meta http-equiv="Content-Type" content="text/html; charset=UTF-8"/>
    <title>{}</title>
    <style type="text/css">
      @page {{ padding: 0pt; margin: 0pt }}
      body {{ text-align: center; padding: 0pt; margin: 0pt; }}
    </style>
  </head>
  <body>
    {}
  </body>
</html>
"#,
        escape_text(title),
        body
    )
}

/// Table of contents built from the outline, used when the book has no
/// table-of-contents pages to convert.
pub fn outline_toc_html(title: &str, chapters: &[NavEntry]) -> String {
    let items: String = chapters
        .iter()
        .map(|c| {
            let href = c.href.strip_prefix("text/").unwrap_or(&c.href);
            format!(
                "    <li><a href=\"{}\">{}</a></li>\n",
                escape_text(href),
                escape_text(&c.title)
            )
        })
        .collect();
    let markup = format!("<h1>{}</h1>\n<ol>\n{}</ol>", escape_text(title), items);
    crate::pipeline::markup::to_xhtml_document(title, &markup, STYLESHEET_HREF)
}

/// `toc.ncx`: title page, table of contents, then chapters.
pub fn toc_ncx(meta: &BookMeta, chapters: &[NavEntry]) -> String {
    let mut points = vec![
        NavEntry {
            id: "titlepage".into(),
            title: meta.title.clone(),
            href: TITLEPAGE_FILE.into(),
        },
        NavEntry {
            id: "toc".into(),
            title: "Contents".into(),
            href: TOC_HTML_FILE.into(),
        },
    ];
    points.extend(chapters.iter().cloned());

    let nav: String = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!(
                r#"    <navPoint class="chapter" id="{}" playOrder="{}">
      <navLabel>
        <text>{}</text>
      </navLabel>
      <content src="{}"/>
    </navPoint>
"#,
                escape_text(&p.id),
                i + 1,
                escape_text(&p.title),
                escape_text(&p.href)
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1" xml:lang="{lang}">
  <head>
    <meta content="{id}" name="dtb:uid"/>
    <meta content="1" name="dtb:depth"/>
    <meta content="0" name="dtb:totalPageCount"/>
    <meta content="0" name="dtb:maxPageNumber"/>
  </head>
  <docTitle>
    <text>{title}</text>
  </docTitle>
  <navMap>
{nav}  </navMap>
</ncx>
"#,
        lang = escape_text(&meta.language),
        id = escape_text(&meta.book_id),
        title = escape_text(&meta.title),
        nav = nav
    )
}

fn image_media_type(name: &str) -> &'static str {
    match Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

/// `content.opf` listing every chapter and image.
///
/// `images` are file names inside `images/`.
pub fn content_opf(
    meta: &BookMeta,
    chapters: &[NavEntry],
    images: &[String],
    has_cover: bool,
    modified: DateTime<Utc>,
) -> String {
    let mut manifest = String::new();
    if has_cover {
        manifest.push_str(&format!(
            "    <item href=\"{COVER_FILE}\" id=\"cover\" media-type=\"image/jpeg\"/>\n"
        ));
    }
    manifest.push_str(&format!(
        "    <item href=\"{TITLEPAGE_FILE}\" id=\"titlepage\" media-type=\"application/xhtml+xml\"/>\n"
    ));
    manifest.push_str(&format!(
        "    <item href=\"{TOC_HTML_FILE}\" id=\"toc\" media-type=\"application/xhtml+xml\"/>\n"
    ));
    for c in chapters {
        manifest.push_str(&format!(
            "    <item href=\"{}\" id=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
            escape_text(&c.href),
            escape_text(&c.id)
        ));
    }
    for (i, name) in images.iter().enumerate() {
        manifest.push_str(&format!(
            "    <item href=\"{IMAGES_DIR}/{}\" id=\"img_{}\" media-type=\"{}\"/>\n",
            escape_text(name),
            i + 1,
            image_media_type(name)
        ));
    }
    manifest.push_str(&format!(
        "    <item href=\"{STYLESHEET_FILE}\" id=\"css\" media-type=\"text/css\"/>\n"
    ));
    manifest.push_str(&format!(
        "    <item href=\"{NCX_FILE}\" id=\"ncx\" media-type=\"application/x-dtbncx+xml\"/>\n"
    ));

    let mut spine = String::from("    <itemref idref=\"titlepage\"/>\n    <itemref idref=\"toc\"/>\n");
    for c in chapters {
        spine.push_str(&format!("    <itemref idref=\"{}\"/>\n", escape_text(&c.id)));
    }

    let creator = meta
        .author
        .as_deref()
        .map(|a| format!("    <dc:creator opf:role=\"aut\">{}</dc:creator>\n", escape_text(a)))
        .unwrap_or_default();
    let cover_meta = if has_cover {
        "    <meta name=\"cover\" content=\"cover\"/>\n"
    } else {
        ""
    };
    let first = chapters
        .first()
        .map(|c| {
            format!(
                "    <reference href=\"{}\" title=\"Start\" type=\"text\"/>\n",
                escape_text(&c.href)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="uuid_id" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:title>{title}</dc:title>
    <dc:identifier id="uuid_id" opf:scheme="uuid">{id}</dc:identifier>
    <dc:language>{lang}</dc:language>
    <dc:date>{date}</dc:date>
{creator}{cover_meta}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
  <guide>
    <reference href="{toc}" title="Contents" type="toc"/>
    <reference href="{titlepage}" title="Cover" type="cover"/>
{first}  </guide>
</package>
"#,
        title = escape_text(&meta.title),
        id = escape_text(&meta.book_id),
        lang = escape_text(&meta.language),
        date = modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        toc = TOC_HTML_FILE,
        titlepage = TITLEPAGE_FILE,
    )
}

/// Write the fixed files of a new book: mimetype, container and stylesheet.
pub async fn write_scaffold(book_dir: &Path) -> Result<(), PipelineError> {
    for (rel, body) in [
        (MIMETYPE_FILE, MIMETYPE),
        (CONTAINER_FILE, CONTAINER_XML),
        (STYLESHEET_FILE, STYLESHEET),
    ] {
        crate::persist::write_atomic(&book_dir.join(rel), body.as_bytes()).await?;
    }
    tokio::fs::create_dir_all(book_dir.join(IMAGES_DIR))
        .await
        .map_err(|e| PipelineError::persistence(book_dir.join(IMAGES_DIR), e))?;
    debug!("Wrote EPUB scaffold in {}", book_dir.display());
    Ok(())
}

static RE_IMAGE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:src|xlink:href)\s*=\s*["'](?:\.\./)?images/([^"']+)["']"#).unwrap());

/// File names under `images/` that `html` references.
pub fn referenced_images(html: &str) -> BTreeSet<String> {
    RE_IMAGE_REF
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect()
}

/// Delete images no document references; returns the names that remain, sorted.
pub async fn clean_unused_images(book_dir: &Path) -> Result<Vec<String>, PipelineError> {
    let images_dir = book_dir.join(IMAGES_DIR);
    let mut referenced = BTreeSet::new();
    for entry in walkdir::WalkDir::new(book_dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        let is_doc = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "html" | "xhtml" | "htm"));
        if is_doc {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| PipelineError::persistence(path, e))?;
            referenced.extend(referenced_images(&text));
        }
    }

    let mut kept = Vec::new();
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(&images_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(kept),
        Err(e) => return Err(PipelineError::persistence(&images_dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::persistence(&images_dir, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if referenced.contains(&name) {
            kept.push(name);
        } else {
            tokio::fs::remove_file(entry.path())
                .await
                .map_err(|e| PipelineError::persistence(entry.path(), e))?;
            removed += 1;
        }
    }
    kept.sort();
    info!("Removed {} unused image(s), {} kept", removed, kept.len());
    Ok(kept)
}
