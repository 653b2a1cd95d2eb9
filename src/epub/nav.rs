//! Reading and rewriting the XML documents of an existing book:
//! `container.xml`, the OPF package and the NCX navigation map.
//!
//! Rewrites stream every event through a `quick_xml::Writer` and only swap
//! the text of selected elements, so attributes, namespaces and unknown
//! extensions survive untouched.

use quick_xml::escape::unescape;
use quick_xml::events::{BytesRef, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;

/// One `navPoint` of an NCX map, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavPoint {
    pub title: String,
    /// `content/@src`, relative to the NCX file, fragment included.
    pub src: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
}

/// What the pipeline needs from an OPF package document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageDoc {
    pub title: Option<String>,
    pub manifest: Vec<ManifestItem>,
    /// Manifest hrefs in spine order.
    pub spine: Vec<String>,
    /// Href of the NCX, from `spine/@toc` or the manifest media type.
    pub ncx_href: Option<String>,
}

fn text_of(e: &BytesText) -> String {
    let raw = String::from_utf8_lossy(e);
    match unescape(&raw) {
        Ok(s) => s.into_owned(),
        Err(_) => raw.into_owned(),
    }
}

fn ref_of(e: &BytesRef) -> String {
    let entity = format!("&{};", String::from_utf8_lossy(e));
    match unescape(&entity) {
        Ok(s) => s.into_owned(),
        Err(_) => entity,
    }
}

fn attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| {
            let raw = String::from_utf8_lossy(&a.value).into_owned();
            match unescape(&raw) {
                Ok(s) => s.into_owned(),
                Err(_) => raw,
            }
        })
}

/// `full-path` of the first `rootfile` in `container.xml`.
pub fn rootfile(xml: &str) -> Result<Option<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attr(e, b"full-path") {
                    return Ok(Some(path));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Every `navPoint` with its label and target. Nested points follow their
/// parent; a label belongs to the innermost open point.
pub fn parse_ncx(xml: &str) -> Result<Vec<NavPoint>, quick_xml::Error> {
    // No trimming: text around an entity reference arrives as separate events.
    let mut reader = Reader::from_str(xml);

    let mut points: Vec<NavPoint> = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut in_label = false;
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"navPoint" => {
                    open.push(points.len());
                    points.push(NavPoint {
                        title: String::new(),
                        src: String::new(),
                    });
                }
                b"navLabel" => in_label = true,
                b"text" => in_text = in_label,
                b"content" => set_src(&mut points, &open, e),
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"content" => {
                set_src(&mut points, &open, e)
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"navPoint" => {
                    open.pop();
                }
                b"navLabel" => in_label = false,
                b"text" => in_text = false,
                _ => {}
            },
            Event::Text(ref e) if in_text => push_title(&mut points, &open, &text_of(e)),
            Event::CData(ref e) if in_text => {
                push_title(&mut points, &open, &String::from_utf8_lossy(e))
            }
            Event::GeneralRef(ref e) if in_text => push_title(&mut points, &open, &ref_of(e)),
            Event::Eof => break,
            _ => {}
        }
    }

    for p in &mut points {
        p.title = p.title.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    Ok(points)
}

fn set_src(points: &mut [NavPoint], open: &[usize], e: &BytesStart) {
    if let Some(&i) = open.last() {
        if points[i].src.is_empty() {
            points[i].src = attr(e, b"src").unwrap_or_default();
        }
    }
}

fn push_title(points: &mut [NavPoint], open: &[usize], text: &str) {
    if let Some(&i) = open.last() {
        points[i].title.push_str(text);
    }
}

pub fn parse_opf(xml: &str) -> Result<PackageDoc, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);

    let mut doc = PackageDoc::default();
    let mut spine_ids = Vec::new();
    let mut toc_id = None;
    let mut in_metadata = false;
    let mut title: Option<String> = None;
    let mut in_title = false;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                b"metadata" => in_metadata = matches!(event, Event::Start(_)),
                b"title" if in_metadata && doc.title.is_none() => {
                    in_title = matches!(event, Event::Start(_));
                    title.get_or_insert_with(String::new);
                }
                b"item" => {
                    if let (Some(id), Some(href)) = (attr(e, b"id"), attr(e, b"href")) {
                        doc.manifest.push(ManifestItem {
                            id,
                            href,
                            media_type: attr(e, b"media-type").unwrap_or_default(),
                        });
                    }
                }
                b"spine" => toc_id = attr(e, b"toc"),
                b"itemref" => {
                    if let Some(idref) = attr(e, b"idref") {
                        spine_ids.push(idref);
                    }
                }
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"metadata" => in_metadata = false,
                b"title" if in_title => {
                    in_title = false;
                    doc.title = title.take().map(|t| t.trim().to_string());
                }
                _ => {}
            },
            Event::Text(ref e) if in_title => {
                if let Some(t) = title.as_mut() {
                    t.push_str(&text_of(e));
                }
            }
            Event::GeneralRef(ref e) if in_title => {
                if let Some(t) = title.as_mut() {
                    t.push_str(&ref_of(e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let by_id: HashMap<&str, &ManifestItem> =
        doc.manifest.iter().map(|m| (m.id.as_str(), m)).collect();
    doc.spine = spine_ids
        .iter()
        .filter_map(|id| by_id.get(id.as_str()).map(|m| m.href.clone()))
        .collect();
    doc.ncx_href = toc_id
        .and_then(|id| by_id.get(id.as_str()).map(|m| m.href.clone()))
        .or_else(|| {
            doc.manifest
                .iter()
                .find(|m| m.media_type == "application/x-dtbncx+xml")
                .map(|m| m.href.clone())
        });
    Ok(doc)
}

/// Copy `xml`, replacing the text content of elements for which `replace`
/// returns `Some`. `replace` sees the local names of the open elements
/// (outermost first, the candidate last) and the index of the innermost open
/// `navPoint`.
fn rewrite_elements<F>(xml: &str, mut replace: F) -> Result<String, quick_xml::Error>
where
    F: FnMut(&[Vec<u8>], Option<usize>) -> Option<String>,
{
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut nav_open: Vec<usize> = Vec::new();
    let mut nav_seen = 0usize;
    // Depth of the element whose content is being replaced.
    let mut skipping: Option<usize> = None;

    loop {
        let event = reader.read_event()?;
        if let Some(depth) = skipping {
            match &event {
                Event::Start(_) => path.push(Vec::new()),
                Event::End(_) => {
                    path.pop();
                    if path.len() < depth {
                        skipping = None;
                        writer.write_event(event.borrow())?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        match &event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"navPoint" {
                    nav_open.push(nav_seen);
                    nav_seen += 1;
                }
                path.push(name);
                let replacement = replace(&path, nav_open.last().copied());
                writer.write_event(event.borrow())?;
                if let Some(text) = replacement {
                    writer.write_event(Event::Text(BytesText::new(&text)))?;
                    skipping = Some(path.len());
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"navPoint" {
                    nav_open.pop();
                }
                path.pop();
                writer.write_event(event.borrow())?;
            }
            Event::Eof => break,
            _ => writer.write_event(event.borrow())?,
        }
    }

    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

fn ends_with(path: &[Vec<u8>], tail: &[&[u8]]) -> bool {
    path.len() >= tail.len()
        && path[path.len() - tail.len()..]
            .iter()
            .zip(tail)
            .all(|(a, b)| a.as_slice() == *b)
}

/// Replace the NCX document title and the labels of navigation points.
/// `label_for` receives the point's index in [`parse_ncx`] order.
pub fn rewrite_ncx<F>(
    xml: &str,
    doc_title: Option<&str>,
    mut label_for: F,
) -> Result<String, quick_xml::Error>
where
    F: FnMut(usize) -> Option<String>,
{
    rewrite_elements(xml, |path, nav| {
        if ends_with(path, &[b"navLabel", b"text"]) {
            nav.and_then(&mut label_for)
        } else if ends_with(path, &[b"docTitle", b"text"]) {
            doc_title.map(str::to_string)
        } else {
            None
        }
    })
}

/// Replace `dc:title` in an OPF package.
pub fn rewrite_opf_title(xml: &str, title: &str) -> Result<String, quick_xml::Error> {
    rewrite_elements(xml, |path, _| {
        ends_with(path, &[b"metadata", b"title"]).then(|| title.to_string())
    })
}
