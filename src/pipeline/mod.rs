//! Building blocks shared by the extraction, generation and translation stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ llm ──▶ markup
//! (URL/path)  (pdfium)  (JPEG/b64) (model)  (cleanup, checks)
//! ```
//!
//! 1. [`input`]: canonicalise the user-supplied path or URL and pin it in
//!    the job directory
//! 2. [`render`]: rasterise pages and pull embedded images; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`encode`]: JPEG-encode page images, stepping down DPI and quality
//!    until the payload fits the size threshold
//! 4. [`llm`]: the [`llm::ModelService`] seam and its edgequake-llm
//!    implementation; the only stage with network I/O
//! 5. [`markup`]: strip fences from model HTML, check it parses, compare tag
//!    skeletons and substitute image placeholders

pub mod encode;
pub mod input;
pub mod llm;
pub mod markup;
pub mod render;
