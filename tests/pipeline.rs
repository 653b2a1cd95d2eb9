//! Integration tests for the extract → generate → translate flow.
//!
//! The model is a scripted [`ModelService`] keyed by request label and the
//! PDF is an in-memory [`PageSource`] of blank pages, so these tests run
//! offline and without pdfium. Call counts are the observable: a resumed
//! stage must not ask the model for anything it already has.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use edgequake_pdf2epub::extract::extract_structure;
use edgequake_pdf2epub::generate::generate;
use edgequake_pdf2epub::translate::translate;
use edgequake_pdf2epub::{
    DocumentStructure, Job, JobConfig, Ledger, ModelRequest, ModelResponse, ModelService,
    PageSource, PipelineError, Stage, StageReport, StructureCheck, UnitError, UnitState,
};
use image::DynamicImage;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ── Test doubles ─────────────────────────────────────────────────────────────

const PAGES: usize = 6;

const OUTLINE: &str = r#"```json
{
  "cover_page": {"page_number": 1},
  "chapters": [
    {"title": "Chapter One", "start_page": 2, "end_page": 4, "level": 1},
    {"title": "Chapter Two", "start_page": 5, "end_page": 6, "level": 1}
  ]
}
```"#;

const TRANSLATED_TITLE: &str = "Le Livre Test";

fn chapter_body(n: &str) -> String {
    format!(
        "<body>\n<h1>Chapter {n}</h1>\n<p>Text of chapter {n} runs on for a while so that it is \
         longer than any context window used here, end of chapter {n}.</p>\n</body>"
    )
}

/// Answers by label. Labels listed in `failing` get that error instead;
/// labels in `reshaped` get markup whose tag structure differs from the input.
#[derive(Default)]
struct ScriptedModel {
    requests: Mutex<Vec<ModelRequest>>,
    failing: Mutex<HashMap<String, UnitError>>,
    reshaped: Mutex<HashSet<String>>,
}

impl ScriptedModel {
    fn reshape(&self, label: &str) {
        self.reshaped.lock().unwrap().insert(label.to_string());
    }

    fn fail(&self, label: &str, error: UnitError) {
        self.failing.lock().unwrap().insert(label.to_string(), error);
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn calls(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.label.starts_with(prefix))
            .count()
    }

    fn total(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, label: &str) -> Option<ModelRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.label == label)
            .cloned()
    }

    fn translation_requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.label.starts_with("translate/text/"))
            .cloned()
            .collect()
    }

    fn answer(request: &ModelRequest) -> Result<String, UnitError> {
        let label = request.label.as_str();
        match label {
            "structure" => Ok(OUTLINE.to_string()),
            "generate/chapter_1" => Ok(chapter_body("one")),
            "generate/chapter_2" => Ok(chapter_body("two")),
            "translate/title" => Ok(format!("\"{TRANSLATED_TITLE}\"")),
            "translate/toc" => Ok(request
                .content
                .lines()
                .enumerate()
                .map(|(i, line)| format!("{}. [fr] {}", i + 1, line))
                .collect::<Vec<_>>()
                .join("\n")),
            _ if label.starts_with("translate/") => {
                Ok(request.content.replace("Text of", "Texte de"))
            }
            _ => Err(UnitError::Fatal(format!("unscripted request {label}"))),
        }
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, UnitError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(error) = self.failing.lock().unwrap().get(&request.label) {
            return Err(error.clone());
        }
        let mut content = Self::answer(request)?;
        if self.reshaped.lock().unwrap().contains(&request.label) {
            content = content
                .replace("<p>", "<blockquote><p>")
                .replace("</p>", "</p></blockquote>");
        }
        Ok(ModelResponse {
            content,
            input_tokens: 100,
            output_tokens: 50,
        })
    }
}

/// Blank pages, no embedded images.
struct BlankPages;

#[async_trait]
impl PageSource for BlankPages {
    async fn page_count(&self) -> Result<usize, PipelineError> {
        Ok(PAGES)
    }

    async fn render(&self, pages: &[usize]) -> Result<Vec<(usize, DynamicImage)>, PipelineError> {
        Ok(pages
            .iter()
            .filter(|p| (1..=PAGES).contains(*p))
            .map(|&p| (p, DynamicImage::new_rgb8(60, 80)))
            .collect())
    }

    async fn extract_images(&self, _page: usize) -> Result<Vec<DynamicImage>, PipelineError> {
        Ok(Vec::new())
    }
}

// ── Test helpers ─────────────────────────────────────────────────────────────

fn config(work_dir: &Path) -> JobConfig {
    JobConfig::builder()
        .title("Test Book")
        .target_language("French")
        .work_dir(work_dir)
        .base_backoff_ms(1)
        .max_backoff_seconds(1)
        .build()
        .unwrap()
}

fn job(config: JobConfig, model: &Arc<ScriptedModel>) -> Job {
    let service: Arc<dyn ModelService> = model.clone();
    Job::new(config, service)
}

async fn extract_and_generate(job: &Job) -> (DocumentStructure, StageReport) {
    let structure = extract_structure(job, &BlankPages).await.unwrap();
    let report = generate(job, &BlankPages, &structure).await.unwrap();
    (structure, report)
}

fn read_zip_entry(path: &Path, name: &str) -> String {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut text = String::new();
    entry.read_to_string(&mut text).unwrap();
    text
}

fn zip_entries(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    archive.file_names().map(str::to_string).collect()
}

fn first_zip_entry(path: &Path) -> String {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let entry = archive.by_index(0).unwrap();
    entry.name().to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_then_rerun_makes_no_model_calls() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    let job = job(config(dir.path()), &model);

    let (structure, generated) = extract_and_generate(&job).await;
    assert_eq!(structure.sections.len(), 2);
    assert!(generated.is_success(), "{}", generated.summary());
    let epub = generated.artifact.clone().unwrap();
    assert!(epub.is_file());
    assert_eq!(first_zip_entry(&epub), "mimetype");
    assert!(read_zip_entry(&epub, "text/chapter_2.html").contains("end of chapter two."));

    let translated = translate(&job, &epub).await.unwrap();
    assert!(translated.is_success(), "{}", translated.summary());
    let translated_epub = translated.artifact.clone().unwrap();
    assert_ne!(translated_epub, epub);
    assert!(read_zip_entry(&translated_epub, "content.opf").contains(TRANSLATED_TITLE));
    assert!(read_zip_entry(&translated_epub, "toc.ncx").contains("[fr] Chapter Two"));
    assert!(read_zip_entry(&translated_epub, "text/chapter_1.html").contains("Texte de chapter one"));
    // untranslated source book stays as it was
    assert!(read_zip_entry(&epub, "text/chapter_1.html").contains("Text of chapter one"));

    assert_eq!(model.calls("structure"), 1);
    assert_eq!(model.calls("generate/"), 2);
    // title, toc labels, contents page and two chapters; the cover page has no text
    assert_eq!(model.calls("translate/"), 5);
    let calls = model.total();

    let (_, generated) = extract_and_generate(&job).await;
    let translated = translate(&job, &epub).await.unwrap();
    assert_eq!(model.total(), calls);
    assert!(generated.completed.is_empty());
    assert!(translated.completed.is_empty());
    assert_eq!(generated.skipped.len(), 6);
    assert_eq!(translated.skipped.len(), 9);
    assert_eq!(generated.artifact, Some(epub));
    assert_eq!(translated.artifact, Some(translated_epub));
}

#[tokio::test]
async fn failed_chapter_is_isolated_and_retried_alone() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.fail("generate/chapter_2", UnitError::Fatal("content filtered".into()));
    let job = job(config(dir.path()), &model);

    let (_, report) = extract_and_generate(&job).await;
    assert_eq!(report.failed_ids(), ["chapter_2"]);
    assert_eq!(report.failed[0].attempts, 1, "fatal errors are not retried");
    assert!(report.completed.contains(&"chapter_1".to_string()));
    assert!(report.artifact.is_none(), "a partial book is never packaged");
    assert!(matches!(
        report.into_result(),
        Err(PipelineError::UnitsFailed { .. })
    ));

    let ledger = Ledger::load(job.paths.ledger(Stage::Generate), Stage::Generate)
        .await
        .unwrap();
    assert_eq!(ledger.state("chapter_1"), UnitState::Done);
    assert_eq!(ledger.state("chapter_2"), UnitState::Failed);
    assert_eq!(ledger.state("package"), UnitState::Pending);

    model.heal();
    let (_, report) = extract_and_generate(&job).await;
    assert_eq!(report.completed, ["chapter_2", "package"]);
    assert_eq!(model.calls("generate/chapter_1"), 1);
    assert_eq!(model.calls("generate/chapter_2"), 2);
    assert!(report.artifact.unwrap().is_file());
}

#[tokio::test]
async fn retries_stop_at_the_configured_bound() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.fail("generate/chapter_1", UnitError::Transient("503 service unavailable".into()));
    let job = job(config(dir.path()), &model);

    let (_, report) = extract_and_generate(&job).await;
    let retries = job.config.num_retries as usize;
    assert_eq!(model.calls("generate/chapter_1"), retries + 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].attempts as usize, retries + 1);
    assert!(matches!(report.failed[0].error, UnitError::Transient(_)));
    assert!(report.completed.contains(&"chapter_2".to_string()));

    let ledger = Ledger::load(job.paths.ledger(Stage::Generate), Stage::Generate)
        .await
        .unwrap();
    let record = ledger.get("chapter_1").unwrap();
    assert_eq!(record.attempts as usize, retries + 1);
    assert!(record.last_error.is_some());
}

#[tokio::test]
async fn invalid_model_output_is_reprompted() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.fail("generate/chapter_1", UnitError::Validation("no markup".into()));
    let job = job(config(dir.path()), &model);

    let (_, report) = extract_and_generate(&job).await;
    assert_eq!(report.failed_ids(), ["chapter_1"]);
    assert_eq!(model.calls("generate/chapter_1"), job.config.num_retries as usize + 1);
}

#[tokio::test]
async fn context_window_carries_at_most_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    let mut config = config(dir.path());
    config.previous_content_limit = 50;
    let job = job(config, &model);

    let (_, generated) = extract_and_generate(&job).await;
    translate(&job, &generated.artifact.unwrap()).await.unwrap();

    // nothing with text precedes the contents page
    let contents = model.request("translate/text/toc.html").unwrap();
    assert_eq!(contents.context, None);

    let second = model.request("translate/text/chapter_2.html").unwrap();
    let context = second.context.unwrap();
    assert_eq!(context.chars().count(), 50);
    assert!(context.ends_with("end of chapter one."), "{context:?}");

    for request in model.translation_requests() {
        if let Some(c) = &request.context {
            assert!(c.chars().count() <= 50, "{}: {c:?}", request.label);
        }
    }
}

#[tokio::test]
async fn zero_limit_sends_no_context() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    let job = job(config(dir.path()), &model);

    let (_, generated) = extract_and_generate(&job).await;
    translate(&job, &generated.artifact.unwrap()).await.unwrap();

    let requests = model.translation_requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.context.is_none()));
}

#[tokio::test]
async fn failed_document_is_left_out_of_the_context() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.fail(
        "translate/text/chapter_1.html",
        UnitError::Fatal("content filtered".into()),
    );
    let mut config = config(dir.path());
    config.previous_content_limit = 500;
    let job = job(config, &model);

    let (_, generated) = extract_and_generate(&job).await;
    let report = translate(&job, &generated.artifact.unwrap()).await.unwrap();
    assert_eq!(report.failed_ids(), ["text/chapter_1.html"]);
    assert!(report.artifact.is_none());

    let context = model
        .request("translate/text/chapter_2.html")
        .unwrap()
        .context
        .unwrap();
    assert!(!context.contains("chapter one"), "{context:?}");
    assert!(context.contains("Chapter Two"));
}

#[tokio::test]
async fn deleted_ledger_regenerates_everything() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    let job = job(config(dir.path()), &model);

    extract_and_generate(&job).await;
    std::fs::remove_file(job.paths.ledger(Stage::Generate)).unwrap();

    let (_, report) = extract_and_generate(&job).await;
    assert!(report.skipped.is_empty());
    assert_eq!(report.completed.len(), 6);
    assert_eq!(model.calls("generate/"), 4);
    // the structure artifact is separate from the ledger
    assert_eq!(model.calls("structure"), 1);
}

#[tokio::test]
async fn missing_chapter_file_is_regenerated_and_repackaged() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    let job = job(config(dir.path()), &model);

    extract_and_generate(&job).await;
    std::fs::remove_file(job.paths.epub_dir().join("text/chapter_1.html")).unwrap();

    let (_, report) = extract_and_generate(&job).await;
    assert_eq!(report.completed, ["chapter_1", "package"]);
    assert_eq!(model.calls("generate/chapter_1"), 2);
    assert_eq!(model.calls("generate/chapter_2"), 1);
    let epub = report.artifact.unwrap();
    assert!(read_zip_entry(&epub, "text/chapter_1.html").contains("end of chapter one."));
}

#[tokio::test]
async fn fresh_runner_resumes_from_remote_state() {
    let remote = tempfile::tempdir().unwrap();
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.fail("generate/chapter_2", UnitError::Fatal("content filtered".into()));

    let mut first = config(first_dir.path());
    first.remote_dir = Some(remote.path().to_path_buf());
    let first = job(first, &model);
    first.pull().await.unwrap();
    let (_, report) = extract_and_generate(&first).await;
    assert_eq!(report.failed_ids(), ["chapter_2"]);
    first.push_all().await.unwrap();

    model.heal();
    let mut second = config(second_dir.path());
    second.remote_dir = Some(remote.path().to_path_buf());
    let second = job(second, &model);
    second.pull().await.unwrap();
    let (_, report) = extract_and_generate(&second).await;

    assert_eq!(model.calls("structure"), 1);
    assert_eq!(model.calls("generate/chapter_1"), 1);
    assert_eq!(model.calls("generate/chapter_2"), 2);
    assert!(report.skipped.contains(&"chapter_1".to_string()));
    assert!(report.is_success(), "{}", report.summary());
    let epub: PathBuf = report.artifact.unwrap();
    assert!(epub.starts_with(second_dir.path()));
}

#[tokio::test]
async fn explicit_target_title_skips_the_title_call() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    let mut config = config(dir.path());
    config.target_title = Some("Livre Choisi".into());
    let job = job(config, &model);

    let (_, generated) = extract_and_generate(&job).await;
    let report = translate(&job, &generated.artifact.unwrap()).await.unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(model.calls("translate/title"), 0);
    let epub = report.artifact.unwrap();
    assert!(epub.ends_with("Livre Choisi.epub"));
    assert!(read_zip_entry(&epub, "content.opf").contains("Livre Choisi"));
}

#[tokio::test]
async fn runner_killed_before_final_push_leaves_a_complete_remote() {
    let remote = tempfile::tempdir().unwrap();
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.fail("generate/chapter_2", UnitError::Fatal("content filtered".into()));

    let mut first = config(first_dir.path());
    first.remote_dir = Some(remote.path().to_path_buf());
    let first = job(first, &model);
    first.pull().await.unwrap();
    let (_, report) = extract_and_generate(&first).await;
    assert_eq!(report.failed_ids(), ["chapter_2"]);
    // no push_all: only the per-unit uploads reached the remote

    model.heal();
    let mut second = config(second_dir.path());
    second.remote_dir = Some(remote.path().to_path_buf());
    let second = job(second, &model);
    second.pull().await.unwrap();
    let (_, report) = extract_and_generate(&second).await;

    for id in ["scaffold", "cover", "toc", "chapter_1"] {
        assert!(report.skipped.contains(&id.to_string()), "{id} was redone");
    }
    assert!(report.is_success(), "{}", report.summary());
    let entries = zip_entries(&report.artifact.unwrap());
    for name in ["stylesheet.css", "cover.jpg", "titlepage.xhtml", "text/chapter_1.html"] {
        assert!(entries.iter().any(|e| e == name), "{name} missing from {entries:?}");
    }
}

#[tokio::test]
async fn strict_check_rejects_reshaped_markup() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.reshape("translate/text/chapter_1.html");
    let job = job(config(dir.path()), &model);

    let (_, generated) = extract_and_generate(&job).await;
    let report = translate(&job, &generated.artifact.unwrap()).await.unwrap();
    assert_eq!(report.failed_ids(), ["text/chapter_1.html"]);
    assert!(matches!(report.failed[0].error, UnitError::Validation(_)));
    assert_eq!(
        model.calls("translate/text/chapter_1.html"),
        job.config.num_retries as usize + 1
    );
    assert!(report.artifact.is_none());
}

#[tokio::test]
async fn lenient_check_accepts_reshaped_markup() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.reshape("translate/text/chapter_1.html");
    let mut config = config(dir.path());
    config.structure_check = StructureCheck::Lenient;
    let job = job(config, &model);

    let (_, generated) = extract_and_generate(&job).await;
    let report = translate(&job, &generated.artifact.unwrap()).await.unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(model.calls("translate/text/chapter_1.html"), 1);
    let epub = report.artifact.unwrap();
    assert!(read_zip_entry(&epub, "text/chapter_1.html").contains("<blockquote>"));
}

#[tokio::test]
async fn translation_resumes_with_only_the_unfinished_documents() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::default());
    model.fail(
        "translate/text/chapter_2.html",
        UnitError::Fatal("content filtered".into()),
    );
    let job = job(config(dir.path()), &model);

    let (_, generated) = extract_and_generate(&job).await;
    let epub = generated.artifact.unwrap();
    let report = translate(&job, &epub).await.unwrap();
    assert_eq!(report.failed_ids(), ["text/chapter_2.html"]);
    let ledger = Ledger::load(job.paths.ledger(Stage::Translate), Stage::Translate)
        .await
        .unwrap();
    assert_eq!(ledger.state("text/toc.html"), UnitState::Done);
    assert_eq!(ledger.state("text/chapter_1.html"), UnitState::Done);
    assert_eq!(ledger.state("text/chapter_2.html"), UnitState::Failed);

    model.heal();
    let before = model.total();
    let report = translate(&job, &epub).await.unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.completed, ["text/chapter_2.html", "package"]);
    assert_eq!(model.total() - before, 1);
    assert_eq!(model.calls("translate/text/chapter_1.html"), 1);
    assert_eq!(model.calls("translate/text/toc.html"), 1);
    assert_eq!(model.calls("translate/text/chapter_2.html"), 2);
}
