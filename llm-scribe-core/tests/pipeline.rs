use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{Local, TimeZone};
use llm_scribe_core::config::{
    CompletionFailurePolicy, MonitoringRule, OutputFileHandling, ScribeConfig,
    DEFAULT_LOG_FILE, DEFAULT_OUTPUT_TEMPLATE,
};
use llm_scribe_core::contract::{
    CompletionError, CompletionService, FileMeta, FileStore, FixedClock, MockCompletionService,
    MockFileStore, MockTemplateRenderer, StoreError,
};
use llm_scribe_core::pipeline::{Pipeline, ProcessOutcome};
use llm_scribe_core::store::MemoryFileStore;

fn rule() -> MonitoringRule {
    MonitoringRule {
        name: "summarise".to_string(),
        enabled: true,
        folders: vec![PathBuf::from("")],
        delay: 0,
        file_name_template: "*.md".to_string(),
        content_regex: String::new(),
        prompt: "Summarise the note".to_string(),
        template_file: None,
        output_file_name_template: DEFAULT_OUTPUT_TEMPLATE.to_string(),
        output_file_handling: OutputFileHandling::Overwrite,
        delete_source_file: false,
    }
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(
        Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).single().unwrap(),
    ))
}

fn replying(text: &'static str) -> Arc<dyn CompletionService> {
    let mut service = MockCompletionService::new();
    service
        .expect_complete()
        .returning(move |_| Ok(text.to_string()));
    Arc::new(service)
}

fn failing(error: CompletionError) -> Arc<dyn CompletionService> {
    let mut service = MockCompletionService::new();
    service
        .expect_complete()
        .returning(move |_| Err(error.clone()));
    Arc::new(service)
}

fn pipeline_with(
    store: &Arc<MemoryFileStore>,
    service: Arc<dyn CompletionService>,
    policy: CompletionFailurePolicy,
) -> Pipeline {
    let config = ScribeConfig {
        on_completion_failure: policy,
        ..ScribeConfig::default()
    };
    Pipeline::new(
        &config,
        Arc::clone(store) as Arc<dyn FileStore>,
        service,
        clock(),
    )
}

fn log_lines(store: &MemoryFileStore) -> Vec<String> {
    store
        .get(Path::new(DEFAULT_LOG_FILE))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn append_mode_accumulates_outputs_across_runs() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort);
    let rule = MonitoringRule {
        output_file_handling: OutputFileHandling::Append,
        ..rule()
    };

    let first = pipeline.process_file(Path::new("note.md"), &rule).await;
    assert_eq!(
        first,
        ProcessOutcome::Done {
            output: PathBuf::from("note_processed.md"),
            source_deleted: false,
        }
    );
    assert_eq!(store.get(Path::new("note_processed.md")).as_deref(), Some("HELLO"));

    let second = pipeline.process_file(Path::new("note.md"), &rule).await;
    assert!(second.is_done());
    assert_eq!(
        store.get(Path::new("note_processed.md")).as_deref(),
        Some("HELLO\nHELLO")
    );

    let log = log_lines(&store);
    assert_eq!(log.len(), 2);
    assert_eq!(
        log[0],
        "- 2024-05-01 09:30:00 | process | [[note.md]] -> [[note_processed.md]] | rule: summarise | output template: `{{filename}}_processed` | prompt: Summarise the note"
    );
}

#[tokio::test]
async fn content_filter_miss_writes_nothing() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "no numbers in here");
    let mut service = MockCompletionService::new();
    service.expect_complete().never();
    let pipeline = pipeline_with(&store, Arc::new(service), CompletionFailurePolicy::Abort);
    let rule = MonitoringRule {
        content_regex: r"\d+".to_string(),
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("note.md"), &rule).await;

    assert_eq!(outcome, ProcessOutcome::ContentMismatch);
    assert_eq!(store.paths(), vec![PathBuf::from("note.md")]);
    assert!(!pipeline.is_in_flight(Path::new("note.md")));
}

#[tokio::test]
async fn name_mismatch_and_disabled_rule_are_skips() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("data.csv", "1,2,3");
    let pipeline = pipeline_with(&store, replying("x"), CompletionFailurePolicy::Abort);

    assert_eq!(
        pipeline.process_file(Path::new("data.csv"), &rule()).await,
        ProcessOutcome::NameMismatch
    );
    let disabled = MonitoringRule {
        enabled: false,
        ..rule()
    };
    assert_eq!(
        pipeline.process_file(Path::new("data.csv"), &disabled).await,
        ProcessOutcome::RuleDisabled
    );
}

#[tokio::test]
async fn missing_source_is_reported() {
    let store = Arc::new(MemoryFileStore::new());
    let pipeline = pipeline_with(&store, replying("x"), CompletionFailurePolicy::Abort);
    assert_eq!(
        pipeline.process_file(Path::new("gone.md"), &rule()).await,
        ProcessOutcome::SourceMissing
    );
}

#[tokio::test]
async fn delete_source_logs_process_then_delete() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("inbox/note.md", "hello");
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort);
    let rule = MonitoringRule {
        delete_source_file: true,
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("inbox/note.md"), &rule).await;

    assert_eq!(
        outcome,
        ProcessOutcome::Done {
            output: PathBuf::from("inbox/note_processed.md"),
            source_deleted: true,
        }
    );
    assert!(store.get(Path::new("inbox/note.md")).is_none());
    assert_eq!(
        store.get(Path::new("inbox/note_processed.md")).as_deref(),
        Some("HELLO")
    );
    let log = log_lines(&store);
    assert_eq!(log.len(), 2);
    assert!(log[0].contains("| process | [[inbox/note.md]] -> [[inbox/note_processed.md]]"));
    assert!(log[1].contains("| delete | [[inbox/note.md]] -> -"));
}

#[tokio::test]
async fn rename_mode_picks_lowest_free_suffix() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    store.insert("note_processed.md", "first");
    store.insert("note_processed_1.md", "second");
    let pipeline = pipeline_with(&store, replying("third"), CompletionFailurePolicy::Abort);
    let rule = MonitoringRule {
        output_file_handling: OutputFileHandling::Rename,
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("note.md"), &rule).await;

    assert_eq!(
        outcome,
        ProcessOutcome::Done {
            output: PathBuf::from("note_processed_2.md"),
            source_deleted: false,
        }
    );
    assert_eq!(store.get(Path::new("note_processed.md")).as_deref(), Some("first"));
    assert_eq!(store.get(Path::new("note_processed_1.md")).as_deref(), Some("second"));
    assert_eq!(store.get(Path::new("note_processed_2.md")).as_deref(), Some("third"));
}

#[tokio::test]
async fn overwrite_mode_replaces_existing_output() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    store.insert("note_processed.md", "stale");
    let pipeline = pipeline_with(&store, replying("fresh"), CompletionFailurePolicy::Abort);

    assert!(pipeline
        .process_file(Path::new("note.md"), &rule())
        .await
        .is_done());
    assert_eq!(store.get(Path::new("note_processed.md")).as_deref(), Some("fresh"));
}

#[tokio::test]
async fn overwrite_in_place_rewrites_the_source() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort);
    let rule = MonitoringRule {
        output_file_name_template: "{{filename}}".to_string(),
        delete_source_file: true,
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("note.md"), &rule).await;

    assert_eq!(
        outcome,
        ProcessOutcome::Done {
            output: PathBuf::from("note.md"),
            source_deleted: false,
        }
    );
    assert_eq!(store.get(Path::new("note.md")).as_deref(), Some("HELLO"));
    let log = log_lines(&store);
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("| process | [[note.md]] -> [[note.md]]"));

    // The rewrite itself is not new work, but a later edit is.
    let rewritten = store.stat(Path::new("note.md")).await.unwrap().modified;
    assert!(!pipeline.needs_processing(Path::new("note.md"), "summarise", rewritten));
    assert!(!pipeline.is_own_output(Path::new("note.md"), "summarise").await);
    assert!(pipeline.needs_processing(
        Path::new("note.md"),
        "summarise",
        rewritten + Duration::from_secs(1)
    ));
}

#[tokio::test]
async fn append_in_place_extends_the_source() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort);
    let rule = MonitoringRule {
        output_file_name_template: "{{filename}}".to_string(),
        output_file_handling: OutputFileHandling::Append,
        ..rule()
    };

    assert!(pipeline
        .process_file(Path::new("note.md"), &rule)
        .await
        .is_done());
    assert_eq!(store.get(Path::new("note.md")).as_deref(), Some("hello\nHELLO"));
}

#[tokio::test(start_paused = true)]
async fn structural_template_is_prepended_when_present() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    store.insert("templates/summary.md", "# Summary");
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort);
    let with_template = MonitoringRule {
        template_file: Some(PathBuf::from("templates/summary.md")),
        ..rule()
    };

    pipeline
        .process_file(Path::new("note.md"), &with_template)
        .await;
    assert_eq!(
        store.get(Path::new("note_processed.md")).as_deref(),
        Some("# Summary\nHELLO")
    );

    let missing_template = MonitoringRule {
        template_file: Some(PathBuf::from("templates/nope.md")),
        output_file_name_template: "{{filename}}_plain".to_string(),
        ..rule()
    };
    pipeline
        .process_file(Path::new("note.md"), &missing_template)
        .await;
    assert_eq!(store.get(Path::new("note_plain.md")).as_deref(), Some("HELLO"));
}

#[tokio::test]
async fn custom_renderer_is_used_for_templates() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    store.insert("tpl.md", "TEMPLATE");
    let mut renderer = MockTemplateRenderer::new();
    renderer
        .expect_combine()
        .withf(|template: &str, generated: &str| template == "TEMPLATE" && generated == "HELLO")
        .times(1)
        .returning(|_, generated| format!("<<{generated}>>"));
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort)
        .with_renderer(Arc::new(renderer));
    let rule = MonitoringRule {
        template_file: Some(PathBuf::from("tpl.md")),
        ..rule()
    };

    pipeline.process_file(Path::new("note.md"), &rule).await;
    assert_eq!(
        store.get(Path::new("note_processed.md")).as_deref(),
        Some("<<HELLO>>")
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_for_one_file_are_serialised() {
    let store = Arc::new(MemoryFileStore::new().with_read_delay(Duration::from_secs(5)));
    store.insert("note.md", "hello");
    let mut service = MockCompletionService::new();
    service
        .expect_complete()
        .times(1)
        .returning(|_| Ok("HELLO".to_string()));
    let pipeline = pipeline_with(&store, Arc::new(service), CompletionFailurePolicy::Abort);
    let rule = rule();

    let (first, second) = tokio::join!(
        pipeline.process_file(Path::new("note.md"), &rule),
        pipeline.process_file(Path::new("note.md"), &rule),
    );

    assert!(first.is_done());
    assert_eq!(second, ProcessOutcome::AlreadyProcessing);
    assert!(!pipeline.is_in_flight(Path::new("note.md")));
}

#[tokio::test(start_paused = true)]
async fn abort_policy_leaves_no_trace_and_releases_the_file() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(
        &store,
        failing(CompletionError::Transport("boom".to_string())),
        CompletionFailurePolicy::Abort,
    );
    let rule = MonitoringRule {
        delete_source_file: true,
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("note.md"), &rule).await;

    assert_eq!(
        outcome,
        ProcessOutcome::CompletionFailed(CompletionError::Transport("boom".to_string()))
    );
    assert_eq!(store.paths(), vec![PathBuf::from("note.md")]);
    assert!(!pipeline.is_in_flight(Path::new("note.md")));
}

#[tokio::test(start_paused = true)]
async fn embed_policy_writes_the_error_as_output() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(
        &store,
        failing(CompletionError::Transport("boom".to_string())),
        CompletionFailurePolicy::EmbedError,
    );

    let outcome = pipeline.process_file(Path::new("note.md"), &rule()).await;

    assert!(outcome.is_done());
    assert_eq!(
        store.get(Path::new("note_processed.md")).as_deref(),
        Some("Error processing file: transport error: boom")
    );
    assert_eq!(log_lines(&store).len(), 1);
}

#[tokio::test]
async fn write_failure_skips_log_and_deletion() {
    let mut store = MockFileStore::new();
    store
        .expect_exists()
        .returning(|path: &Path| path == Path::new("note.md"));
    store.expect_stat().returning(|_| {
        Ok(FileMeta {
            modified: SystemTime::UNIX_EPOCH,
        })
    });
    store
        .expect_read()
        .returning(|_| Ok("hello".to_string()));
    store
        .expect_write()
        .times(1)
        .returning(|_, _| Err(StoreError::Other("disk full".to_string())));
    store.expect_delete().never();

    let pipeline = Pipeline::new(
        &ScribeConfig::default(),
        Arc::new(store),
        replying("HELLO"),
        clock(),
    );
    let rule = MonitoringRule {
        delete_source_file: true,
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("note.md"), &rule).await;
    assert_eq!(outcome, ProcessOutcome::WriteFailed("disk full".to_string()));
    assert!(!pipeline.is_in_flight(Path::new("note.md")));
    assert!(
        !pipeline
            .is_own_output(Path::new("note_processed.md"), "summarise")
            .await,
        "a failed write must not be remembered as an output"
    );
}

/// A store whose source disappears or refuses deletion after the output is
/// written. Every write is recorded.
fn flaky_delete_store(
    present_at_delete: bool,
    delete_result: Result<(), StoreError>,
) -> (MockFileStore, Arc<Mutex<Vec<(PathBuf, String)>>>) {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&writes);
    let source_checks = Arc::new(AtomicUsize::new(0));

    let mut store = MockFileStore::new();
    store.expect_exists().returning(move |path: &Path| {
        if path != Path::new("note.md") {
            return false;
        }
        source_checks.fetch_add(1, Ordering::SeqCst) == 0 || present_at_delete
    });
    store.expect_stat().returning(|_| {
        Ok(FileMeta {
            modified: SystemTime::UNIX_EPOCH,
        })
    });
    store
        .expect_read()
        .returning(|_| Ok("hello".to_string()));
    store.expect_write().returning(move |path: &Path, content: &str| {
        recorded
            .lock()
            .unwrap()
            .push((path.to_path_buf(), content.to_string()));
        Ok(())
    });
    match delete_result {
        Ok(()) if !present_at_delete => {
            store.expect_delete().never();
        }
        result => {
            let message = result.err().map(|e| e.to_string());
            store.expect_delete().times(1).returning(move |_| match &message {
                Some(message) => Err(StoreError::Other(message.clone())),
                None => Ok(()),
            });
        }
    }
    (store, writes)
}

fn log_writes(writes: &Mutex<Vec<(PathBuf, String)>>) -> Vec<String> {
    writes
        .lock()
        .unwrap()
        .iter()
        .filter(|(path, _)| path == Path::new(DEFAULT_LOG_FILE))
        .map(|(_, content)| content.clone())
        .collect()
}

#[tokio::test]
async fn source_already_gone_at_delete_time_is_not_deleted() {
    let (store, writes) = flaky_delete_store(false, Ok(()));
    let pipeline = Pipeline::new(
        &ScribeConfig::default(),
        Arc::new(store),
        replying("HELLO"),
        clock(),
    );
    let rule = MonitoringRule {
        delete_source_file: true,
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("note.md"), &rule).await;

    assert_eq!(
        outcome,
        ProcessOutcome::Done {
            output: PathBuf::from("note_processed.md"),
            source_deleted: false,
        }
    );
    let log = log_writes(&writes);
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("| process |"));
    assert!(!log[0].contains("| delete |"));
}

#[tokio::test]
async fn failed_source_deletion_still_finishes_the_run() {
    let (store, writes) =
        flaky_delete_store(true, Err(StoreError::Other("permission denied".to_string())));
    let pipeline = Pipeline::new(
        &ScribeConfig::default(),
        Arc::new(store),
        replying("HELLO"),
        clock(),
    );
    let rule = MonitoringRule {
        delete_source_file: true,
        ..rule()
    };

    let outcome = pipeline.process_file(Path::new("note.md"), &rule).await;

    assert_eq!(
        outcome,
        ProcessOutcome::Done {
            output: PathBuf::from("note_processed.md"),
            source_deleted: false,
        }
    );
    let log = log_writes(&writes);
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("| process | [[note.md]] -> [[note_processed.md]]"));
    assert!(!log[0].contains("| delete |"));
    assert!(!pipeline.is_in_flight(Path::new("note.md")));
}

#[tokio::test]
async fn written_outputs_are_recognised_as_own_until_changed() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort);

    pipeline.process_file(Path::new("note.md"), &rule()).await;

    assert!(pipeline.is_own_output(Path::new("note_processed.md"), "summarise").await);
    assert!(pipeline.is_own_output(Path::new(DEFAULT_LOG_FILE), "summarise").await);
    assert!(!pipeline.is_own_output(Path::new("note.md"), "summarise").await);
    assert!(
        !pipeline.is_own_output(Path::new("note_processed.md"), "other").await,
        "another rule may consume the output"
    );
    assert_eq!(
        pipeline
            .process_file(Path::new("note_processed.md"), &rule())
            .await,
        ProcessOutcome::OwnOutput
    );

    // Once the user edits the output it is an ordinary file again.
    store.set_modified(
        Path::new("note_processed.md"),
        SystemTime::now() + Duration::from_secs(60),
    );
    assert!(!pipeline.is_own_output(Path::new("note_processed.md"), "summarise").await);
}

#[tokio::test(start_paused = true)]
async fn needs_processing_tracks_source_modification_time_per_rule() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(&store, replying("HELLO"), CompletionFailurePolicy::Abort);
    let seen = store.stat(Path::new("note.md")).await.unwrap().modified;

    assert!(pipeline.needs_processing(Path::new("note.md"), "summarise", seen));
    pipeline.process_file(Path::new("note.md"), &rule()).await;
    assert!(!pipeline.needs_processing(Path::new("note.md"), "summarise", seen));
    assert!(pipeline.needs_processing(Path::new("note.md"), "other", seen));
    assert!(pipeline.needs_processing(
        Path::new("note.md"),
        "summarise",
        seen + Duration::from_secs(1)
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_completion_leaves_the_file_due() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "hello");
    let pipeline = pipeline_with(
        &store,
        failing(CompletionError::Transport("boom".to_string())),
        CompletionFailurePolicy::Abort,
    );
    let seen = store.stat(Path::new("note.md")).await.unwrap().modified;

    let outcome = pipeline.process_file(Path::new("note.md"), &rule()).await;

    assert!(matches!(outcome, ProcessOutcome::CompletionFailed(_)));
    assert!(pipeline.needs_processing(Path::new("note.md"), "summarise", seen));
}

#[tokio::test]
async fn content_filter_miss_is_not_retried_until_the_file_changes() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("note.md", "no numbers in here");
    let pipeline = pipeline_with(&store, replying("x"), CompletionFailurePolicy::Abort);
    let rule = MonitoringRule {
        content_regex: r"\d+".to_string(),
        ..rule()
    };
    let seen = store.stat(Path::new("note.md")).await.unwrap().modified;

    assert_eq!(
        pipeline.process_file(Path::new("note.md"), &rule).await,
        ProcessOutcome::ContentMismatch
    );
    assert!(!pipeline.needs_processing(Path::new("note.md"), "summarise", seen));
}
