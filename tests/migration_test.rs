//! Tests for version detection and migration
//!
//! - classification looks at the first bytes only
//! - current and known legacy documents are never converted
//! - the unknown-version answer can be remembered ("don't ask again")

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rstest::rstest;
use tempfile::TempDir;

use mindmap_core::application::services::{
    load_transform, ConversionChoice, ConversionPrompt, VersionMigrator,
};
use mindmap_core::application::{ApplicationError, ApplicationResult};
use mindmap_core::config::{ConversionPolicy, Settings};
use mindmap_core::domain::{
    parse_map, DocumentTransform, DomainResult, RuleTransform, VersionClass, VersionDetector,
};
use mindmap_core::infrastructure::traits::{FileSystem, RealFileSystem};
use mindmap_core::preferences::{Preferences, CONVERT_TO_CURRENT_VERSION};
use mindmap_core::util::testing::init_test_setup;

const UNKNOWN_DOC: &str =
    r#"<map version="0.8.0"><topic text="Root" id="ID_1"><topic text="kid"/></topic></map>"#;

/// Gives a fixed answer and counts how often it was asked.
struct ScriptedPrompt {
    answer: Option<ConversionChoice>,
    asked: AtomicUsize,
}

impl ScriptedPrompt {
    fn new(answer: Option<ConversionChoice>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            asked: AtomicUsize::new(0),
        })
    }

    fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl ConversionPrompt for ScriptedPrompt {
    fn ask(&self, _file: &Path, class: &VersionClass) -> ApplicationResult<Option<ConversionChoice>> {
        assert!(class.needs_decision());
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

/// Replaces any document with a fixed one.
struct FixedTransform;

impl DocumentTransform for FixedTransform {
    fn name(&self) -> &str {
        "fixed"
    }

    fn transform(&self, _document: &[u8]) -> DomainResult<Vec<u8>> {
        Ok(br#"<map version="0.9.0"><node TEXT="replaced"/></map>"#.to_vec())
    }
}

fn settings_in(temp: &TempDir) -> Settings {
    Settings {
        preferences_file: Some(temp.path().join("preferences.toml")),
        ..Settings::default()
    }
}

fn migrator(
    settings: &Settings,
    preferences: Arc<Preferences>,
    prompt: Arc<dyn ConversionPrompt>,
) -> VersionMigrator {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let transform = load_transform(fs.as_ref(), settings).unwrap();
    VersionMigrator::new(fs, settings, transform, preferences, prompt)
}

fn write_doc(temp: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = temp.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn root_text(document: &[u8]) -> String {
    let parsed = parse_map(document).unwrap();
    let root = parsed.tree.root().unwrap();
    parsed.tree.data(root).unwrap().text.clone()
}

// ============================================================
// classification
// ============================================================

#[rstest]
#[case::current(r#"<map version="0.9.0"><node/></map>"#, VersionClass::Current)]
#[case::legacy(r#"<map version="0.7.1"><node/></map>"#, VersionClass::KnownLegacy("0.7.1".into()))]
#[case::bom_current("\u{feff}<map version=\"0.9.0\">", VersionClass::Current)]
#[case::unknown_declared(
    r#"<map version="0.8.0"><node/></map>"#,
    VersionClass::Unknown { declared: Some("0.8.0".into()) }
)]
#[case::xml_declaration(
    r#"<?xml version="1.0"?><map version="0.9.0"/>"#,
    VersionClass::Unknown { declared: None }
)]
#[case::not_a_map("hello world", VersionClass::Unknown { declared: None })]
#[case::empty("", VersionClass::Unknown { declared: None })]
fn given_document_start_when_classifying_then_expected_class(
    #[case] document: &str,
    #[case] expected: VersionClass,
) {
    let detector = VersionDetector::default();
    let prefix_len = detector.prefix_len().min(document.len());

    assert_eq!(detector.classify(&document.as_bytes()[..prefix_len]), expected);
}

#[test]
fn given_extra_legacy_versions_when_classifying_then_configured_order_is_used() {
    let detector = VersionDetector::new(["0.8.1", "0.7.1", "0.8.1"]);

    assert_eq!(
        detector.known_versions().collect::<Vec<_>>(),
        ["0.9.0", "0.8.1", "0.7.1"]
    );
    assert_eq!(
        detector.classify(br#"<map version="0.8.1">"#),
        VersionClass::KnownLegacy("0.8.1".into())
    );
}

#[test]
fn given_file_when_classifying_then_only_prefix_is_needed() {
    let temp = TempDir::new().unwrap();
    let path = write_doc(&temp, "a.mm", UNKNOWN_DOC);
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::in_memory(Arc::new(RealFileSystem), &settings));
    let migrator = migrator(&settings, prefs, ScriptedPrompt::new(None));

    assert_eq!(
        migrator.classify_file(&path).unwrap(),
        VersionClass::Unknown {
            declared: Some("0.8.0".into())
        }
    );
}

// ============================================================
// migrate()
// ============================================================

#[test]
fn given_current_document_when_migrating_twice_then_no_op() {
    let temp = TempDir::new().unwrap();
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::in_memory(Arc::new(RealFileSystem), &settings));
    let migrator = migrator(&settings, prefs, ScriptedPrompt::new(None));
    let doc = br#"<map version="0.9.0"><node TEXT="x"/></map>"#;

    let once = migrator.migrate(doc).unwrap();
    let twice = migrator.migrate(&once).unwrap();

    assert_eq!(once.as_ref(), doc.as_slice());
    assert_eq!(twice.as_ref(), doc.as_slice());
}

#[test]
fn given_unknown_document_when_migrating_then_result_is_current_and_stable() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::in_memory(Arc::new(RealFileSystem), &settings));
    let migrator = migrator(&settings, prefs, ScriptedPrompt::new(None));

    let converted = migrator.migrate(UNKNOWN_DOC.as_bytes()).unwrap().into_owned();
    let again = migrator.migrate(&converted).unwrap();

    assert!(converted.starts_with(br#"<map version="0.9.0""#));
    assert_eq!(again.as_ref(), converted.as_slice());
    assert_eq!(root_text(&converted), "Root");
    let parsed = parse_map(converted.as_slice()).unwrap();
    assert!(parsed.tree.find_by_id("ID_1").is_some());
}

#[test]
fn given_swapped_transform_when_migrating_then_it_is_used() {
    let temp = TempDir::new().unwrap();
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::in_memory(Arc::new(RealFileSystem), &settings));
    let migrator =
        migrator(&settings, prefs, ScriptedPrompt::new(None)).with_transform(Arc::new(FixedTransform));

    let converted = migrator.migrate(UNKNOWN_DOC.as_bytes()).unwrap();

    assert_eq!(migrator.transform().name(), "fixed");
    assert_eq!(root_text(&converted), "replaced");
}

#[test]
fn given_rule_file_in_settings_when_loading_transform_then_rules_come_from_file() {
    let temp = TempDir::new().unwrap();
    let rules = write_doc(
        &temp,
        "rules.toml",
        "set_version = true\n[[rename_element]]\nfrom = \"item\"\nto = \"node\"\n",
    );
    let settings = Settings {
        migration_rules: Some(rules),
        ..settings_in(&temp)
    };

    let transform = load_transform(&RealFileSystem, &settings).unwrap();
    let out = transform
        .transform(br#"<map version="0.1"><item TEXT="a"/></map>"#)
        .unwrap();

    assert_eq!(root_text(&out), "a");
}

#[test]
fn given_invalid_rule_file_when_loading_transform_then_error() {
    let temp = TempDir::new().unwrap();
    let rules = write_doc(&temp, "rules.toml", "no_such_rule = 1\n");
    let settings = Settings {
        migration_rules: Some(rules),
        ..settings_in(&temp)
    };

    assert!(load_transform(&RealFileSystem, &settings).is_err());
}

#[test]
fn given_builtin_rules_then_transform_is_named() {
    let transform = RuleTransform::builtin().unwrap();
    assert!(!transform.name().is_empty());
}

// ============================================================
// open() and the conversion decision
// ============================================================

#[test]
fn given_ask_policy_and_remembered_answer_when_opening_twice_then_asked_once() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let first = write_doc(&temp, "first.mm", UNKNOWN_DOC);
    let second = write_doc(&temp, "second.mm", UNKNOWN_DOC);
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::load(Arc::new(RealFileSystem), &settings).unwrap());
    let prompt = ScriptedPrompt::new(Some(ConversionChoice {
        convert: true,
        remember: true,
    }));
    let migrator = migrator(&settings, prefs.clone(), prompt.clone());

    let doc = migrator.open(&first).unwrap();
    assert!(doc.converted);
    let doc = migrator.open(&second).unwrap();
    assert!(doc.converted);

    assert_eq!(prompt.asked(), 1);
    assert_eq!(migrator.policy(), ConversionPolicy::Convert);
    let stored = std::fs::read_to_string(temp.path().join("preferences.toml")).unwrap();
    assert!(stored.contains(CONVERT_TO_CURRENT_VERSION));

    // a new session picks up the remembered answer
    let reloaded = Preferences::load(Arc::new(RealFileSystem), &settings).unwrap();
    assert_eq!(reloaded.get(CONVERT_TO_CURRENT_VERSION).as_deref(), Some("convert"));
}

#[test]
fn given_unwritable_preferences_when_remembering_answer_then_open_still_converts() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let path = write_doc(&temp, "a.mm", UNKNOWN_DOC);
    let blocker = temp.path().join("blocker");
    std::fs::write(&blocker, "regular file").unwrap();
    let settings = Settings {
        preferences_file: Some(blocker.join("preferences.toml")),
        ..Settings::default()
    };
    let prefs = Arc::new(Preferences::load(Arc::new(RealFileSystem), &settings).unwrap());
    let prompt = ScriptedPrompt::new(Some(ConversionChoice {
        convert: true,
        remember: true,
    }));
    let migrator = migrator(&settings, prefs.clone(), prompt.clone());

    let doc = migrator.open(&path).unwrap();
    assert!(doc.converted);
    let parsed = parse_map(doc.into_reader()).unwrap();
    let root = parsed.tree.root().unwrap();
    assert_eq!(parsed.tree.data(root).unwrap().text, "Root");

    // the answer could not be stored, so it is neither in memory nor on disk
    assert_eq!(prefs.get(CONVERT_TO_CURRENT_VERSION).as_deref(), Some("ask"));
    assert_eq!(migrator.policy(), ConversionPolicy::Ask);
    migrator.open(&path).unwrap();
    assert_eq!(prompt.asked(), 2);
}

#[test]
fn given_one_time_answer_when_opening_twice_then_asked_each_time() {
    let temp = TempDir::new().unwrap();
    let path = write_doc(&temp, "a.mm", UNKNOWN_DOC);
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::in_memory(Arc::new(RealFileSystem), &settings));
    let prompt = ScriptedPrompt::new(Some(ConversionChoice {
        convert: false,
        remember: false,
    }));
    let migrator = migrator(&settings, prefs, prompt.clone());

    let doc = migrator.open(&path).unwrap();
    assert!(!doc.converted);
    migrator.open(&path).unwrap();

    assert_eq!(prompt.asked(), 2);
    assert_eq!(migrator.policy(), ConversionPolicy::Ask);
}

#[test]
fn given_cancelled_prompt_when_opening_then_cancelled() {
    let temp = TempDir::new().unwrap();
    let path = write_doc(&temp, "a.mm", UNKNOWN_DOC);
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::in_memory(Arc::new(RealFileSystem), &settings));
    let migrator = migrator(&settings, prefs, ScriptedPrompt::new(None));

    let err = migrator.open(&path).unwrap_err();

    assert!(matches!(err, ApplicationError::Cancelled(_)));
}

#[test]
fn given_current_document_when_opening_then_prompt_not_consulted() {
    let temp = TempDir::new().unwrap();
    let path = write_doc(&temp, "a.mm", r#"<map version="0.9.0"><node TEXT="x"/></map>"#);
    let settings = settings_in(&temp);
    let prefs = Arc::new(Preferences::in_memory(Arc::new(RealFileSystem), &settings));
    let prompt = ScriptedPrompt::new(None);
    let migrator = migrator(&settings, prefs, prompt.clone());

    let doc = migrator.open(&path).unwrap();

    assert_eq!(doc.class, VersionClass::Current);
    assert!(!doc.converted);
    assert_eq!(prompt.asked(), 0);
    let parsed = parse_map(doc.into_reader()).unwrap();
    assert_eq!(parsed.tree.node_count(), 1);
}
