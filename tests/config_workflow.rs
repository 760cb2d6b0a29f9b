//! A run driven by a `qcode-sync.toml` on disk

use qcode_sync::core::generator::assign_identifiers;
use qcode_sync::{
    AssignMode, IdentifierGenerator, PrimaryRecord, QcodeError, QcodeSync, QuestionStore,
    SchemeVersion, UsedSet,
};
use serde_json::{json, Map, Value};
use std::path::Path;
use tempfile::TempDir;

const CONFIG: &str = r#"
config_version = "1.0.0"

[scheme]
current = "v1"
target = "v2"

[stores.primary]
name = "master"
kind = "list"
path = "data/questions_master.json"

[[stores.secondary]]
name = "questions"
kind = "dict"
path = "data/questions.json"

[backup]
dir = "backups"
keep = 2
"#;

fn write_json(path: &Path, value: &Value) {
    std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
}

/// Config plus two v1 stores under `data/`; returns the config path
fn workspace(dir: &TempDir) -> std::path::PathBuf {
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();

    let mut records: Vec<PrimaryRecord> = (0..12)
        .map(|i| PrimaryRecord {
            etitle: "보험심사역".to_string(),
            eclass: if i % 2 == 0 { "생명보험" } else { "손해보험" }.to_string(),
            layer1: "관계법령".to_string(),
            qtype: "A".to_string(),
            eround: Some(Value::from(10 + i % 3)),
            question: format!("문제 {}", i),
            answer: Some(Value::from(1 + i % 4)),
            ..Default::default()
        })
        .collect();
    let generator = IdentifierGenerator::new(SchemeVersion::V1);
    assign_identifiers(&generator, &mut records, AssignMode::MissingOnly, &mut UsedSet::new()).unwrap();

    write_json(&data.join("questions_master.json"), &json!({ "questions": records }));
    let keyed: Map<String, Value> = records
        .iter()
        .map(|r| (r.qcode.clone(), serde_json::to_value(r).unwrap()))
        .collect();
    write_json(&data.join("questions.json"), &json!({ "questions": keyed }));

    let config = dir.path().join("qcode-sync.toml");
    std::fs::write(&config, CONFIG).unwrap();
    config
}

#[test]
fn test_migrate_from_config_file() {
    let dir = TempDir::new().unwrap();
    let config = workspace(&dir);

    let mut sync = QcodeSync::open_file(&config).unwrap();
    assert_eq!(sync.active_scheme(), SchemeVersion::V1);
    assert!(sync.check().unwrap().is_healthy());

    let plan = sync.plan();
    assert!(plan.is_success(), "{}", plan);
    assert!(plan.dry_run);
    assert_eq!(plan.remapped, 12);
    assert!(sync.backups().unwrap().values().all(Vec::is_empty));

    let report = sync.migrate();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.remapped, 12);

    let check = sync.check_against(SchemeVersion::V2).unwrap();
    assert!(check.is_healthy(), "{}", check);
    assert!(sync
        .stores()
        .primary()
        .identifiers()
        .iter()
        .all(|id| SchemeVersion::V2.primary().matches(id)));

    let backups = sync.backups().unwrap();
    assert_eq!(backups["master"].len(), 1);
    assert_eq!(backups["questions"].len(), 1);
    assert!(backups["master"][0].starts_with(dir.path().join("backups")));
}

#[test]
fn test_prune_keeps_newest_backups() {
    let dir = TempDir::new().unwrap();
    let config = workspace(&dir);
    let sync = QcodeSync::open_file(&config).unwrap();

    let manager = sync.config().backup_manager().unwrap();
    let master = dir.path().join("data/questions_master.json");
    for _ in 0..4 {
        manager.backup_file("master", &master).unwrap();
    }
    let before = sync.backups().unwrap()["master"].clone();
    assert_eq!(before.len(), 4);

    // backup.keep = 2
    let removed = sync.prune_backups(None).unwrap();
    assert_eq!(removed, before[..2].to_vec());
    assert_eq!(sync.backups().unwrap()["master"], before[2..].to_vec());

    let removed = sync.prune_backups(Some(1)).unwrap();
    assert_eq!(removed, vec![before[2].clone()]);
}

#[test]
fn test_second_run_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let config = workspace(&dir);
    let lock_file = dir.path().join("data/.qcode-sync.lock");

    let sync = QcodeSync::open_file(&config).unwrap();
    assert_eq!(sync.lock().path(), lock_file.as_path());
    assert!(lock_file.exists());

    match QcodeSync::open_file(&config) {
        Err(QcodeError::StoreLocked(path)) => assert_eq!(path, lock_file),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("second run acquired the lock"),
    }

    drop(sync);
    assert!(!lock_file.exists());
    assert!(QcodeSync::open_file(&config).is_ok());
}

#[test]
fn test_bad_config_is_rejected_before_locking() {
    let dir = TempDir::new().unwrap();
    let config = workspace(&dir);
    let text = std::fs::read_to_string(&config)
        .unwrap()
        .replace("config_version = \"1.0.0\"", "config_version = \"2.0.0\"");
    std::fs::write(&config, text).unwrap();

    assert!(matches!(
        QcodeSync::open_file(&config),
        Err(QcodeError::UnsupportedConfigVersion(_))
    ));
    assert!(!dir.path().join("data/.qcode-sync.lock").exists());
}
