//! Identifier assignment with secondary stores configured

use qcode_sync::core::backup::file_digest;
use qcode_sync::{AssignMode, QcodeError, QcodeSync, QcodeSyncBuilder, SchemeVersion, StoreKind};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn question(qcode: &str, text: &str) -> Value {
    json!({
        "QCODE": qcode,
        "ETITLE": "보험중개사",
        "ECLASS": "손해보험",
        "LAYER1": "관계법령",
        "LAYER2": "보험업법",
        "QTYPE": "A",
        "EROUND": "20",
        "QUESTION": text,
        "ANSWER": 1
    })
}

fn write_json(path: &Path, value: &Value) {
    std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

struct Stores {
    dir: TempDir,
    master: PathBuf,
    questions: PathBuf,
    slots: PathBuf,
}

impl Stores {
    /// Master list, keyed mirror of the identified records, and a slotted
    /// store holding the first identified record
    fn write(master: Vec<Value>) -> Stores {
        let dir = TempDir::new().unwrap();
        let stores = Stores {
            master: dir.path().join("questions_master.json"),
            questions: dir.path().join("questions.json"),
            slots: dir.path().join("derived_slots.json"),
            dir,
        };

        let keyed: Map<String, Value> = master
            .iter()
            .filter(|q| q["QCODE"] != json!(""))
            .map(|q| (q["QCODE"].as_str().unwrap().to_string(), q.clone()))
            .collect();

        let mut slotted = Map::new();
        if let Some(first) = master.iter().find(|q| q["QCODE"] != json!("")) {
            let id = first["QCODE"].as_str().unwrap();
            slotted.insert(
                id.to_string(),
                json!({
                    "source_qcode": id,
                    "slots": {
                        "B1": {
                            "question": "보험중개사는 등록하여야 한다",
                            "answer": "O",
                            "exists": true,
                            "original_qcode": format!("{}-B1", id)
                        }
                    },
                    "metadata": {
                        "master_question": first["QUESTION"],
                        "master_answer": 1,
                        "master_round": 20,
                        "master_layer": "보험업법"
                    }
                }),
            );
        }

        write_json(&stores.master, &json!({ "metadata": {}, "questions": master }));
        write_json(&stores.questions, &json!({ "metadata": {}, "questions": keyed }));
        write_json(&stores.slots, &json!({ "metadata": {}, "questions": slotted }));
        stores
    }

    fn open(&self) -> QcodeSync {
        QcodeSyncBuilder::new()
            .primary("master", StoreKind::List, self.master.to_string_lossy())
            .secondary("questions", StoreKind::Dict, self.questions.to_string_lossy())
            .subset_secondary("slots", StoreKind::Slotted, self.slots.to_string_lossy())
            .current(SchemeVersion::V1)
            .target(SchemeVersion::V2)
            .backup_dir(self.dir.path().join("backups").to_string_lossy())
            .build()
            .unwrap()
    }
}

#[test]
fn test_renumber_rewrites_every_store() {
    let stores = Stores::write(vec![question("ABAA-02", "첫째 문제"), question("ABAA-01", "둘째 문제")]);
    let mut sync = stores.open();

    let report = sync.assign(AssignMode::Renumber).unwrap();
    let moves: Vec<_> = report
        .assignments
        .iter()
        .map(|a| (a.old_qcode.as_str(), a.new_qcode.as_str()))
        .collect();
    assert_eq!(moves, [("ABAA-02", "ABAA-01"), ("ABAA-01", "ABAA-02")]);

    let check = sync.check_against(SchemeVersion::V1).unwrap();
    assert!(check.is_healthy(), "{}", check);

    let questions = read_json(&stores.questions);
    assert_eq!(questions["questions"]["ABAA-01"]["QUESTION"], json!("첫째 문제"));
    assert_eq!(questions["questions"]["ABAA-02"]["QUESTION"], json!("둘째 문제"));

    let slots = read_json(&stores.slots);
    let entry = &slots["questions"]["ABAA-01"];
    assert_eq!(entry["source_qcode"], json!("ABAA-01"));
    assert_eq!(entry["metadata"]["master_question"], json!("첫째 문제"));
    assert_eq!(entry["slots"]["B1"]["original_qcode"], json!("ABAA-01-B1"));
    assert!(slots["questions"].get("ABAA-02").is_none());

    let backups = sync.backups().unwrap();
    assert!(backups.values().all(|b| b.len() == 1), "{:?}", backups);
}

#[test]
fn test_renumber_refuses_duplicates_with_secondaries() {
    let stores = Stores::write(vec![question("ABAA-01", "첫째 문제"), question("ABAA-01", "둘째 문제")]);
    let before = [
        file_digest(&stores.master).unwrap(),
        file_digest(&stores.questions).unwrap(),
    ];
    let mut sync = stores.open();

    match sync.assign(AssignMode::Renumber) {
        Err(QcodeError::AmbiguousRenumber { stores: names, identifiers }) => {
            assert_eq!(names, ["questions", "slots"]);
            assert_eq!(identifiers, ["ABAA-01"]);
        }
        other => panic!("expected AmbiguousRenumber, got {:?}", other.map(|r| r.assignments)),
    }

    let after = [
        file_digest(&stores.master).unwrap(),
        file_digest(&stores.questions).unwrap(),
    ];
    assert_eq!(before, after);
    assert!(sync.backups().unwrap().values().all(Vec::is_empty));
}

#[test]
fn test_missing_only_keeps_existing_links() {
    let stores = Stores::write(vec![question("ABAA-01", "첫째 문제"), question("", "둘째 문제")]);
    let questions_before = file_digest(&stores.questions).unwrap();
    let slots_before = file_digest(&stores.slots).unwrap();
    let mut sync = stores.open();

    let report = sync.assign(AssignMode::MissingOnly).unwrap();
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].new_qcode, "ABAA-02");

    let master = read_json(&stores.master);
    assert_eq!(master["questions"][0]["QCODE"], json!("ABAA-01"));
    assert_eq!(master["questions"][1]["QCODE"], json!("ABAA-02"));

    assert_eq!(file_digest(&stores.questions).unwrap(), questions_before);
    assert_eq!(file_digest(&stores.slots).unwrap(), slots_before);
}
