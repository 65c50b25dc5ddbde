//! Reversion across the ledger: snapshot, commit, attach, revert.

use wave_core::ledger::Ledger;
use wave_core::revert::ReversionLog;
use wave_core::types::*;

#[test]
fn full_turn_revert_restores_modify_and_deletes_create() {
    let tmp = tempfile::tempdir().unwrap();
    let x = tmp.path().join("x.txt");
    let y = tmp.path().join("y.txt");
    std::fs::write(&x, "A").unwrap();

    let mut ledger = Ledger::new(tmp.path());
    ledger.add_user_message("edit both files", None, MessageSource::User);
    ledger.add_assistant_message();
    let message_id = ledger
        .messages()
        .last()
        .unwrap()
        .id
        .clone()
        .expect("assistant messages carry ids");

    // The turn's tool calls: snapshot, mutate, commit.
    let mut log = ReversionLog::at(tmp.path().join("snaps"));
    let sx = log.record(&message_id, &x, SnapshotOperation::Modify);
    std::fs::write(&x, "B").unwrap();
    log.commit(&sx).unwrap();

    let sy = log.record(&message_id, &y, SnapshotOperation::Create);
    std::fs::write(&y, "brand new").unwrap();
    log.commit(&sy).unwrap();

    // Turn end: committed snapshots attach to the owning message.
    let committed = log.drain_committed();
    assert_eq!(committed.len(), 2);
    ledger.attach_file_history(Some(&message_id), committed);

    let reverted = log.revert_to(&[message_id.clone()], ledger.messages());
    assert_eq!(reverted, 2);
    assert_eq!(std::fs::read_to_string(&x).unwrap(), "A");
    assert!(!y.exists());
}

#[test]
fn revert_ignores_messages_outside_the_target_set() {
    let tmp = tempfile::tempdir().unwrap();
    let tracked = tmp.path().join("tracked.txt");
    let untracked = tmp.path().join("untracked.txt");
    std::fs::write(&tracked, "old").unwrap();
    std::fs::write(&untracked, "old").unwrap();

    let mut log = ReversionLog::at(tmp.path().join("snaps"));

    let mut ledger = Ledger::new(tmp.path());
    ledger.add_assistant_message();
    let m1 = ledger.messages().last().unwrap().id.clone().unwrap();
    let s1 = log.record(&m1, &tracked, SnapshotOperation::Modify);
    log.commit(&s1).unwrap();
    ledger.attach_file_history(Some(&m1), log.drain_committed());

    ledger.add_assistant_message();
    let m2 = ledger.messages().last().unwrap().id.clone().unwrap();
    let s2 = log.record(&m2, &untracked, SnapshotOperation::Modify);
    log.commit(&s2).unwrap();
    ledger.attach_file_history(Some(&m2), log.drain_committed());

    std::fs::write(&tracked, "new").unwrap();
    std::fs::write(&untracked, "new").unwrap();

    assert_eq!(log.revert_to(&[m1], ledger.messages()), 1);
    assert_eq!(std::fs::read_to_string(&tracked).unwrap(), "old");
    assert_eq!(std::fs::read_to_string(&untracked).unwrap(), "new");
}

#[test]
fn discarded_snapshots_never_reach_the_transcript() {
    let tmp = tempfile::tempdir().unwrap();
    let f = tmp.path().join("f.txt");
    std::fs::write(&f, "keep").unwrap();

    let mut log = ReversionLog::at(tmp.path().join("snaps"));
    let id = log.record("m1", &f, SnapshotOperation::Modify);
    log.discard(&id);
    assert!(log.drain_committed().is_empty());
}
