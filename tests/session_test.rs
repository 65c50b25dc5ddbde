//! Session persistence: save/restore round trips, fatal restore failures,
//! and TTL cleanup.

use std::time::Duration;
use wave_core::ledger::Ledger;
use wave_core::session::{Restore, SessionError, SessionStore, SESSION_TTL};
use wave_core::types::MessageSource;

#[test]
fn save_then_restore_by_id_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::at(tmp.path().join("sessions"));

    let mut ledger = Ledger::new("/workdir");
    ledger.add_user_message("first input", None, MessageSource::User);
    ledger.add_assistant_message();
    ledger.update_assistant_content("a reply");
    ledger.set_latest_total_tokens(1234);
    let session_id = ledger.session_id().to_string();
    store.save(&ledger).unwrap();

    let mut restored = Ledger::new("/workdir");
    store
        .restore(&mut restored, Restore::ById(session_id.clone()))
        .unwrap();
    assert_eq!(restored.session_id(), session_id);
    assert_eq!(restored.messages().len(), 2);
    assert_eq!(restored.messages()[1].text(), "a reply");
    assert_eq!(restored.latest_total_tokens(), 1234);
    assert_eq!(restored.input_history(), ["first input"]);
}

#[test]
fn restore_recomputes_history_with_adjacent_dedup() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::at(tmp.path().join("sessions"));

    let mut ledger = Ledger::new("/workdir");
    ledger.add_user_message("build", None, MessageSource::User);
    ledger.add_user_message("build", None, MessageSource::User);
    ledger.add_user_message("test", None, MessageSource::User);
    // Hook-injected messages must not pollute the recomputed history.
    ledger.add_user_message("from hook", None, MessageSource::Hook);
    let id = ledger.session_id().to_string();
    store.save(&ledger).unwrap();

    let mut restored = Ledger::new("/workdir");
    store.restore(&mut restored, Restore::ById(id)).unwrap();
    assert_eq!(restored.input_history(), ["build", "test"]);
}

#[test]
fn restore_by_unknown_id_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::at(tmp.path().join("sessions"));
    let mut ledger = Ledger::new("/workdir");
    let err = store
        .restore(&mut ledger, Restore::ById("no-such-session".into()))
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[test]
fn continue_latest_picks_the_matching_workdir() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::at(tmp.path().join("sessions"));

    let mut other = Ledger::new("/elsewhere");
    other.add_user_message("other project", None, MessageSource::User);
    store.save(&other).unwrap();

    let mut ours = Ledger::new("/workdir");
    ours.add_user_message("our project", None, MessageSource::User);
    let ours_id = ours.session_id().to_string();
    store.save(&ours).unwrap();

    let mut restored = Ledger::new("/workdir");
    store.restore(&mut restored, Restore::Latest).unwrap();
    assert_eq!(restored.session_id(), ours_id);
}

#[test]
fn continue_latest_with_no_sessions_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::at(tmp.path().join("sessions"));
    let mut ledger = Ledger::new("/workdir");
    let err = store.restore(&mut ledger, Restore::Latest).unwrap_err();
    assert!(matches!(err, SessionError::NothingToContinue(_)));
}

#[test]
fn malformed_session_file_is_a_structured_error() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("sessions");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("broken.json"), "{ not json").unwrap();

    let store = SessionStore::at(&dir);
    let mut ledger = Ledger::new("/workdir");
    let err = store
        .restore(&mut ledger, Restore::ById("broken".into()))
        .unwrap_err();
    assert!(matches!(err, SessionError::Malformed { .. }));
}

#[test]
fn cleanup_removes_only_expired_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::at(tmp.path().join("sessions"));

    let mut ledger = Ledger::new("/workdir");
    ledger.add_user_message("keep me", None, MessageSource::User);
    store.save(&ledger).unwrap();

    // A fresh file survives the real TTL but not a zero TTL.
    assert_eq!(store.cleanup_expired(SESSION_TTL), 0);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(store.cleanup_expired(Duration::ZERO), 1);
    assert_eq!(store.cleanup_expired(Duration::ZERO), 0);
}

#[test]
fn save_failure_is_reported_not_fatal() {
    // A file where the directory should be makes creation fail.
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("sessions");
    std::fs::write(&blocker, "a file, not a dir").unwrap();

    let store = SessionStore::at(&blocker);
    let ledger = Ledger::new("/workdir");
    assert!(matches!(store.save(&ledger), Err(SessionError::Io { .. })));
}
