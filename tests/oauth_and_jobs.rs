//! OAuth single-consume and job/event cursor scenarios against a
//! file-backed state store.

use serde_json::json;

use finagent_backend::storage::{RuntimePaths, StateStore};

fn file_store(dir: &tempfile::TempDir) -> StateStore {
    let paths = RuntimePaths::new(dir.path().join("agent"));
    StateStore::open(&paths).unwrap()
}

#[test]
fn oauth_state_consumed_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);

    store.create_oauth_state("kite", "s1").unwrap();
    store.consume_oauth_state("kite", "s1", 900).unwrap();
    let err = store.consume_oauth_state("kite", "s1", 900).unwrap_err();
    assert!(err.to_string().contains("already consumed"));
}

#[test]
fn consume_latest_requires_single_pending_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);

    store.create_oauth_state("kite", "s1").unwrap();
    store.create_oauth_state("kite", "s2").unwrap();
    let err = store.consume_latest_oauth_state("kite", 900).unwrap_err();
    assert!(err.to_string().contains("multiple pending oauth states"));

    // Consuming one specific state leaves exactly one pending.
    store.consume_oauth_state("kite", "s2", 900).unwrap();
    let state = store.consume_latest_oauth_state("kite", 900).unwrap();
    assert_eq!(state, "s1");

    // Pool drained: nothing left to consume.
    let err = store.consume_latest_oauth_state("kite", 900).unwrap_err();
    assert!(err.to_string().contains("no pending oauth state"));
}

#[test]
fn oauth_states_are_scoped_per_connector() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);

    store.create_oauth_state("kite", "shared").unwrap();
    let err = store.consume_oauth_state("zerodha", "shared", 900).unwrap_err();
    assert!(err.to_string().contains("not found"));
    store.consume_oauth_state("kite", "shared", 900).unwrap();
}

#[test]
fn job_lifecycle_and_event_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);

    let job_id = store.create_job("tuning", &json!({"strategy": "momo"})).unwrap();
    let job = store.get_job(&job_id).unwrap();
    assert_eq!(job["status"], "queued");

    store
        .update_job_status(&job_id, "running", None, None, None)
        .unwrap();
    let mut last_id = 0;
    for layer in 0..3 {
        last_id = store
            .append_job_event(&job_id, "tuning.layer.completed", &json!({"layer": layer}))
            .unwrap();
    }
    store
        .update_job_status(&job_id, "completed", Some(&json!({"trials": 3})), None, None)
        .unwrap();

    // Cursor reads return only rows strictly after the cursor, ascending.
    let all = store.list_job_events_after(0).unwrap();
    assert_eq!(all.len(), 3);
    let ids: Vec<i64> = all.iter().map(|e| e["id"].as_i64().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(store.list_job_events_after(last_id).unwrap().len(), 0);
    assert_eq!(store.list_job_events_after(last_id - 1).unwrap().len(), 1);

    // Terminal state is sticky.
    store
        .update_job_status(&job_id, "completed", None, None, None)
        .unwrap();
    assert!(store
        .update_job_status(&job_id, "running", None, None, None)
        .is_err());
}

#[test]
fn connector_sessions_encrypt_at_rest_when_key_configured() {
    use base64::Engine;
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);

    let key = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([3u8; 32]);
    std::env::set_var("FIN_AGENT_ENCRYPTION_KEY", &key);

    store
        .upsert_connector_session("kite", &json!({"access_token": "tok_super_secret_value"}))
        .unwrap();
    let session = store.get_connector_session("kite").unwrap().unwrap();
    assert_eq!(session["access_token"], "tok_super_secret_value");

    // The raw row on disk must carry the versioned prefix, not plaintext.
    let paths = RuntimePaths::new(dir.path().join("agent"));
    let conn = rusqlite::Connection::open(paths.state_db_path()).unwrap();
    let raw: String = conn
        .query_row(
            "SELECT payload_json FROM connector_sessions WHERE connector = 'kite'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(raw.starts_with("enc:v1:"));
    assert!(!raw.contains("tok_super_secret_value"));

    std::env::remove_var("FIN_AGENT_ENCRYPTION_KEY");
}
