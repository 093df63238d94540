//! Integration tests for the fine-grained (legacy export) import path.

use chat_data_import::db::Database;
use chat_data_import::db::import::{ConflictMode, ImportOptions};
use chat_data_import::error::{ErrorCode, error_code};
use chat_data_import::snapshot::{LegacySnapshot, Payload, PayloadFormat, SUPPORTED_VERSION};
use serde_json::{Value, json};

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

fn legacy(value: Value) -> LegacySnapshot {
    let mut value = value;
    value["version"] = json!(SUPPORTED_VERSION);
    serde_json::from_value(value).expect("valid legacy snapshot")
}

fn options() -> ImportOptions {
    ImportOptions::new("alice")
}

fn stored_id(db: &Database, entity: &str, local_id: &str) -> String {
    db.fetch_record(entity, "alice", local_id)
        .unwrap()
        .unwrap_or_else(|| panic!("{entity} {local_id} not stored"))
        .id
}

fn export_fixture() -> LegacySnapshot {
    legacy(json!({
        "sessionGroups": [{"id": "g1", "name": "Work", "sort": 0}],
        "sessions": [{
            "id": "s1",
            "group": "g1",
            "type": "agent",
            "pinned": true,
            "meta": {"title": "Writer", "avatar": "pen", "backgroundColor": "#fff"},
            "config": {"model": "gpt-4o", "provider": "openai", "systemRole": "You write."},
            "createdAt": 1700000000000_i64,
            "updatedAt": 1700000000000_i64
        }],
        "topics": [{"id": "t1", "title": "Draft", "favorite": 1, "sessionId": "s1"}],
        "messages": [
            {"id": "m1", "role": "user", "content": "hi\u{0000}", "sessionId": "s1", "topicId": "t1"},
            {
                "id": "m2",
                "role": "assistant",
                "content": "hello",
                "sessionId": "s1",
                "topicId": "t1",
                "parentId": "m1",
                "extra": {
                    "fromModel": "gpt-4o",
                    "fromProvider": "openai",
                    "translate": {"from": "en", "to": "fr", "content": "bonjour"}
                }
            },
            {
                "id": "m3",
                "role": "tool",
                "content": "{}",
                "sessionId": "s1",
                "topicId": "t1",
                "parentId": "m2",
                "plugin": {"identifier": "search", "apiName": "query", "arguments": "{\"q\":1}", "type": "default"},
                "pluginState": {"done": true},
                "tool_call_id": "call-1"
            }
        ]
    }))
}

mod mapping_tests {
    use super::*;

    #[test]
    fn session_group_reference_uses_minted_id() {
        let db = setup_db();
        let data = legacy(json!({
            "sessionGroups": [{"id": "g1"}],
            "sessions": [{"id": "s1", "group": "g1"}]
        }));

        let report = db.import_legacy(&data, &options()).unwrap();

        assert_eq!(report.outcome("sessionGroups").added, 1);
        assert_eq!(report.outcome("sessions").added, 1);
        let session = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();
        assert_eq!(
            session.text("group_id"),
            Some(stored_id(&db, "sessionGroups", "g1").as_str())
        );
    }

    #[test]
    fn full_export_lands_with_rewritten_references() {
        let db = setup_db();
        let report = db.import_legacy(&export_fixture(), &options()).unwrap();

        assert_eq!(report.outcome("messages").added, 3);
        assert!(report.unresolved.is_empty(), "{:?}", report.unresolved);

        let session = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();
        assert_eq!(session.text("title"), Some("Writer"));
        assert_eq!(session.text("background_color"), Some("#fff"));
        assert_eq!(session.integer("pinned"), Some(1));
        assert_eq!(session.integer("created_at"), Some(1700000000000));

        let topic = db.fetch_record("topics", "alice", "t1").unwrap().unwrap();
        assert_eq!(topic.integer("favorite"), Some(1));
        assert_eq!(topic.text("session_id"), Some(session.id.as_str()));

        let m1 = db.fetch_record("messages", "alice", "m1").unwrap().unwrap();
        assert_eq!(m1.text("content"), Some("hi"));
        let m2 = db.fetch_record("messages", "alice", "m2").unwrap().unwrap();
        assert_eq!(m2.text("parent_id"), Some(m1.id.as_str()));
        assert_eq!(m2.text("model"), Some("gpt-4o"));
        assert_eq!(m2.text("provider"), Some("openai"));
        assert_eq!(m2.text("topic_id"), Some(topic.id.as_str()));
        let m3 = db.fetch_record("messages", "alice", "m3").unwrap().unwrap();
        assert_eq!(m3.text("parent_id"), Some(m2.id.as_str()));
        assert_eq!(report.rewrite_statements, 1);
    }

    #[test]
    fn new_sessions_get_a_linked_agent() {
        let db = setup_db();
        db.import_legacy(&export_fixture(), &options()).unwrap();
        let session_id = stored_id(&db, "sessions", "s1");

        assert_eq!(db.count_rows("agents", "alice").unwrap(), 1);
        assert_eq!(db.count_rows("agentsToSessions", "alice").unwrap(), 1);
        db.with_conn(|conn| {
            let (model, role, title, linked): (String, String, String, String) = conn.query_row(
                "SELECT a.model, a.system_role, a.title, l.session_id
                 FROM agents a JOIN agents_to_sessions l ON l.agent_id = a.id",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?;
            assert_eq!(model, "gpt-4o");
            assert_eq!(role, "You write.");
            assert_eq!(title, "Writer");
            assert_eq!(linked, session_id);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn plugins_and_translations_follow_new_messages() {
        let db = setup_db();
        db.import_legacy(&export_fixture(), &options()).unwrap();

        let plugin = db.fetch_record("messagePlugins", "alice", "m3").unwrap().unwrap();
        assert_eq!(plugin.text("message_id"), Some(stored_id(&db, "messages", "m3").as_str()));
        assert_eq!(plugin.text("tool_call_id"), Some("call-1"));
        assert_eq!(plugin.text("api_name"), Some("query"));
        assert_eq!(plugin.text("state"), Some(r#"{"done":true}"#));

        let translate = db
            .fetch_record("messageTranslates", "alice", "m2")
            .unwrap()
            .unwrap();
        assert_eq!(translate.text("to"), Some("fr"));
        assert_eq!(translate.text("content"), Some("bonjour"));
    }

    #[test]
    fn missing_session_is_left_empty_and_reported() {
        let db = setup_db();
        let data = legacy(json!({
            "topics": [{"id": "t1", "sessionId": "nowhere"}]
        }));

        let report = db.import_legacy(&data, &options()).unwrap();

        assert_eq!(report.outcome("topics").added, 1);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].target, "sessions");
    }
}

mod reconciliation_tests {
    use super::*;

    #[test]
    fn second_import_skips_everything() {
        let db = setup_db();
        let data = export_fixture();
        db.import_legacy(&data, &options()).unwrap();
        let agents_before = db.count_rows("agents", "alice").unwrap();

        let report = db.import_legacy(&data, &options()).unwrap();

        let expected = [
            ("sessionGroups", data.session_groups.len()),
            ("sessions", data.sessions.len()),
            ("topics", data.topics.len()),
            ("messages", data.messages.len()),
        ];
        for (entity, count) in expected {
            let outcome = report.outcome(entity);
            assert_eq!(outcome.added, 0, "{entity}");
            assert_eq!(outcome.skipped, count, "{entity}");
        }
        assert_eq!(db.count_rows("agents", "alice").unwrap(), agents_before);
        assert_eq!(db.count_rows("messagePlugins", "alice").unwrap(), 1);
        assert_eq!(db.count_rows("messageTranslates", "alice").unwrap(), 1);
    }

    #[test]
    fn skip_existing_keeps_stored_fields() {
        let db = setup_db();
        db.import_legacy(
            &legacy(json!({"sessionGroups": [{"id": "g1", "name": "Before"}]})),
            &options(),
        )
        .unwrap();
        let before = db.fetch_record("sessionGroups", "alice", "g1").unwrap().unwrap();

        let report = db
            .import_legacy(
                &legacy(json!({"sessionGroups": [{"id": "g1", "name": "After"}, {"id": "g2"}]})),
                &options().with_mode(ConflictMode::SkipExisting),
            )
            .unwrap();

        let outcome = report.outcome("sessionGroups");
        assert_eq!((outcome.added, outcome.skipped, outcome.updated), (1, 1, 0));
        let after = db.fetch_record("sessionGroups", "alice", "g1").unwrap().unwrap();
        assert_eq!(after.fields, before.fields);
    }

    #[test]
    fn overwrite_existing_counts_updates() {
        let db = setup_db();
        db.import_legacy(&export_fixture(), &options()).unwrap();
        let session_id = stored_id(&db, "sessions", "s1");

        let mut changed = export_fixture();
        changed.sessions[0]
            .meta
            .insert("title".into(), json!("Renamed"));
        changed.messages[0].content = Some("edited".into());

        let report = db
            .import_legacy(&changed, &options().with_mode(ConflictMode::OverwriteExisting))
            .unwrap();

        let sessions = report.outcome("sessions");
        assert_eq!((sessions.added, sessions.updated), (0, 1));
        assert_eq!(report.outcome("messages").updated, 3);
        assert_eq!(report.outcome("messages").added, 0);

        let session = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();
        assert_eq!(session.id, session_id);
        assert_eq!(session.text("title"), Some("Renamed"));
        let m1 = db.fetch_record("messages", "alice", "m1").unwrap().unwrap();
        assert_eq!(m1.text("content"), Some("edited"));
        let m2 = db.fetch_record("messages", "alice", "m2").unwrap().unwrap();
        assert_eq!(m2.text("parent_id"), Some(m1.id.as_str()));
        assert_eq!(db.count_rows("agents", "alice").unwrap(), 1);
    }

    #[test]
    fn repeated_ids_keep_the_first() {
        let db = setup_db();
        let data = legacy(json!({
            "sessionGroups": [{"id": "g1", "name": "first"}, {"id": "g1", "name": "second"}]
        }));

        let report = db.import_legacy(&data, &options()).unwrap();

        let outcome = report.outcome("sessionGroups");
        assert_eq!((outcome.added, outcome.skipped), (1, 1));
        let group = db.fetch_record("sessionGroups", "alice", "g1").unwrap().unwrap();
        assert_eq!(group.text("name"), Some("first"));
    }
}

mod failure_tests {
    use super::*;

    #[test]
    fn any_failure_rolls_back_the_whole_import() {
        let db = setup_db();
        // An agent timestamp that cannot be parsed fails the sessions step,
        // after session groups were already written.
        let data = legacy(json!({
            "sessionGroups": [{"id": "g1"}],
            "sessions": [{"id": "s1", "group": "g1", "config": {"createdAt": "soon"}}]
        }));

        let err = db.import_legacy(&data, &options()).unwrap_err();

        assert_eq!(error_code(&err), Some(ErrorCode::MalformedRecord));
        assert_eq!(db.count_rows("sessionGroups", "alice").unwrap(), 0);
        assert_eq!(db.count_rows("sessions", "alice").unwrap(), 0);
    }

    #[test]
    fn newer_version_is_rejected_before_writing() {
        let db = setup_db();
        let mut data = export_fixture();
        data.version = SUPPORTED_VERSION + 1;

        let err = db.import_legacy(&data, &options()).unwrap_err();

        assert_eq!(error_code(&err), Some(ErrorCode::IncompatibleVersion));
        assert!(db.row_counts("alice").unwrap().values().all(|c| *c == 0));
    }

    #[test]
    fn older_versions_are_accepted() {
        let db = setup_db();
        let mut data = export_fixture();
        data.version = 4;
        assert!(db.import_legacy(&data, &options()).is_ok());
    }
}

mod payload_tests {
    use super::*;

    #[test]
    fn dispatches_on_detected_shape() {
        let db = setup_db();
        let payload = Payload::from_value(
            json!({"version": 7, "sessionGroups": [{"id": "g1"}]}),
            PayloadFormat::Auto,
        )
        .unwrap();
        let report = db.import(&payload, &options()).unwrap();
        assert_eq!(report.outcome("sessionGroups").added, 1);

        let payload = Payload::from_value(
            json!({"version": 7, "data": {"sessionGroups": [{"id": "g2"}]}}),
            PayloadFormat::Auto,
        )
        .unwrap();
        let report = db.import(&payload, &options()).unwrap();
        assert_eq!(report.outcome("sessionGroups").added, 1);
        assert_eq!(db.count_rows("sessionGroups", "alice").unwrap(), 2);
    }

    #[test]
    fn preview_legacy_export() {
        let db = setup_db();
        db.import_legacy(
            &legacy(json!({"sessions": [{"id": "s1"}]})),
            &options(),
        )
        .unwrap();

        let report = db
            .preview_import(&Payload::Legacy(export_fixture()), &options())
            .unwrap();

        assert_eq!(report.outcome("sessions").skipped, 1);
        assert_eq!(report.outcome("messages").added, 3);
        assert_eq!(db.count_rows("messages", "alice").unwrap(), 0);
    }
}
