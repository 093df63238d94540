//! Integration tests for the table-driven import path.
//!
//! These tests run whole imports against an in-memory SQLite store and check
//! the reported tallies together with what actually landed in the tables.

use chat_data_import::db::Database;
use chat_data_import::db::import::{ConflictMode, ImportOptions, ImportOutcome};
use chat_data_import::error::{ErrorCode, error_code};
use chat_data_import::snapshot::{Payload, SUPPORTED_VERSION, TableSnapshot};
use serde_json::{Value, json};

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

fn snapshot(data: Value) -> TableSnapshot {
    serde_json::from_value(json!({ "version": SUPPORTED_VERSION, "data": data }))
        .expect("valid snapshot")
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

fn chat_fixture() -> TableSnapshot {
    snapshot(json!({
        "sessionGroups": [{"id": "g1", "name": "Work", "sort": 1}],
        "sessions": [
            {"id": "s1", "title": "First", "groupId": "g1"},
            {"id": "s2", "title": "Second"}
        ],
        "agents": [{"id": "a1", "title": "Helper", "model": "gpt-4o"}],
        "agentsToSessions": [{"agentId": "a1", "sessionId": "s1"}],
        "topics": [{"id": "t1", "title": "Intro", "sessionId": "s1"}],
        "messages": [
            {"id": "m1", "role": "user", "content": "hi", "sessionId": "s1", "topicId": "t1"},
            {"id": "m2", "role": "assistant", "content": "hello", "sessionId": "s1",
             "topicId": "t1", "parentId": "m1", "agentId": "a1"}
        ],
        "messagePlugins": [{"id": "m2", "messageId": "m2", "apiName": "search", "toolCallId": "call-1"}],
        "messageTranslates": [{"id": "m1", "messageId": "m1", "from": "en", "to": "fr", "content": "salut"}],
        "threads": [{"id": "th1", "title": "Side", "topicId": "t1", "sourceMessageId": "m1"}]
    }))
}

mod mapping_tests {
    use super::*;

    #[test]
    fn cross_table_reference_uses_minted_id() {
        let db = setup_db();
        let data = snapshot(json!({
            "sessionGroups": [{"id": "g1"}],
            "sessions": [{"id": "s1", "groupId": "g1"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();

        assert_eq!(report.outcome("sessionGroups").added, 1);
        assert_eq!(report.outcome("sessions").added, 1);
        let group_id = stored_id(&db, "sessionGroups", "g1");
        let session = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();
        assert_eq!(session.text("group_id"), Some(group_id.as_str()));
        assert_ne!(group_id, "g1");
    }

    #[test]
    fn every_foreign_key_points_at_a_record_from_this_run() {
        let db = setup_db();
        let report = db.import_tables(&chat_fixture(), &options()).unwrap();
        assert!(report.unresolved.is_empty(), "{:?}", report.unresolved);
        assert!(report.failed_entities().is_empty());

        let m2 = db.fetch_record("messages", "alice", "m2").unwrap().unwrap();
        assert_eq!(m2.text("session_id"), Some(stored_id(&db, "sessions", "s1").as_str()));
        assert_eq!(m2.text("topic_id"), Some(stored_id(&db, "topics", "t1").as_str()));
        assert_eq!(m2.text("agent_id"), Some(stored_id(&db, "agents", "a1").as_str()));
        assert_eq!(m2.text("parent_id"), Some(stored_id(&db, "messages", "m1").as_str()));

        let link = db
            .fetch_record("agentsToSessions", "alice", "a1:s1")
            .unwrap()
            .unwrap();
        assert_eq!(link.text("agent_id"), Some(stored_id(&db, "agents", "a1").as_str()));

        let thread = db.fetch_record("threads", "alice", "th1").unwrap().unwrap();
        assert_eq!(
            thread.text("source_message_id"),
            Some(stored_id(&db, "messages", "m1").as_str())
        );

        // Ungrouped session keeps an empty reference.
        let s2 = db.fetch_record("sessions", "alice", "s2").unwrap().unwrap();
        assert_eq!(s2.fields.get("group_id"), Some(&Value::Null));

        // No stored reference is a local id.
        db.with_conn(|conn| {
            let local_refs: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE session_id IN ('s1', 's2') OR topic_id = 't1' OR parent_id = 'm1'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(local_refs, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn self_reference_is_rewritten_after_insert() {
        let db = setup_db();
        let data = snapshot(json!({
            "messages": [{"id": "a"}, {"id": "b", "parentId": "a"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();

        assert_eq!(report.outcome("messages").added, 2);
        assert_eq!(report.rewrite_statements, 1);
        let a = stored_id(&db, "messages", "a");
        let b = db.fetch_record("messages", "alice", "b").unwrap().unwrap();
        assert_eq!(b.text("parent_id"), Some(a.as_str()));
    }

    #[test]
    fn child_listed_before_parent_is_resolved() {
        let db = setup_db();
        let data = snapshot(json!({
            "threads": [
                {"id": "child", "parentThreadId": "root"},
                {"id": "root"}
            ]
        }));

        let report = db.import_tables(&data, &options()).unwrap();
        assert!(report.unresolved.is_empty());
        let root = stored_id(&db, "threads", "root");
        let child = db.fetch_record("threads", "alice", "child").unwrap().unwrap();
        assert_eq!(child.text("parent_thread_id"), Some(root.as_str()));
    }

    #[test]
    fn thread_reference_on_messages_is_filled_once_threads_complete() {
        let db = setup_db();
        let data = snapshot(json!({
            "topics": [{"id": "t1"}],
            "messages": [{"id": "m1", "topicId": "t1", "threadId": "th1"}],
            "threads": [{"id": "th1", "topicId": "t1", "sourceMessageId": "m1"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();
        assert!(report.unresolved.is_empty());
        let thread = stored_id(&db, "threads", "th1");
        let message = db.fetch_record("messages", "alice", "m1").unwrap().unwrap();
        assert_eq!(message.text("thread_id"), Some(thread.as_str()));
    }

    #[test]
    fn missing_target_is_left_empty_and_reported() {
        let db = setup_db();
        let data = snapshot(json!({
            "sessions": [{"id": "s1"}],
            "topics": [{"id": "t1", "sessionId": "ghost"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();

        assert_eq!(report.outcome("topics").added, 1);
        assert_eq!(report.unresolved.len(), 1);
        let gap = &report.unresolved[0];
        assert_eq!(gap.entity, "topics");
        assert_eq!(gap.column, "session_id");
        assert_eq!(gap.target_local_id, "ghost");
        let topic = db.fetch_record("topics", "alice", "t1").unwrap().unwrap();
        assert_eq!(topic.fields.get("session_id"), Some(&Value::Null));
    }

    #[test]
    fn message_tts_points_at_imported_message() {
        let db = setup_db();
        let data = snapshot(json!({
            "messages": [{"id": "m1", "content": "read this aloud"}],
            "messageTTS": [{"id": "m1", "messageId": "m1", "voice": "alloy", "fileId": "file-1", "contentMd5": "abc"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();

        assert_eq!(report.outcome("messageTTS").added, 1);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        let tts = db.fetch_record("messageTTS", "alice", "m1").unwrap().unwrap();
        assert_eq!(tts.text("message_id"), Some(stored_id(&db, "messages", "m1").as_str()));
        assert_eq!(tts.text("voice"), Some("alloy"));
        assert_eq!(tts.text("file_id"), Some("file-1"));
        assert_eq!(tts.text("content_md5"), Some("abc"));
    }

    #[test]
    fn references_are_not_resolved_against_other_runs() {
        let db = setup_db();
        db.import_tables(&snapshot(json!({"sessions": [{"id": "s1"}]})), &options())
            .unwrap();

        let report = db
            .import_tables(
                &snapshot(json!({"topics": [{"id": "t1", "sessionId": "s1"}]})),
                &options(),
            )
            .unwrap();

        assert_eq!(report.unresolved.len(), 1);
        let topic = db.fetch_record("topics", "alice", "t1").unwrap().unwrap();
        assert_eq!(topic.fields.get("session_id"), Some(&Value::Null));
    }
}

mod reconciliation_tests {
    use super::*;

    #[test]
    fn second_import_skips_everything() {
        let db = setup_db();
        let data = chat_fixture();
        let first = db.import_tables(&data, &options()).unwrap();
        let m1 = stored_id(&db, "messages", "m1");
        let second = db.import_tables(&data, &options()).unwrap();

        for (entity, outcome) in &second.outcomes {
            let count = data.rows(entity).len();
            assert_eq!(outcome.added, 0, "{entity}");
            assert_eq!(outcome.skipped, count, "{entity}");
            assert_eq!(first.outcome(entity).added, count, "{entity}");
        }
        assert_eq!(db.count_rows("messages", "alice").unwrap(), 2);
        assert_eq!(stored_id(&db, "messages", "m1"), m1);
    }

    #[test]
    fn added_plus_skipped_matches_input_count() {
        let db = setup_db();
        db.import_tables(
            &snapshot(json!({"sessions": [{"id": "s1"}, {"id": "s2"}]})),
            &options(),
        )
        .unwrap();

        let data = snapshot(json!({
            "sessions": [{"id": "s1"}, {"id": "s3"}, {"id": "s3"}, {"id": "s4"}]
        }));
        let report = db.import_tables(&data, &options()).unwrap();

        let outcome = report.outcome("sessions");
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.added + outcome.skipped, 4);
        assert_eq!(outcome.added, 2);
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.contains("'s3' (record #2)"))
        );
    }

    #[test]
    fn skip_existing_leaves_stored_fields_unchanged() {
        let db = setup_db();
        db.import_tables(
            &snapshot(json!({"sessions": [{"id": "s1", "title": "Original"}]})),
            &options(),
        )
        .unwrap();
        let before = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();

        let report = db
            .import_tables(
                &snapshot(json!({"sessions": [{"id": "s1", "title": "Changed"}]})),
                &options().with_mode(ConflictMode::SkipExisting),
            )
            .unwrap();

        assert_eq!(
            report.outcome("sessions"),
            ImportOutcome {
                skipped: 1,
                ..ImportOutcome::default()
            }
        );
        let after = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();
        assert_eq!(after.fields, before.fields);
    }

    #[test]
    fn overwrite_existing_updates_in_place() {
        let db = setup_db();
        db.import_tables(
            &snapshot(json!({"sessions": [{"id": "s1", "title": "Original", "updatedAt": 1}]})),
            &options(),
        )
        .unwrap();
        let original_id = stored_id(&db, "sessions", "s1");

        let report = db
            .import_tables(
                &snapshot(json!({"sessions": [{"id": "s1", "title": "Changed"}]})),
                &options().with_mode(ConflictMode::OverwriteExisting),
            )
            .unwrap();

        let outcome = report.outcome("sessions");
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.added, 0);
        let after = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();
        assert_eq!(after.id, original_id);
        assert_eq!(after.text("title"), Some("Changed"));
        assert!(after.integer("updated_at").unwrap() > 1);
    }

    #[test]
    fn overwrite_with_null_created_at_keeps_stored_value() {
        let db = setup_db();
        db.import_tables(
            &snapshot(json!({"sessions": [{"id": "s1", "createdAt": 5}]})),
            &options(),
        )
        .unwrap();

        let report = db
            .import_tables(
                &snapshot(json!({"sessions": [{"id": "s1", "createdAt": null}]})),
                &options().with_mode(ConflictMode::OverwriteExisting),
            )
            .unwrap();

        assert_eq!(
            report.outcome("sessions"),
            ImportOutcome {
                updated: 1,
                ..ImportOutcome::default()
            }
        );
        let after = db.fetch_record("sessions", "alice", "s1").unwrap().unwrap();
        assert_eq!(after.integer("created_at"), Some(5));
    }

    #[test]
    fn overwritten_record_references_are_rewritten() {
        let db = setup_db();
        let first = snapshot(json!({
            "sessions": [{"id": "s1"}],
            "topics": [{"id": "t1", "sessionId": "s1"}]
        }));
        db.import_tables(&first, &options()).unwrap();

        let report = db
            .import_tables(&first, &options().with_mode(ConflictMode::OverwriteExisting))
            .unwrap();

        assert_eq!(report.outcome("topics").updated, 1);
        let topic = db.fetch_record("topics", "alice", "t1").unwrap().unwrap();
        assert_eq!(topic.text("session_id"), Some(stored_id(&db, "sessions", "s1").as_str()));
    }

    #[test]
    fn owners_are_isolated() {
        let db = setup_db();
        let data = snapshot(json!({"sessions": [{"id": "s1"}]}));
        db.import_tables(&data, &ImportOptions::new("alice")).unwrap();
        let report = db.import_tables(&data, &ImportOptions::new("bob")).unwrap();

        assert_eq!(report.outcome("sessions").added, 1);
        assert_eq!(db.count_rows("sessions", "alice").unwrap(), 1);
        assert_eq!(db.count_rows("sessions", "bob").unwrap(), 1);
        assert_ne!(
            db.fetch_record("sessions", "alice", "s1").unwrap().unwrap().id,
            db.fetch_record("sessions", "bob", "s1").unwrap().unwrap().id
        );
    }
}

mod batching_tests {
    use super::*;

    #[test]
    fn two_hundred_fifty_records_take_three_batches() {
        let db = setup_db();
        let messages: Vec<Value> = (0..250)
            .map(|i| json!({"id": format!("m{i}"), "content": "x"}))
            .collect();
        let data = snapshot(json!({ "messages": messages }));

        let report = db.import_tables(&data, &options()).unwrap();

        assert_eq!(report.outcome("messages").added, 250);
        assert_eq!(report.write_batches.get("messages"), Some(&3));
        assert_eq!(db.count_rows("messages", "alice").unwrap(), 250);
    }

    #[test]
    fn batch_size_is_configurable() {
        let db = setup_db();
        let topics: Vec<Value> = (0..10).map(|i| json!({"id": format!("t{i}")})).collect();
        let report = db
            .import_tables(&snapshot(json!({ "topics": topics })), &options().with_batch_size(4))
            .unwrap();
        assert_eq!(report.write_batches.get("topics"), Some(&3));
    }

    #[test]
    fn large_batch_size_stays_within_parameter_limit() {
        let db = setup_db();
        let agents: Vec<Value> = (0..2000)
            .map(|i| json!({"id": format!("a{i}"), "title": "Helper"}))
            .collect();

        let report = db
            .import_tables(&snapshot(json!({ "agents": agents })), &options().with_batch_size(2000))
            .unwrap();

        assert_eq!(report.outcome("agents").added, 2000);
        assert!(report.failed_entities().is_empty(), "{:?}", report.warnings);
        assert_eq!(report.write_batches.get("agents"), Some(&2));
        assert_eq!(db.count_rows("agents", "alice").unwrap(), 2000);
    }

    #[test]
    fn self_references_take_one_rewrite_statement() {
        let db = setup_db();
        let mut messages = vec![json!({"id": "m0"})];
        messages.extend((1..150).map(|i| json!({"id": format!("m{i}"), "parentId": format!("m{}", i - 1)})));

        let report = db
            .import_tables(&snapshot(json!({ "messages": messages })), &options())
            .unwrap();

        assert_eq!(report.rewrite_statements, 1);
        let m148 = stored_id(&db, "messages", "m148");
        let m149 = db.fetch_record("messages", "alice", "m149").unwrap().unwrap();
        assert_eq!(m149.text("parent_id"), Some(m148.as_str()));
    }
}

mod failure_tests {
    use super::*;

    #[test]
    fn failing_type_is_rolled_back_and_later_types_continue() {
        let db = setup_db();
        let data = snapshot(json!({
            "sessions": [{"id": "s1"}],
            "topics": [{"id": "t1", "sessionId": "s1"}, {"id": "t2", "createdAt": "not a date"}],
            "messages": [{"id": "m1", "sessionId": "s1", "topicId": "t1"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();

        assert_eq!(report.outcome("topics"), ImportOutcome::failed());
        assert_eq!(report.failed_entities(), vec!["topics"]);
        assert_eq!(db.count_rows("topics", "alice").unwrap(), 0);

        assert_eq!(report.outcome("sessions").added, 1);
        assert_eq!(report.outcome("messages").added, 1);
        let message = db.fetch_record("messages", "alice", "m1").unwrap().unwrap();
        assert_eq!(message.text("session_id"), Some(stored_id(&db, "sessions", "s1").as_str()));
        assert_eq!(message.fields.get("topic_id"), Some(&Value::Null));
        assert!(report.unresolved.iter().any(|u| u.column == "topic_id"));
        assert!(report.warnings.iter().any(|w| w.starts_with("topics")));
    }

    #[test]
    fn store_failure_warning_leaves_out_statement_text() {
        let db = setup_db();
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER topics_frozen BEFORE INSERT ON topics
                 BEGIN SELECT RAISE(ABORT, 'topics are frozen'); END;",
            )?;
            Ok(())
        })
        .unwrap();
        let topics: Vec<Value> = (0..300)
            .map(|i| json!({"id": format!("t{i}"), "title": "a fairly long topic title"}))
            .collect();

        let report = db
            .import_tables(&snapshot(json!({ "topics": topics })), &options())
            .unwrap();

        assert_eq!(report.outcome("topics"), ImportOutcome::failed());
        assert_eq!(
            report.warnings,
            vec!["topics: failed to write topics: topics are frozen".to_string()]
        );
    }

    #[test]
    fn non_object_record_fails_its_type() {
        let db = setup_db();
        let data = snapshot(json!({
            "sessionGroups": ["g1"],
            "sessions": [{"id": "s1", "groupId": "g1"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();
        assert_eq!(report.outcome("sessionGroups").errors, 1);
        assert_eq!(report.outcome("sessions").added, 1);
    }

    #[test]
    fn newer_version_is_rejected_before_writing() {
        let db = setup_db();
        let mut data = chat_fixture();
        data.version = SUPPORTED_VERSION + 1;

        let err = db.import_tables(&data, &options()).unwrap_err();

        assert_eq!(error_code(&err), Some(ErrorCode::IncompatibleVersion));
        assert_eq!(db.count_rows("sessions", "alice").unwrap(), 0);
    }

    #[test]
    fn unknown_entity_keys_are_ignored_with_a_warning() {
        let db = setup_db();
        let data = snapshot(json!({
            "users": [{"id": "u1"}],
            "sessions": [{"id": "s1"}]
        }));

        let report = db.import_tables(&data, &options()).unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("users")));
        assert!(!report.outcomes.contains_key("users"));
        assert_eq!(report.outcome("sessions").added, 1);
    }
}

mod preview_tests {
    use super::*;

    #[test]
    fn preview_classifies_without_writing() {
        let db = setup_db();
        db.import_tables(&snapshot(json!({"sessions": [{"id": "s1"}]})), &options())
            .unwrap();

        let payload = Payload::Tables(snapshot(json!({
            "sessions": [{"id": "s1"}, {"id": "s2"}],
            "topics": [{"id": "t1"}]
        })));
        let report = db
            .preview_import(&payload, &options().with_mode(ConflictMode::OverwriteExisting))
            .unwrap();

        assert_eq!(report.outcome("sessions").added, 1);
        assert_eq!(report.outcome("sessions").updated, 1);
        assert_eq!(report.outcome("topics").added, 1);
        assert!(report.write_batches.is_empty());
        assert_eq!(db.count_rows("sessions", "alice").unwrap(), 1);
        assert_eq!(db.count_rows("topics", "alice").unwrap(), 0);
    }

    #[test]
    fn preview_reports_malformed_type_and_continues() {
        let db = setup_db();
        let payload = Payload::Tables(snapshot(json!({
            "sessions": [{"id": "s1"}],
            "topics": [{"id": "t1", "createdAt": "not a date"}],
            "messages": [{"id": "m1"}]
        })));

        let report = db.preview_import(&payload, &options()).unwrap();

        assert_eq!(report.outcome("topics"), ImportOutcome::failed());
        assert_eq!(report.outcome("sessions").added, 1);
        assert_eq!(report.outcome("messages").added, 1);
        assert_eq!(report.failed_entities(), vec!["topics"]);
        assert!(report.warnings.iter().any(|w| w.contains("createdAt")));
    }

    #[test]
    fn preview_rejects_newer_versions() {
        let db = setup_db();
        let payload = Payload::Tables(TableSnapshot::new(SUPPORTED_VERSION + 3));
        let err = db.preview_import(&payload, &options()).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::IncompatibleVersion));
    }
}
