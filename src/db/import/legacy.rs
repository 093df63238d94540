//! Fine-grained import of a [`LegacySnapshot`].
//!
//! Session groups, sessions and topics are upserted on `(local id, owner)`;
//! `added` is the number of rows the upsert touched minus the number that
//! already existed. New sessions get an agent built from their `config` and
//! `meta`, linked through `agents_to_sessions`. Messages are inserted with
//! their parent left empty, then parents are rewritten in one conditional
//! update once every message has an authoritative id. Plugin calls and
//! translations are stored for new messages only.
//!
//! Any error aborts the enclosing transaction.

use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Transaction};
use serde_json::{Map, Value};
use tracing::info;

use super::conflict::{self, Disposition, Plan};
use super::identity;
use super::record::{self, Columns, sanitize_text, truthy};
use super::references::Resolution;
use super::writer::{Row, mint_id};
use super::{ConflictMode, ImportContext, ImportOutcome, ImportStrategy};
use crate::db::registry::{
    AGENTS, AGENTS_TO_SESSIONS, EntitySpec, MESSAGE_PLUGINS, MESSAGE_TRANSLATES, MESSAGES,
    SESSION_GROUPS, SESSIONS, TOPICS,
};
use crate::snapshot::{LegacyMessage, LegacySession, LegacySnapshot};

/// Per-entity, all-or-nothing import strategy.
pub struct FineGrained<'a> {
    snapshot: &'a LegacySnapshot,
}

impl<'a> FineGrained<'a> {
    pub fn new(snapshot: &'a LegacySnapshot) -> Self {
        Self { snapshot }
    }
}

impl ImportStrategy for FineGrained<'_> {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn version(&self) -> u32 {
        self.snapshot.version
    }

    fn run(&self, tx: &mut Transaction<'_>, ctx: &mut ImportContext) -> Result<()> {
        let conn: &Connection = tx;
        let s = self.snapshot;

        if !s.session_groups.is_empty() {
            let rows = s
                .session_groups
                .iter()
                .map(|g| {
                    let mut values = Columns::new();
                    values.insert("name", opt_text(g.name.as_deref()));
                    values.insert("sort", g.sort.map_or(SqlValue::Null, SqlValue::Integer));
                    timestamps(&mut values, g.created_at, g.updated_at);
                    (g.id.clone(), values)
                })
                .collect();
            let (outcome, _) = upsert_entity(conn, ctx, &SESSION_GROUPS, rows)?;
            finish(ctx, &SESSION_GROUPS, outcome);
        }

        if !s.sessions.is_empty() {
            let rows = s
                .sessions
                .iter()
                .map(|session| (session.id.clone(), session_values(ctx, session)))
                .collect();
            let (outcome, plan) = upsert_entity(conn, ctx, &SESSIONS, rows)?;

            let new_sessions: Vec<&LegacySession> = s
                .sessions
                .iter()
                .zip(&plan.entries)
                .filter(|(_, entry)| matches!(entry, Some(Disposition::Insert)))
                .map(|(session, _)| session)
                .collect();
            if !new_sessions.is_empty() {
                link_agents(conn, ctx, &new_sessions)?;
            }
            finish(ctx, &SESSIONS, outcome);
        }

        if !s.topics.is_empty() {
            let mut rows: Vec<(String, Columns)> = Vec::with_capacity(s.topics.len());
            for topic in &s.topics {
                let mut values = Columns::new();
                values.insert("title", opt_text(topic.title.as_deref()));
                values.insert(
                    "favorite",
                    SqlValue::Integer(i64::from(truthy(topic.favorite.as_ref()))),
                );
                values.insert(
                    "session_id",
                    reference(ctx, &TOPICS, "session_id", &topic.id, topic.session_id.as_deref()),
                );
                timestamps(&mut values, topic.created_at, topic.updated_at);
                rows.push((topic.id.clone(), values));
            }
            let (outcome, _) = upsert_entity(conn, ctx, &TOPICS, rows)?;
            finish(ctx, &TOPICS, outcome);
        }

        if !s.messages.is_empty() {
            let outcome = import_messages(conn, ctx, &s.messages)?;
            finish(ctx, &MESSAGES, outcome);
        }

        Ok(())
    }

    fn local_ids(&self) -> Vec<(&'static EntitySpec, Result<Vec<String>>)> {
        let s = self.snapshot;
        vec![
            (&SESSION_GROUPS, Ok(s.session_groups.iter().map(|g| g.id.clone()).collect())),
            (&SESSIONS, Ok(s.sessions.iter().map(|x| x.id.clone()).collect())),
            (&TOPICS, Ok(s.topics.iter().map(|t| t.id.clone()).collect())),
            (&MESSAGES, Ok(s.messages.iter().map(|m| m.id.clone()).collect())),
        ]
    }
}

fn finish(ctx: &mut ImportContext, spec: &EntitySpec, outcome: ImportOutcome) {
    info!(
        entity = spec.name,
        added = outcome.added,
        skipped = outcome.skipped,
        updated = outcome.updated,
        "Completed entity type"
    );
    ctx.outcomes.insert(spec.name.to_string(), outcome);
}

/// Upsert rows of one entity type and publish their identity mappings.
///
/// Repeated local ids are dropped before writing; the first occurrence wins.
fn upsert_entity(
    conn: &Connection,
    ctx: &mut ImportContext,
    spec: &'static EntitySpec,
    rows: Vec<(String, Columns)>,
) -> Result<(ImportOutcome, Plan)> {
    info!(entity = spec.name, records = rows.len(), "Processing entity type");

    let locals: Vec<&str> = rows.iter().map(|(local, _)| local.as_str()).collect();
    let existing = identity::lookup_existing(conn, spec, &ctx.owner, &locals)?;
    let plan = conflict::plan(&locals, &existing, ctx.mode);

    let unique: Vec<Row> = rows
        .iter()
        .zip(&plan.entries)
        .filter(|(_, entry)| entry.is_some())
        .map(|((local, values), _)| Row::new(mint_id(), Some(local.clone()), values.clone()))
        .collect();

    let mapped = ctx
        .writer
        .upsert_batch(conn, spec, &ctx.owner, &unique, ctx.mode)?;
    for (local, id) in &mapped {
        ctx.identities.record(spec.name, local, id);
    }
    ctx.identities.complete(spec.name);

    let preexisting = plan.preexisting();
    let mut outcome = ImportOutcome {
        added: mapped.len().saturating_sub(preexisting),
        skipped: plan.duplicates(),
        ..ImportOutcome::default()
    };
    match ctx.mode {
        ConflictMode::SkipExisting => outcome.skipped += preexisting,
        ConflictMode::OverwriteExisting => outcome.updated = preexisting,
    }

    Ok((outcome, plan))
}

/// Session columns: payload, display metadata and the rewritten group reference.
fn session_values(ctx: &mut ImportContext, session: &LegacySession) -> Columns {
    let mut values = Columns::new();
    for (key, column) in [
        ("title", "title"),
        ("description", "description"),
        ("avatar", "avatar"),
        ("backgroundColor", "background_color"),
    ] {
        if let Some(value) = session.meta.get(key) {
            values.insert(column, record::json_to_sql(value));
        }
    }
    values.insert("type", opt_text(session.kind.as_deref()));
    values.insert(
        "pinned",
        session
            .pinned
            .map_or(SqlValue::Null, |p| SqlValue::Integer(i64::from(p))),
    );
    values.insert(
        "group_id",
        reference(ctx, &SESSIONS, "group_id", &session.id, session.group.as_deref()),
    );
    timestamps(&mut values, session.created_at, session.updated_at);
    values
}

/// Create one agent per new session from its `config` and `meta`, and link them.
fn link_agents(conn: &Connection, ctx: &mut ImportContext, sessions: &[&LegacySession]) -> Result<()> {
    let mut agents = Vec::with_capacity(sessions.len());
    let mut links = Vec::with_capacity(sessions.len());

    for (index, session) in sessions.iter().enumerate() {
        let mut fields: Map<String, Value> = session.config.clone();
        fields.extend(session.meta.clone());
        let (values, _) = record::prepare_fields(&AGENTS, index, &fields)?;
        let agent_id = mint_id();

        let Some(session_id) = ctx.identities.resolve(SESSIONS.name, &session.id) else {
            continue;
        };
        let mut link = Columns::new();
        link.insert("agent_id", SqlValue::Text(agent_id.clone()));
        link.insert("session_id", SqlValue::Text(session_id.to_string()));

        agents.push(Row::new(agent_id, None, values));
        links.push(Row::new(mint_id(), None, link));
    }

    ctx.writer.insert_batch(conn, &AGENTS, &ctx.owner, &agents)?;
    ctx.writer
        .insert_batch(conn, &AGENTS_TO_SESSIONS, &ctx.owner, &links)?;
    Ok(())
}

/// Insert new messages, rewrite their parents, then attach plugins and translations.
fn import_messages(
    conn: &Connection,
    ctx: &mut ImportContext,
    messages: &[LegacyMessage],
) -> Result<ImportOutcome> {
    info!(entity = MESSAGES.name, records = messages.len(), "Processing entity type");

    let locals: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    let existing = identity::lookup_existing(conn, &MESSAGES, &ctx.owner, &locals)?;
    let plan = conflict::plan(&locals, &existing, ctx.mode);

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut inserted: Vec<(&LegacyMessage, String)> = Vec::new();

    for (message, entry) in messages.iter().zip(&plan.entries) {
        let Some(disposition) = entry else {
            continue;
        };
        let id = match disposition {
            Disposition::Insert => mint_id(),
            Disposition::Skip { existing_id } => {
                ctx.identities.record(MESSAGES.name, &message.id, existing_id);
                continue;
            }
            Disposition::Update { existing_id } => existing_id.clone(),
        };
        ctx.identities.record(MESSAGES.name, &message.id, &id);

        let values = message_values(ctx, message, &id);
        let row = Row::new(id.clone(), Some(message.id.clone()), values);
        if matches!(disposition, Disposition::Insert) {
            inserts.push(row);
            inserted.push((message, id));
        } else {
            updates.push(row);
        }
    }

    let added = ctx
        .writer
        .insert_batch(conn, &MESSAGES, &ctx.owner, &inserts)?;
    for row in &updates {
        ctx.writer.update_one(conn, &MESSAGES, &row.id, &row.values)?;
    }

    ctx.identities.complete(MESSAGES.name);
    ctx.references
        .flush(conn, &mut ctx.writer, &ctx.identities, MESSAGES.name)?;

    insert_plugins(conn, ctx, &inserted)?;
    insert_translations(conn, ctx, &inserted)?;

    Ok(ImportOutcome {
        added,
        skipped: plan.skips(),
        updated: updates.len(),
        errors: 0,
    })
}

fn message_values(ctx: &mut ImportContext, message: &LegacyMessage, id: &str) -> Columns {
    let mut values = Columns::new();
    values.insert("role", opt_text(message.role.as_deref()));
    values.insert(
        "content",
        message
            .content
            .as_deref()
            .map_or(SqlValue::Null, |c| SqlValue::Text(sanitize_text(c))),
    );
    let extra = message.extra.as_ref();
    values.insert("model", opt_text(extra.and_then(|e| e.from_model.as_deref())));
    values.insert(
        "provider",
        opt_text(extra.and_then(|e| e.from_provider.as_deref())),
    );
    values.insert(
        "favorite",
        message
            .favorite
            .map_or(SqlValue::Null, |f| SqlValue::Integer(i64::from(f))),
    );
    values.insert(
        "error",
        message.error.as_ref().map_or(SqlValue::Null, record::json_to_sql),
    );
    values.insert(
        "session_id",
        reference(ctx, &MESSAGES, "session_id", &message.id, message.session_id.as_deref()),
    );
    values.insert(
        "topic_id",
        reference(ctx, &MESSAGES, "topic_id", &message.id, message.topic_id.as_deref()),
    );

    // Parents are written after every message has an id.
    if let (Some(parent), Some(relation)) = (message.parent_id.as_deref(), MESSAGES.relation("parent_id")) {
        ctx.references
            .resolve(&MESSAGES, relation, &message.id, id, parent, &ctx.identities);
    }
    values.insert("parent_id", SqlValue::Null);
    timestamps(&mut values, message.created_at, message.updated_at);
    values
}

fn insert_plugins(
    conn: &Connection,
    ctx: &mut ImportContext,
    inserted: &[(&LegacyMessage, String)],
) -> Result<()> {
    let rows: Vec<Row> = inserted
        .iter()
        .filter_map(|(message, message_id)| {
            let plugin = message.plugin.as_ref()?;
            let mut values = Columns::new();
            values.insert("message_id", SqlValue::Text(message_id.clone()));
            values.insert("tool_call_id", opt_text(message.tool_call_id.as_deref()));
            values.insert("type", opt_text(plugin.kind.as_deref()));
            values.insert("api_name", opt_text(plugin.api_name.as_deref()));
            values.insert("arguments", opt_text(plugin.arguments.as_deref()));
            values.insert("identifier", opt_text(plugin.identifier.as_deref()));
            values.insert(
                "state",
                message
                    .plugin_state
                    .as_ref()
                    .map_or(SqlValue::Null, record::json_to_sql),
            );
            Some(Row::new(mint_id(), Some(message.id.clone()), values))
        })
        .collect();

    if !rows.is_empty() {
        ctx.writer
            .insert_batch(conn, &MESSAGE_PLUGINS, &ctx.owner, &rows)?;
    }
    Ok(())
}

fn insert_translations(
    conn: &Connection,
    ctx: &mut ImportContext,
    inserted: &[(&LegacyMessage, String)],
) -> Result<()> {
    let mut rows = Vec::new();
    for (index, (message, message_id)) in inserted.iter().enumerate() {
        let Some(translate) = message.extra.as_ref().and_then(|e| e.translate.as_ref()) else {
            continue;
        };
        let (mut values, _) = record::prepare_fields(&MESSAGE_TRANSLATES, index, translate)?;
        values.insert("message_id", SqlValue::Text(message_id.clone()));
        rows.push(Row::new(mint_id(), Some(message.id.clone()), values));
    }

    if !rows.is_empty() {
        ctx.writer
            .insert_batch(conn, &MESSAGE_TRANSLATES, &ctx.owner, &rows)?;
    }
    Ok(())
}

/// Rewrite one reference to an entity type processed earlier in this run.
fn reference(
    ctx: &mut ImportContext,
    spec: &'static EntitySpec,
    column: &str,
    local_id: &str,
    target: Option<&str>,
) -> SqlValue {
    let (Some(target), Some(relation)) = (target.filter(|t| !t.is_empty()), spec.relation(column))
    else {
        return SqlValue::Null;
    };
    // Row ids are only needed for deferred references, which these never are.
    match ctx
        .references
        .resolve(spec, relation, local_id, "", target, &ctx.identities)
    {
        Resolution::Resolved(id) => SqlValue::Text(id),
        Resolution::Deferred | Resolution::Unresolved => SqlValue::Null,
    }
}

fn opt_text(value: Option<&str>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| SqlValue::Text(v.to_string()))
}

fn timestamps(values: &mut Columns, created_at: Option<i64>, updated_at: Option<i64>) {
    if let Some(ts) = created_at {
        values.insert("created_at", SqlValue::Integer(ts));
    }
    if let Some(ts) = updated_at {
        values.insert("updated_at", SqlValue::Integer(ts));
    }
}
