//! Declarative registry of importable entity types.
//!
//! Each [`EntitySpec`] names the dataset key an entity arrives under, the
//! table it lands in, the payload columns the importer will write, and the
//! explicit relationship table used to rewrite foreign keys. Foreign keys are
//! never inferred from column names: a field is a reference only if it is
//! listed in [`EntitySpec::relations`].
//!
//! [`DEPENDENCY_ORDER`] is the fixed processing order. Every relation points
//! at an entity earlier in the order, at the entity itself, or (for the one
//! declared cross-type cycle) at a later entity whose references are filled
//! in by the deferred pass.

/// Column holding the authoritative identifier.
pub const ID_COLUMN: &str = "id";
/// Column holding the dataset-local identifier.
pub const LOCAL_ID_COLUMN: &str = "client_id";
/// Column holding the owning identity.
pub const OWNER_COLUMN: &str = "user_id";

/// Bookkeeping columns every entity table carries.
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// A foreign-key column and the entity type it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// Column name in the owning table (snake_case).
    pub column: &'static str,
    /// Dataset key of the referenced entity type.
    pub references: &'static str,
}

impl Relation {
    const fn new(column: &'static str, references: &'static str) -> Self {
        Self { column, references }
    }
}

/// Storage description of one entity type.
#[derive(Debug)]
pub struct EntitySpec {
    /// Dataset key, e.g. `sessionGroups`.
    pub name: &'static str,
    /// Table name in the store.
    pub table: &'static str,
    /// Payload columns (excluding id, client_id, user_id and relations).
    pub columns: &'static [&'static str],
    /// Payload columns holding timestamps (epoch milliseconds).
    pub timestamps: &'static [&'static str],
    /// Foreign-key columns.
    pub relations: &'static [Relation],
    /// For rows without their own identifier: the relation columns whose
    /// local values, joined with `:`, form the local identifier.
    pub derived_local_id: Option<&'static [&'static str]>,
}

impl EntitySpec {
    pub fn id_column(&self) -> &'static str {
        ID_COLUMN
    }

    pub fn local_id_column(&self) -> &'static str {
        LOCAL_ID_COLUMN
    }

    pub fn owner_column(&self) -> &'static str {
        OWNER_COLUMN
    }

    /// Look up the relation declared for a column.
    pub fn relation(&self, column: &str) -> Option<&'static Relation> {
        self.relations.iter().find(|r| r.column == column)
    }

    /// Relations pointing back at this entity type.
    pub fn self_relations(&self) -> impl Iterator<Item = &'static Relation> + '_ {
        self.relations.iter().filter(|r| r.references == self.name)
    }

    /// Whether a column is writable from a dataset record (payload or relation).
    pub fn accepts_column(&self, column: &str) -> bool {
        self.columns.contains(&column) || self.relation(column).is_some()
    }

    pub fn is_timestamp(&self, column: &str) -> bool {
        self.timestamps.contains(&column)
    }

    /// All writable columns in a stable order: payload columns, then relations.
    pub fn writable_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .copied()
            .chain(self.relations.iter().map(|r| r.column))
            .collect()
    }
}

const STANDARD_TIMESTAMPS: &[&str] = &["created_at", "updated_at", "accessed_at"];
const BASIC_TIMESTAMPS: &[&str] = &["created_at", "updated_at"];

pub static SESSION_GROUPS: EntitySpec = EntitySpec {
    name: "sessionGroups",
    table: "session_groups",
    columns: &["name", "sort", "created_at", "updated_at", "accessed_at"],
    timestamps: STANDARD_TIMESTAMPS,
    relations: &[],
    derived_local_id: None,
};

pub static SESSIONS: EntitySpec = EntitySpec {
    name: "sessions",
    table: "sessions",
    columns: &[
        "slug",
        "title",
        "description",
        "avatar",
        "background_color",
        "type",
        "pinned",
        "created_at",
        "updated_at",
        "accessed_at",
    ],
    timestamps: STANDARD_TIMESTAMPS,
    relations: &[Relation::new("group_id", "sessionGroups")],
    derived_local_id: None,
};

pub static AGENTS: EntitySpec = EntitySpec {
    name: "agents",
    table: "agents",
    columns: &[
        "slug",
        "title",
        "description",
        "tags",
        "avatar",
        "background_color",
        "plugins",
        "chat_config",
        "params",
        "few_shots",
        "model",
        "provider",
        "system_role",
        "tts",
        "opening_message",
        "opening_questions",
        "created_at",
        "updated_at",
        "accessed_at",
    ],
    timestamps: STANDARD_TIMESTAMPS,
    relations: &[],
    derived_local_id: None,
};

pub static AGENTS_TO_SESSIONS: EntitySpec = EntitySpec {
    name: "agentsToSessions",
    table: "agents_to_sessions",
    columns: &["created_at", "updated_at"],
    timestamps: BASIC_TIMESTAMPS,
    relations: &[
        Relation::new("agent_id", "agents"),
        Relation::new("session_id", "sessions"),
    ],
    derived_local_id: Some(&["agent_id", "session_id"]),
};

pub static TOPICS: EntitySpec = EntitySpec {
    name: "topics",
    table: "topics",
    columns: &[
        "title",
        "favorite",
        "history_summary",
        "metadata",
        "created_at",
        "updated_at",
        "accessed_at",
    ],
    timestamps: STANDARD_TIMESTAMPS,
    relations: &[Relation::new("session_id", "sessions")],
    derived_local_id: None,
};

pub static MESSAGES: EntitySpec = EntitySpec {
    name: "messages",
    table: "messages",
    columns: &[
        "role",
        "content",
        "reasoning",
        "model",
        "provider",
        "favorite",
        "error",
        "tools",
        "trace_id",
        "observation_id",
        "created_at",
        "updated_at",
        "accessed_at",
    ],
    timestamps: STANDARD_TIMESTAMPS,
    relations: &[
        Relation::new("session_id", "sessions"),
        Relation::new("topic_id", "topics"),
        Relation::new("agent_id", "agents"),
        Relation::new("parent_id", "messages"),
        Relation::new("thread_id", "threads"),
    ],
    derived_local_id: None,
};

pub static MESSAGE_PLUGINS: EntitySpec = EntitySpec {
    name: "messagePlugins",
    table: "message_plugins",
    columns: &[
        "tool_call_id",
        "type",
        "api_name",
        "arguments",
        "identifier",
        "state",
        "error",
        "created_at",
        "updated_at",
    ],
    timestamps: BASIC_TIMESTAMPS,
    relations: &[Relation::new("message_id", "messages")],
    derived_local_id: None,
};

pub static MESSAGE_TRANSLATES: EntitySpec = EntitySpec {
    name: "messageTranslates",
    table: "message_translates",
    columns: &["content", "from", "to", "created_at", "updated_at"],
    timestamps: BASIC_TIMESTAMPS,
    relations: &[Relation::new("message_id", "messages")],
    derived_local_id: None,
};

/// Speech rendered for a message. `file_id` names a stored audio file.
pub static MESSAGE_TTS: EntitySpec = EntitySpec {
    name: "messageTTS",
    table: "message_tts",
    columns: &["content_md5", "file_id", "voice", "created_at", "updated_at"],
    timestamps: BASIC_TIMESTAMPS,
    relations: &[Relation::new("message_id", "messages")],
    derived_local_id: None,
};

pub static THREADS: EntitySpec = EntitySpec {
    name: "threads",
    table: "threads",
    columns: &[
        "title",
        "type",
        "status",
        "last_active_at",
        "created_at",
        "updated_at",
    ],
    timestamps: &["last_active_at", "created_at", "updated_at"],
    relations: &[
        Relation::new("topic_id", "topics"),
        Relation::new("source_message_id", "messages"),
        Relation::new("parent_thread_id", "threads"),
    ],
    derived_local_id: None,
};

/// Entity types in the order they are processed.
pub static DEPENDENCY_ORDER: &[&EntitySpec] = &[
    &SESSION_GROUPS,
    &SESSIONS,
    &AGENTS,
    &AGENTS_TO_SESSIONS,
    &TOPICS,
    &MESSAGES,
    &MESSAGE_PLUGINS,
    &MESSAGE_TRANSLATES,
    &MESSAGE_TTS,
    &THREADS,
];

/// Find an entity spec by its dataset key.
pub fn entity(name: &str) -> Option<&'static EntitySpec> {
    DEPENDENCY_ORDER.iter().copied().find(|spec| spec.name == name)
}
