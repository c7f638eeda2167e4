pub(crate) const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS budgets (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    amount          TEXT NOT NULL,
    current_amount  TEXT NOT NULL,
    active          BOOLEAN NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    end_at          TEXT,
    user_id         INTEGER NOT NULL,
    chat_id         INTEGER NOT NULL,
    user_name       TEXT NOT NULL,
    expenses        TEXT NOT NULL DEFAULT '[]'
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_budgets_one_active
    ON budgets(user_id, chat_id) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_budgets_chat_active ON budgets(chat_id, active);

"#;

pub(crate) const CURRENT_VERSION: i32 = 1;

/// Migrations from version N to N+1.
/// Each entry is (from_version, sql).
pub(crate) const MIGRATIONS: &[(i32, &str)] = &[];
