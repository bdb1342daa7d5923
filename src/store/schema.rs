//! PostgreSQL schema
//!
//! Idempotent DDL applied at startup. Ids are ULID strings, enums are stored
//! by their `i16` discriminants, money is `NUMERIC(20,2)`.

use sqlx::PgPool;

const CREATE_CUSTOMERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    email           TEXT,
    active_status   SMALLINT NOT NULL,   -- 1=active, 2=inactive, 3=locked
    status          SMALLINT NOT NULL,   -- 1=valid, 0=soft-deleted
    version         BIGINT NOT NULL DEFAULT 1,
    created_by      TEXT NOT NULL,
    updated_by      TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id                      TEXT PRIMARY KEY,
    customer_id             TEXT NOT NULL REFERENCES customers(id),
    balance                 NUMERIC(20, 2) NOT NULL CHECK (balance >= 0),
    account_type            SMALLINT NOT NULL,
    active_status           SMALLINT NOT NULL,
    status                  SMALLINT NOT NULL,
    locked_for_tx           BOOLEAN NOT NULL DEFAULT FALSE,
    active_transaction_id   TEXT,
    locked_version          BIGINT,
    version                 BIGINT NOT NULL DEFAULT 1,
    created_by              TEXT NOT NULL,
    updated_by              TEXT NOT NULL,
    created_at              TIMESTAMPTZ NOT NULL,
    updated_at              TIMESTAMPTZ NOT NULL,
    CONSTRAINT accounts_lock_consistent
        CHECK (locked_for_tx = (active_transaction_id IS NOT NULL))
)
"#;

const CREATE_ACCOUNTS_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_accounts_active_tx ON accounts (active_transaction_id) WHERE active_transaction_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_accounts_customer ON accounts (customer_id)",
];

const CREATE_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id                      TEXT PRIMARY KEY,
    source_account_id       TEXT NOT NULL,
    destination_account_id  TEXT,
    amount                  NUMERIC(20, 2) NOT NULL CHECK (amount >= 0),
    tx_type                 SMALLINT NOT NULL,  -- 1=transfer, 2=withdraw_full, 3=withdraw_amount, 4=add_amount
    status                  SMALLINT NOT NULL,  -- 0=pending, 10=recovering, 40=completed, -10=failed, -20=cancelled
    reference_id            TEXT NOT NULL UNIQUE,
    timeout_at              TIMESTAMPTZ NOT NULL,
    retry_count             INTEGER NOT NULL DEFAULT 0,
    last_retry_at           TIMESTAMPTZ,
    error_reason            TEXT,
    version                 BIGINT NOT NULL DEFAULT 1,
    created_by              TEXT NOT NULL,
    updated_by              TEXT NOT NULL,
    created_at              TIMESTAMPTZ NOT NULL,
    updated_at              TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_TRANSACTIONS_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_transactions_status_timeout ON transactions (status, timeout_at)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_source ON transactions (source_account_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_destination ON transactions (destination_account_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions (created_at DESC)",
];

/// Append-only audit log; `seq` preserves append order per aggregate
const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    seq             BIGSERIAL PRIMARY KEY,
    id              TEXT NOT NULL UNIQUE,
    aggregate_type  SMALLINT NOT NULL,  -- 1=customer, 2=account, 3=transaction
    aggregate_id    TEXT NOT NULL,
    kind            TEXT NOT NULL,
    actor           TEXT NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_EVENTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_aggregate ON events (aggregate_id, seq)";

/// Create every table and index that does not exist yet
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Applying PostgreSQL schema...");

    sqlx::query(CREATE_CUSTOMERS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_ACCOUNTS_TABLE).execute(pool).await?;
    for ddl in CREATE_ACCOUNTS_INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    sqlx::query(CREATE_TRANSACTIONS_TABLE).execute(pool).await?;
    for ddl in CREATE_TRANSACTIONS_INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    sqlx::query(CREATE_EVENTS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_EVENTS_INDEX).execute(pool).await?;

    tracing::info!("PostgreSQL schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_is_idempotent() {
        for ddl in [
            CREATE_CUSTOMERS_TABLE,
            CREATE_ACCOUNTS_TABLE,
            CREATE_TRANSACTIONS_TABLE,
            CREATE_EVENTS_TABLE,
            CREATE_EVENTS_INDEX,
        ]
        .into_iter()
        .chain(CREATE_ACCOUNTS_INDEXES)
        .chain(CREATE_TRANSACTIONS_INDEXES)
        {
            assert!(ddl.contains("IF NOT EXISTS"), "{}", ddl);
        }
    }

    #[test]
    fn test_balance_cannot_go_negative() {
        assert!(CREATE_ACCOUNTS_TABLE.contains("CHECK (balance >= 0)"));
        assert!(CREATE_TRANSACTIONS_TABLE.contains("reference_id            TEXT NOT NULL UNIQUE"));
    }
}
