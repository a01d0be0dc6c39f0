use rusqlite::{Connection, Result};

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS rounds (
            round_id INTEGER PRIMARY KEY,           -- assigned by the oracle
            start_time INTEGER NOT NULL,            -- unix ms
            lock_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL,
            start_price TEXT NOT NULL,              -- decimal strings
            lock_price TEXT,
            end_price TEXT,
            total_up_amount TEXT NOT NULL DEFAULT '0',
            total_down_amount TEXT NOT NULL DEFAULT '0',
            reward_amount TEXT NOT NULL DEFAULT '0',
            state TEXT NOT NULL CHECK (state IN ('ACTIVE', 'LOCKED', 'RESOLVED', 'CANCELLED')),
            resolved INTEGER NOT NULL DEFAULT 0,
            winning_position TEXT CHECK (winning_position IN ('UP', 'DOWN')),
            participant_count INTEGER NOT NULL DEFAULT 0,
            up_participants INTEGER NOT NULL DEFAULT 0,
            down_participants INTEGER NOT NULL DEFAULT 0,
            start_tx TEXT,
            lock_tx TEXT,
            resolve_tx TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (start_time < lock_time AND lock_time < end_time)
        )
        "#,
        [],
    )?;

    // At most one ACTIVE round, whoever writes it.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_rounds_single_active ON rounds(state) WHERE state = 'ACTIVE'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rounds_state ON rounds(state, round_id)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,                     -- lowercase address
            round_id INTEGER NOT NULL REFERENCES rounds(round_id),
            position TEXT NOT NULL CHECK (position IN ('UP', 'DOWN')),
            amount TEXT NOT NULL,
            claimed INTEGER NOT NULL DEFAULT 0,
            claimable_amount TEXT NOT NULL DEFAULT '0',
            is_winning INTEGER,                     -- NULL until settled
            payout TEXT NOT NULL DEFAULT '0',
            transaction_hash TEXT NOT NULL UNIQUE,
            predicted_at INTEGER NOT NULL,
            claimed_at INTEGER,
            UNIQUE (user, round_id),
            CHECK (claimed = 0 OR claimed_at IS NOT NULL)
        )
        "#,
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_predictions_round ON predictions(round_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_predictions_user_ts ON predictions(user, predicted_at DESC)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            address TEXT PRIMARY KEY,
            total_staked TEXT NOT NULL DEFAULT '0',
            total_winnings TEXT NOT NULL DEFAULT '0',
            current_win_streak INTEGER NOT NULL DEFAULT 0,
            max_win_streak INTEGER NOT NULL DEFAULT 0,
            total_rounds INTEGER NOT NULL DEFAULT 0,
            won_rounds INTEGER NOT NULL DEFAULT 0,
            win_rate REAL NOT NULL DEFAULT 0,
            roi REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS round_price_points (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            round_id INTEGER NOT NULL REFERENCES rounds(round_id),
            ts INTEGER NOT NULL,
            price TEXT NOT NULL,
            source TEXT NOT NULL
        )
        "#,
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_round_price_points_round_ts ON round_price_points(round_id, ts)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            key TEXT PRIMARY KEY,                   -- lock:<id> | resolve:<id> | start
            owner TEXT NOT NULL,                    -- scheduler instance id
            expires_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    Ok(())
}
