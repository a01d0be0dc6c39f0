use super::{
    schema, InsertOutcome, LeaseStore, PredictionStore, RoundFilter, RoundPricePoint, RoundStore,
    UserStore,
};
use crate::models::{
    Position, Prediction, Round, RoundState, RoundTransactions, Settlement, UserStats,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use uuid::Uuid;

const ROUND_COLUMNS: &str = "round_id, start_time, lock_time, end_time, start_price, lock_price, \
     end_price, total_up_amount, total_down_amount, reward_amount, state, resolved, \
     winning_position, participant_count, up_participants, down_participants, start_tx, lock_tx, \
     resolve_tx, created_at, updated_at";

const PREDICTION_COLUMNS: &str = "id, user, round_id, position, amount, claimed, \
     claimable_amount, is_winning, payout, transaction_hash, predicted_at, claimed_at";

/// SQLite-backed store shared by the scheduler, ledger and jobs.
///
/// Several keeper processes may point at the same file; every lifecycle
/// write is a conditional update and multi-row changes run in one
/// transaction.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open round db at {db_path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy timeout")?;

        schema::create_tables(&conn).context("create round tables")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn bad_value(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value {value:?}").into(),
    )
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(raw)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|v| {
        Utc.timestamp_millis_opt(v)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, v))
    })
    .transpose()
}

fn parse_dec(idx: usize, raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    parse_dec(idx, &raw)
}

fn opt_dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|v| parse_dec(idx, &v)).transpose()
}

fn round_from_row(row: &Row<'_>) -> rusqlite::Result<Round> {
    let state_raw: String = row.get(10)?;
    let state = RoundState::parse(&state_raw).ok_or_else(|| bad_value(10, &state_raw))?;
    let winning_raw: Option<String> = row.get(12)?;
    let winning_position = winning_raw
        .map(|w| Position::parse(&w).ok_or_else(|| bad_value(12, &w)))
        .transpose()?;

    Ok(Round {
        round_id: row.get::<_, i64>(0)? as u64,
        start_time: ts_col(row, 1)?,
        lock_time: ts_col(row, 2)?,
        end_time: ts_col(row, 3)?,
        start_price: dec_col(row, 4)?,
        lock_price: opt_dec_col(row, 5)?,
        end_price: opt_dec_col(row, 6)?,
        total_up_amount: dec_col(row, 7)?,
        total_down_amount: dec_col(row, 8)?,
        reward_amount: dec_col(row, 9)?,
        state,
        resolved: row.get(11)?,
        winning_position,
        participant_count: row.get(13)?,
        up_participants: row.get(14)?,
        down_participants: row.get(15)?,
        transactions: RoundTransactions {
            start: row.get(16)?,
            lock: row.get(17)?,
            resolve: row.get(18)?,
        },
        created_at: ts_col(row, 19)?,
        updated_at: ts_col(row, 20)?,
    })
}

fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    let id_raw: String = row.get(0)?;
    let id = Uuid::parse_str(&id_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let position_raw: String = row.get(3)?;
    let position = Position::parse(&position_raw).ok_or_else(|| bad_value(3, &position_raw))?;

    Ok(Prediction {
        id,
        user: row.get(1)?,
        round_id: row.get::<_, i64>(2)? as u64,
        position,
        amount: dec_col(row, 4)?,
        claimed: row.get(5)?,
        claimable_amount: dec_col(row, 6)?,
        is_winning: row.get(7)?,
        payout: dec_col(row, 8)?,
        transaction_hash: row.get(9)?,
        predicted_at: ts_col(row, 10)?,
        claimed_at: opt_ts_col(row, 11)?,
    })
}

fn user_stats_from_row(row: &Row<'_>) -> rusqlite::Result<UserStats> {
    Ok(UserStats {
        total_staked: dec_col(row, 0)?,
        total_winnings: dec_col(row, 1)?,
        current_win_streak: row.get(2)?,
        max_win_streak: row.get(3)?,
        total_rounds: row.get(4)?,
        won_rounds: row.get(5)?,
        win_rate: row.get(6)?,
        roi: row.get(7)?,
    })
}

fn query_rounds<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<Vec<Round>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, round_from_row)?;
    rows.collect()
}

fn query_predictions<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<Vec<Prediction>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, prediction_from_row)?;
    rows.collect()
}

fn user_history(conn: &Connection, user: &str) -> rusqlite::Result<Vec<Prediction>> {
    let sql = format!("SELECT {PREDICTION_COLUMNS} FROM predictions WHERE user = ?1");
    query_predictions(conn, &sql, [user])
}

fn load_user_stats(conn: &Connection, user: &str) -> rusqlite::Result<Option<UserStats>> {
    conn.query_row(
        "SELECT total_staked, total_winnings, current_win_streak, max_win_streak,
                total_rounds, won_rounds, win_rate, roi
         FROM users WHERE address = ?1",
        [user],
        user_stats_from_row,
    )
    .optional()
}

fn write_user_stats(
    conn: &Connection,
    user: &str,
    stats: &UserStats,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO users (address, total_staked, total_winnings, current_win_streak,
                            max_win_streak, total_rounds, won_rounds, win_rate, roi,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(address) DO UPDATE SET
            total_staked = excluded.total_staked,
            total_winnings = excluded.total_winnings,
            current_win_streak = excluded.current_win_streak,
            max_win_streak = excluded.max_win_streak,
            total_rounds = excluded.total_rounds,
            won_rounds = excluded.won_rounds,
            win_rate = excluded.win_rate,
            roi = excluded.roi,
            updated_at = excluded.updated_at",
        params![
            user,
            stats.total_staked.to_string(),
            stats.total_winnings.to_string(),
            stats.current_win_streak,
            stats.max_win_streak,
            stats.total_rounds,
            stats.won_rounds,
            stats.win_rate,
            stats.roi,
            ms(now),
        ],
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl RoundStore for SqliteStore {
    async fn find_round(&self, round_id: u64) -> Result<Option<Round>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ROUND_COLUMNS} FROM rounds WHERE round_id = ?1");
        let round = conn
            .query_row(&sql, [round_id as i64], round_from_row)
            .optional()?;
        Ok(round)
    }

    async fn find_rounds_by_state(
        &self,
        state: RoundState,
        filter: RoundFilter,
    ) -> Result<Vec<Round>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ROUND_COLUMNS} FROM rounds
             WHERE state = ?1
               AND (?2 IS NULL OR lock_time <= ?2)
               AND (?3 IS NULL OR end_time <= ?3)
               AND (?4 = 0 OR resolved = 0)
             ORDER BY round_id ASC
             LIMIT ?5"
        );
        let rounds = query_rounds(
            &conn,
            &sql,
            params![
                state.as_str(),
                filter.lock_due_by.map(ms),
                filter.end_due_by.map(ms),
                filter.unresolved_only,
                filter.limit.map(i64::from).unwrap_or(-1),
            ],
        )?;
        Ok(rounds)
    }

    async fn find_active_round(&self) -> Result<Option<Round>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ROUND_COLUMNS} FROM rounds WHERE state = 'ACTIVE' LIMIT 1");
        Ok(conn.query_row(&sql, [], round_from_row).optional()?)
    }

    async fn find_current_round(&self) -> Result<Option<Round>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ROUND_COLUMNS} FROM rounds
             WHERE state IN ('ACTIVE', 'LOCKED')
             ORDER BY CASE state WHEN 'ACTIVE' THEN 0 ELSE 1 END, round_id DESC
             LIMIT 1"
        );
        Ok(conn.query_row(&sql, [], round_from_row).optional()?)
    }

    async fn recent_rounds(&self, limit: u32) -> Result<Vec<Round>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ROUND_COLUMNS} FROM rounds ORDER BY round_id DESC LIMIT ?1");
        Ok(query_rounds(&conn, &sql, [i64::from(limit)])?)
    }

    async fn recent_resolved_rounds(&self, limit: u32) -> Result<Vec<Round>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE state = 'RESOLVED'
             ORDER BY round_id DESC LIMIT ?1"
        );
        Ok(query_rounds(&conn, &sql, [i64::from(limit)])?)
    }

    async fn insert_round_if_no_active(&self, round: &Round) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let active_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM rounds WHERE state = 'ACTIVE')",
            [],
            |r| r.get(0),
        )?;
        if active_exists {
            return Ok(false);
        }

        let sql = format!(
            "INSERT OR IGNORE INTO rounds ({ROUND_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)"
        );
        let inserted = tx.execute(
            &sql,
            params![
                round.round_id as i64,
                ms(round.start_time),
                ms(round.lock_time),
                ms(round.end_time),
                round.start_price.to_string(),
                round.lock_price.map(|p| p.to_string()),
                round.end_price.map(|p| p.to_string()),
                round.total_up_amount.to_string(),
                round.total_down_amount.to_string(),
                round.reward_amount.to_string(),
                round.state.as_str(),
                round.resolved,
                round.winning_position.map(|p| p.as_str()),
                round.participant_count,
                round.up_participants,
                round.down_participants,
                round.transactions.start,
                round.transactions.lock,
                round.transactions.resolve,
                ms(round.created_at),
                ms(round.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    async fn save_transition(&self, expected: RoundState, round: &Round) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE rounds SET
                state = ?1,
                lock_price = ?2,
                end_price = ?3,
                resolved = ?4,
                winning_position = ?5,
                lock_tx = ?6,
                resolve_tx = ?7,
                updated_at = ?8
             WHERE round_id = ?9 AND state = ?10",
            params![
                round.state.as_str(),
                round.lock_price.map(|p| p.to_string()),
                round.end_price.map(|p| p.to_string()),
                round.resolved,
                round.winning_position.map(|p| p.as_str()),
                round.transactions.lock,
                round.transactions.resolve,
                ms(round.updated_at),
                round.round_id as i64,
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    async fn add_round_price_point(
        &self,
        round_id: u64,
        point: &RoundPricePoint,
        cap: u32,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO round_price_points (round_id, ts, price, source) VALUES (?1, ?2, ?3, ?4)",
            params![
                round_id as i64,
                ms(point.timestamp),
                point.price.to_string(),
                point.source,
            ],
        )?;
        tx.execute(
            "DELETE FROM round_price_points
             WHERE round_id = ?1 AND id NOT IN (
                SELECT id FROM round_price_points WHERE round_id = ?1
                ORDER BY ts DESC, id DESC LIMIT ?2
             )",
            params![round_id as i64, i64::from(cap)],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn round_price_points(&self, round_id: u64) -> Result<Vec<RoundPricePoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, price, source FROM round_price_points
             WHERE round_id = ?1 ORDER BY ts ASC, id ASC",
        )?;
        let points = stmt
            .query_map([round_id as i64], |row| {
                Ok(RoundPricePoint {
                    timestamp: ts_col(row, 0)?,
                    price: dec_col(row, 1)?,
                    source: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    async fn prune_round_price_points(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM round_price_points WHERE ts < ?1",
            [ms(older_than)],
        )?;
        Ok(removed)
    }

    async fn count_rounds(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM rounds", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    async fn rounds_with_unsettled_predictions(&self) -> Result<Vec<Round>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ROUND_COLUMNS} FROM rounds r
             WHERE r.state = 'RESOLVED'
               AND EXISTS (
                 SELECT 1 FROM predictions p
                 WHERE p.round_id = r.round_id AND p.is_winning IS NULL
               )
             ORDER BY r.round_id ASC"
        );
        Ok(query_rounds(&conn, &sql, [])?)
    }
}

#[async_trait::async_trait]
impl PredictionStore for SqliteStore {
    async fn insert_prediction(&self, prediction: &Prediction) -> Result<InsertOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let round = tx
            .query_row(
                "SELECT state, lock_time, total_up_amount, total_down_amount,
                        participant_count, up_participants, down_participants
                 FROM rounds WHERE round_id = ?1",
                [prediction.round_id as i64],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        dec_col(r, 2)?,
                        dec_col(r, 3)?,
                        r.get::<_, u32>(4)?,
                        r.get::<_, u32>(5)?,
                        r.get::<_, u32>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((state_raw, lock_time, mut total_up, mut total_down, mut participants, mut ups, mut downs)) =
            round
        else {
            return Ok(InsertOutcome::RoundNotFound);
        };
        let state = RoundState::parse(&state_raw)
            .with_context(|| format!("round {} has unknown state {state_raw}", prediction.round_id))?;
        if state != RoundState::Active || lock_time <= ms(prediction.predicted_at) {
            return Ok(InsertOutcome::RoundClosed(state));
        }

        let entry_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM predictions WHERE user = ?1 AND round_id = ?2)",
            params![prediction.user, prediction.round_id as i64],
            |r| r.get(0),
        )?;
        if entry_exists {
            return Ok(InsertOutcome::DuplicateEntry);
        }
        let tx_hash_used: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM predictions WHERE transaction_hash = ?1)",
            [&prediction.transaction_hash],
            |r| r.get(0),
        )?;
        if tx_hash_used {
            return Ok(InsertOutcome::DuplicateTxHash);
        }

        let sql = format!(
            "INSERT INTO predictions ({PREDICTION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        tx.execute(
            &sql,
            params![
                prediction.id.to_string(),
                prediction.user,
                prediction.round_id as i64,
                prediction.position.as_str(),
                prediction.amount.to_string(),
                prediction.claimed,
                prediction.claimable_amount.to_string(),
                prediction.is_winning,
                prediction.payout.to_string(),
                prediction.transaction_hash,
                ms(prediction.predicted_at),
                prediction.claimed_at.map(ms),
            ],
        )?;

        participants += 1;
        match prediction.position {
            Position::Up => {
                total_up += prediction.amount;
                ups += 1;
            }
            Position::Down => {
                total_down += prediction.amount;
                downs += 1;
            }
        }
        tx.execute(
            "UPDATE rounds SET total_up_amount = ?1, total_down_amount = ?2,
                participant_count = ?3, up_participants = ?4, down_participants = ?5,
                updated_at = ?6
             WHERE round_id = ?7",
            params![
                total_up.to_string(),
                total_down.to_string(),
                participants,
                ups,
                downs,
                ms(prediction.predicted_at),
                prediction.round_id as i64,
            ],
        )?;

        let mut stats = load_user_stats(&tx, &prediction.user)?.unwrap_or_default();
        stats.record_stake(prediction.amount);
        write_user_stats(&tx, &prediction.user, &stats, prediction.predicted_at)?;

        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    async fn find_prediction(&self, user: &str, round_id: u64) -> Result<Option<Prediction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE user = ?1 AND round_id = ?2"
        );
        Ok(conn
            .query_row(&sql, params![user, round_id as i64], prediction_from_row)
            .optional()?)
    }

    async fn predictions_by_round(&self, round_id: u64) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE round_id = ?1
             ORDER BY predicted_at ASC, id ASC"
        );
        Ok(query_predictions(&conn, &sql, [round_id as i64])?)
    }

    async fn predictions_by_user(
        &self,
        user: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE user = ?1
             ORDER BY predicted_at DESC, round_id DESC LIMIT ?2"
        );
        Ok(query_predictions(
            &conn,
            &sql,
            params![user, limit.map(i64::from).unwrap_or(-1)],
        )?)
    }

    async fn unclaimed_predictions(&self, user: &str) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions
             WHERE user = ?1 AND is_winning = 1 AND claimed = 0
             ORDER BY round_id ASC"
        );
        let rows = query_predictions(&conn, &sql, [user])?;
        Ok(rows
            .into_iter()
            .filter(|p| p.claimable_amount > Decimal::ZERO)
            .collect())
    }

    async fn apply_settlement(&self, prediction_id: Uuid, settlement: Settlement) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT user, is_winning, claimed FROM predictions WHERE id = ?1",
                [prediction_id.to_string()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, Option<bool>>(1)?,
                        r.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((user, previous, claimed)) = row else {
            bail!("prediction {prediction_id} not found");
        };
        if claimed {
            return Ok(false);
        }

        tx.execute(
            "UPDATE predictions SET is_winning = ?1, claimable_amount = ?2, payout = ?3
             WHERE id = ?4 AND claimed = 0",
            params![
                settlement.is_winning,
                settlement.claimable_amount.to_string(),
                settlement.payout.to_string(),
                prediction_id.to_string(),
            ],
        )?;

        let newly_settled = previous.is_none();
        if newly_settled && !settlement.is_winning {
            let mut stats = load_user_stats(&tx, &user)?.unwrap_or_default();
            stats.replay_streaks(&user_history(&tx, &user)?);
            write_user_stats(&tx, &user, &stats, Utc::now())?;
        }

        tx.commit()?;
        Ok(newly_settled)
    }

    async fn mark_claimed(
        &self,
        prediction_id: Uuid,
        amount: Decimal,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let user: Option<String> = tx
            .query_row(
                "SELECT user FROM predictions WHERE id = ?1 AND claimed = 0",
                [prediction_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        let Some(user) = user else {
            return Ok(false);
        };

        let changed = tx.execute(
            "UPDATE predictions SET claimed = 1, claimed_at = ?1, payout = ?2, claimable_amount = ?2
             WHERE id = ?3 AND claimed = 0",
            params![ms(claimed_at), amount.to_string(), prediction_id.to_string()],
        )?;
        if changed != 1 {
            return Ok(false);
        }

        let mut stats = load_user_stats(&tx, &user)?.unwrap_or_default();
        stats.record_claim(amount);
        stats.replay_streaks(&user_history(&tx, &user)?);
        write_user_stats(&tx, &user, &stats, claimed_at)?;

        tx.commit()?;
        Ok(true)
    }

    async fn count_predictions(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM predictions", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    async fn total_volume(&self) -> Result<Decimal> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT amount FROM predictions")?;
        let amounts = stmt
            .query_map([], |r| dec_col(r, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(amounts.into_iter().sum())
    }
}

#[async_trait::async_trait]
impl UserStore for SqliteStore {
    async fn get_user_stats(&self, user: &str) -> Result<Option<UserStats>> {
        let conn = self.conn.lock().await;
        Ok(load_user_stats(&conn, user)?)
    }

    async fn replace_user_stats(&self, user: &str, stats: &UserStats) -> Result<()> {
        let conn = self.conn.lock().await;
        write_user_stats(&conn, user, stats, Utc::now())?;
        Ok(())
    }

    async fn rederive_user_stats(&self, user: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let derived = UserStats::derive(&user_history(&tx, user)?);
        if load_user_stats(&tx, user)?.as_ref() == Some(&derived) {
            return Ok(false);
        }
        write_user_stats(&tx, user, &derived, Utc::now())?;
        tx.commit()?;
        Ok(true)
    }

    async fn list_users(&self, offset: u32, limit: u32) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT address FROM users ORDER BY address ASC LIMIT ?1 OFFSET ?2")?;
        let users = stmt
            .query_map([i64::from(limit), i64::from(offset)], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(users)
    }

    async fn count_users(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

#[async_trait::async_trait]
impl LeaseStore for SqliteStore {
    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT INTO leases (key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE leases.expires_at <= ?4 OR leases.owner = excluded.owner",
            params![key, owner, ms(now + ttl), ms(now)],
        )?;
        Ok(changed == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM leases WHERE key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(())
    }

    async fn prune_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM leases WHERE expires_at <= ?1", [ms(now)])?;
        Ok(removed)
    }
}
