//! Database persistence for portfolio history and position journals.
//!
//! Stores what is needed to audit a session and resume after restart:
//! - Portfolio snapshots, one per tick
//! - Closed positions with their close reason
//! - Peak P&L and reinforcement links for open tickets

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{PortfolioSnapshot, Position};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored portfolio snapshot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub equity_value: String,
    pub realized_pnl: String,
    pub unrealized_pnl: String,
    pub position_count: i64,
}

/// Stored closed position.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredClosedPosition {
    pub ticket: i64,
    pub symbol: String,
    pub direction: String,
    pub entry_price: String,
    pub volume: String,
    pub open_time: String,
    pub close_time: Option<String>,
    pub pnl: String,
    pub peak_pnl: Option<String>,
    pub close_reason: Option<String>,
    pub reinforcement_of: Option<i64>,
}

/// Tracking state that the broker does not know about.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionMark {
    pub peak_pnl: Option<Decimal>,
    pub reinforcement_of: Option<u64>,
}

fn parse_decimal(raw: Option<String>) -> Option<Decimal> {
    raw.and_then(|s| s.parse().ok())
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity_value TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                position_count INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_positions (
                ticket INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                volume TEXT NOT NULL,
                open_time TEXT NOT NULL,
                close_time TEXT,
                pnl TEXT NOT NULL,
                peak_pnl TEXT,
                close_reason TEXT,
                reinforcement_of INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_marks (
                ticket INTEGER PRIMARY KEY,
                peak_pnl TEXT,
                reinforcement_of INTEGER,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_portfolio_history_time ON portfolio_history(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Portfolio History ====================

    /// Append a snapshot to the portfolio history.
    pub async fn record_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portfolio_history (timestamp, equity_value, realized_pnl, unrealized_pnl, position_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.timestamp().to_rfc3339())
        .bind(snapshot.equity_value().to_string())
        .bind(snapshot.realized_pnl().to_string())
        .bind(snapshot.unrealized_pnl().to_string())
        .bind(snapshot.position_count() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent snapshots, newest first.
    pub async fn get_history(&self, limit: i64) -> Result<Vec<StoredSnapshot>> {
        sqlx::query_as::<_, StoredSnapshot>(
            "SELECT * FROM portfolio_history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch portfolio history")
    }

    // ==================== Closed Positions ====================

    /// Journal a closed position and drop its mark.
    pub async fn record_closed_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO closed_positions
                (ticket, symbol, direction, entry_price, volume, open_time, close_time,
                 pnl, peak_pnl, close_reason, reinforcement_of)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position.id as i64)
        .bind(&position.symbol)
        .bind(position.direction.as_str())
        .bind(position.entry_price.to_string())
        .bind(position.volume.to_string())
        .bind(position.open_time.to_rfc3339())
        .bind(position.close_time.map(|t| t.to_rfc3339()))
        .bind(position.current_pnl.to_string())
        .bind(position.peak_pnl.map(|p| p.to_string()))
        .bind(position.close_reason().map(|r| r.as_str()))
        .bind(position.reinforcement_of.map(|t| t as i64))
        .execute(&self.pool)
        .await?;

        self.delete_mark(position.id).await
    }

    pub async fn get_closed_positions(&self, since: DateTime<Utc>) -> Result<Vec<StoredClosedPosition>> {
        sqlx::query_as::<_, StoredClosedPosition>(
            "SELECT * FROM closed_positions WHERE close_time >= ? ORDER BY close_time",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch closed positions")
    }

    // ==================== Position Marks ====================

    /// Save peak P&L and reinforcement link for an open ticket.
    pub async fn save_mark(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO position_marks (ticket, peak_pnl, reinforcement_of)
            VALUES (?, ?, ?)
            ON CONFLICT(ticket) DO UPDATE SET
                peak_pnl = excluded.peak_pnl,
                reinforcement_of = excluded.reinforcement_of,
                updated_at = datetime('now')
            "#,
        )
        .bind(position.id as i64)
        .bind(position.peak_pnl.map(|p| p.to_string()))
        .bind(position.reinforcement_of.map(|t| t as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_mark(&self, ticket: u64) -> Result<Option<PositionMark>> {
        let row: Option<(Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT peak_pnl, reinforcement_of FROM position_marks WHERE ticket = ?",
        )
        .bind(ticket as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(peak, origin)| PositionMark {
            peak_pnl: parse_decimal(peak),
            reinforcement_of: origin.map(|t| t as u64),
        }))
    }

    pub async fn delete_mark(&self, ticket: u64) -> Result<()> {
        sqlx::query("DELETE FROM position_marks WHERE ticket = ?")
            .bind(ticket as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, Direction};
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let db = memory_db().await;
        for equity in [dec!(10000), dec!(9950), dec!(9900)] {
            let snap = PortfolioSnapshot::new(Utc::now(), dec!(10000), Decimal::ZERO, equity - dec!(10000), 2);
            db.record_snapshot(&snap).await.unwrap();
        }

        let rows = db.get_history(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].equity_value, "9900");
        assert_eq!(rows[0].position_count, 2);
    }

    #[tokio::test]
    async fn test_mark_round_trip_and_cleared_on_close() {
        let db = memory_db().await;
        let opened = Utc::now();
        let mut pos = Position::new(77, "AUDUSD", Direction::Short, dec!(0.6550), dec!(0.5), opened)
            .with_reinforcement_of(70);
        pos.observe(dec!(42.5), opened);
        db.save_mark(&pos).await.unwrap();

        let mark = db.get_mark(77).await.unwrap().unwrap();
        assert_eq!(mark.peak_pnl, Some(dec!(42.5)));
        assert_eq!(mark.reinforcement_of, Some(70));

        pos.mark_closed(CloseReason::TrailingStop, Utc::now());
        db.record_closed_position(&pos).await.unwrap();

        assert!(db.get_mark(77).await.unwrap().is_none());
        let closed = db.get_closed_positions(opened - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason.as_deref(), Some("trailing_stop"));
    }
}
