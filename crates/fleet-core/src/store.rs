//! Postgres store adapter.
//!
//! The store is the authoritative record of taxis, users, assignments, and
//! heartbeats, shared by the primary and backup dispatchers. It is passed
//! around as an explicit handle over a connection pool; the claim path is a
//! single conditional `UPDATE` so that exactly one of any set of racing
//! matchers wins a taxi.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::wire::{TaxiReport, TaxiStatus};

#[derive(Clone, Debug)]
pub struct TaxiRow {
    pub taxi_id: i64,
    pub pos_x: i64,
    pub pos_y: i64,
    pub speed: i64,
    pub status: TaxiStatus,
    pub connected: bool,
    pub initial_pos_x: i64,
    pub initial_pos_y: i64,
}

fn taxi_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<TaxiRow> {
    let status: String = row.try_get("status").context("status")?;
    Ok(TaxiRow {
        taxi_id: row.try_get("taxi_id").context("taxi_id")?,
        pos_x: row.try_get("pos_x").context("pos_x")?,
        pos_y: row.try_get("pos_y").context("pos_y")?,
        speed: row.try_get("speed").context("speed")?,
        status: status.parse()?,
        connected: row.try_get("connected").context("connected")?,
        initial_pos_x: row.try_get("initial_pos_x").context("initial_pos_x")?,
        initial_pos_y: row.try_get("initial_pos_y").context("initial_pos_y")?,
    })
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connect dispatch store")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("migrate dispatch store")?;
        Ok(())
    }

    /// Idempotent registration. First connect seeds `initial_pos_*`;
    /// re-registration updates pose/speed/status and marks the taxi
    /// connected without touching the initial pose. While the taxi has an
    /// open assignment the reported status is ignored, so a reconnect (or a
    /// connect-probe) can never free a claimed taxi.
    pub async fn upsert_taxi(&self, report: &TaxiReport) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO taxis (taxi_id, pos_x, pos_y, speed, status, connected, initial_pos_x, initial_pos_y)
            VALUES ($1, $2, $3, $4, $5, TRUE, $2, $3)
            ON CONFLICT (taxi_id) DO UPDATE SET
              pos_x = EXCLUDED.pos_x,
              pos_y = EXCLUDED.pos_y,
              speed = EXCLUDED.speed,
              status = CASE
                WHEN EXISTS (
                  SELECT 1 FROM assignments a
                  WHERE a.taxi_id = taxis.taxi_id AND a.status = 'assigned'
                ) THEN taxis.status
                ELSE EXCLUDED.status
              END,
              connected = TRUE,
              updated_at = now()
            "#,
        )
        .bind(report.taxi_id)
        .bind(report.pos_x)
        .bind(report.pos_y)
        .bind(report.speed)
        .bind(report.status.as_str())
        .execute(&self.pool)
        .await
        .context("upsert taxi")?;
        Ok(())
    }

    pub async fn set_taxi_position(&self, taxi_id: i64, pos_x: i64, pos_y: i64) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE taxis
            SET pos_x = $2,
                pos_y = $3,
                updated_at = now()
            WHERE taxi_id = $1
            "#,
        )
        .bind(taxi_id)
        .bind(pos_x)
        .bind(pos_y)
        .execute(&self.pool)
        .await
        .context("set taxi position")?;
        Ok(res.rows_affected() > 0)
    }

    /// Apply a position report from a connected taxi. Returns false when the
    /// taxi is unknown or currently marked disconnected (the report is
    /// dropped in that case). The reported status is ignored while an
    /// assignment is open, same as for registration.
    pub async fn apply_position_report(&self, report: &TaxiReport) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE taxis
            SET pos_x = $2,
                pos_y = $3,
                speed = $4,
                status = CASE
                  WHEN EXISTS (
                    SELECT 1 FROM assignments a
                    WHERE a.taxi_id = taxis.taxi_id AND a.status = 'assigned'
                  ) THEN taxis.status
                  ELSE $5
                END,
                updated_at = now()
            WHERE taxi_id = $1
              AND connected = TRUE
            "#,
        )
        .bind(report.taxi_id)
        .bind(report.pos_x)
        .bind(report.pos_y)
        .bind(report.speed)
        .bind(report.status.as_str())
        .execute(&self.pool)
        .await
        .context("apply position report")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_taxi_status(&self, taxi_id: i64, status: TaxiStatus) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE taxis
            SET status = $2,
                updated_at = now()
            WHERE taxi_id = $1
            "#,
        )
        .bind(taxi_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("set taxi status")?;
        Ok(())
    }

    /// Returns false when the taxi is unknown.
    pub async fn set_taxi_connected(&self, taxi_id: i64, connected: bool) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE taxis
            SET connected = $2,
                updated_at = now()
            WHERE taxi_id = $1
            "#,
        )
        .bind(taxi_id)
        .bind(connected)
        .execute(&self.pool)
        .await
        .context("set taxi connected")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_taxis_disconnected(&self, taxi_ids: &[i64]) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE taxis
            SET connected = FALSE,
                updated_at = now()
            WHERE taxi_id = ANY($1)
            "#,
        )
        .bind(taxi_ids)
        .execute(&self.pool)
        .await
        .context("mark taxis disconnected")?;
        Ok(())
    }

    /// The claim: compare-and-set from (available, connected) to
    /// unavailable. Exactly one racing caller can win a given taxi.
    pub async fn try_claim_available_taxi(&self, taxi_id: i64) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE taxis
            SET status = 'unavailable',
                updated_at = now()
            WHERE taxi_id = $1
              AND status = 'available'
              AND connected = TRUE
            "#,
        )
        .bind(taxi_id)
        .execute(&self.pool)
        .await
        .context("claim taxi")?;
        Ok(res.rows_affected() == 1)
    }

    /// Claim plus assignment insert in one transaction; `None` on a lost
    /// race.
    pub async fn claim_and_assign(&self, taxi_id: i64, user_id: i64) -> anyhow::Result<Option<i64>> {
        let mut tx = self.pool.begin().await.context("begin claim tx")?;

        let claimed = sqlx::query(
            r#"
            UPDATE taxis
            SET status = 'unavailable',
                updated_at = now()
            WHERE taxi_id = $1
              AND status = 'available'
              AND connected = TRUE
            "#,
        )
        .bind(taxi_id)
        .execute(&mut *tx)
        .await
        .context("claim taxi")?;

        if claimed.rows_affected() != 1 {
            return Ok(None);
        }

        let assignment_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO assignments (user_id, taxi_id, status)
            VALUES ($1, $2, 'assigned')
            RETURNING assignment_id
            "#,
        )
        .bind(user_id)
        .bind(taxi_id)
        .fetch_one(&mut *tx)
        .await
        .context("insert assignment")?;

        tx.commit().await.context("commit claim tx")?;
        Ok(Some(assignment_id))
    }

    pub async fn insert_assignment(&self, user_id: i64, taxi_id: i64) -> anyhow::Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO assignments (user_id, taxi_id, status)
            VALUES ($1, $2, 'assigned')
            RETURNING assignment_id
            "#,
        )
        .bind(user_id)
        .bind(taxi_id)
        .fetch_one(&self.pool)
        .await
        .context("insert assignment")
    }

    /// Eligible candidates, ordered by taxi_id for deterministic downstream
    /// ranking.
    pub async fn list_available_taxis(&self) -> anyhow::Result<Vec<TaxiRow>> {
        let rows = sqlx::query(
            r#"
            SELECT taxi_id, pos_x, pos_y, speed, status, connected, initial_pos_x, initial_pos_y
            FROM taxis
            WHERE status = 'available'
              AND connected = TRUE
            ORDER BY taxi_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list available taxis")?;
        rows.iter().map(taxi_row).collect()
    }

    pub async fn taxi(&self, taxi_id: i64) -> anyhow::Result<Option<TaxiRow>> {
        let row = sqlx::query(
            r#"
            SELECT taxi_id, pos_x, pos_y, speed, status, connected, initial_pos_x, initial_pos_y
            FROM taxis
            WHERE taxi_id = $1
            "#,
        )
        .bind(taxi_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch taxi")?;
        row.as_ref().map(taxi_row).transpose()
    }

    pub async fn connected_taxi_ids(&self) -> anyhow::Result<Vec<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT taxi_id
            FROM taxis
            WHERE connected = TRUE
            ORDER BY taxi_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list connected taxis")
    }

    pub async fn insert_user_request(
        &self,
        user_id: i64,
        pos_x: i64,
        pos_y: i64,
        wait_time: Option<i64>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, pos_x, pos_y, wait_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
              pos_x = EXCLUDED.pos_x,
              pos_y = EXCLUDED.pos_y,
              wait_time = EXCLUDED.wait_time,
              request_time = now()
            "#,
        )
        .bind(user_id)
        .bind(pos_x)
        .bind(pos_y)
        .bind(wait_time)
        .execute(&self.pool)
        .await
        .context("insert user request")?;
        Ok(())
    }

    /// Service completion: reset the taxi to its initial pose, make it
    /// available again, close the open assignment, and refresh the heartbeat
    /// stamp so the sweep cannot immediately evict it. One transaction.
    pub async fn finish_service(&self, taxi_id: i64) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("begin service-finish tx")?;

        sqlx::query(
            r#"
            UPDATE taxis
            SET pos_x = initial_pos_x,
                pos_y = initial_pos_y,
                status = 'available',
                connected = TRUE,
                updated_at = now()
            WHERE taxi_id = $1
            "#,
        )
        .bind(taxi_id)
        .execute(&mut *tx)
        .await
        .context("reset taxi after service")?;

        sqlx::query(
            r#"
            UPDATE assignments
            SET status = 'completed'
            WHERE taxi_id = $1
              AND status = 'assigned'
            "#,
        )
        .bind(taxi_id)
        .execute(&mut *tx)
        .await
        .context("complete assignment")?;

        sqlx::query(
            r#"
            INSERT INTO heartbeat (taxi_id)
            VALUES ($1)
            ON CONFLICT (taxi_id) DO UPDATE SET recorded_at = now()
            "#,
        )
        .bind(taxi_id)
        .execute(&mut *tx)
        .await
        .context("refresh heartbeat after service")?;

        tx.commit().await.context("commit service-finish tx")?;
        Ok(())
    }

    pub async fn record_heartbeat(&self, taxi_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO heartbeat (taxi_id)
            VALUES ($1)
            ON CONFLICT (taxi_id) DO UPDATE SET recorded_at = now()
            "#,
        )
        .bind(taxi_id)
        .execute(&self.pool)
        .await
        .context("record heartbeat")?;
        Ok(())
    }

    pub async fn last_heartbeat(&self, taxi_id: i64) -> anyhow::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            r#"
            SELECT recorded_at
            FROM heartbeat
            WHERE taxi_id = $1
            "#,
        )
        .bind(taxi_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch last heartbeat")
    }

    pub async fn active_assignment_count(&self, taxi_id: i64) -> anyhow::Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT count(*)
            FROM assignments
            WHERE taxi_id = $1
              AND status = 'assigned'
            "#,
        )
        .bind(taxi_id)
        .fetch_one(&self.pool)
        .await
        .context("count active assignments")
    }
}
