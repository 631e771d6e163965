use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{ActuatorState, SensorReading, Session, Source, User};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    actuator_id: String,
    state: bool,
    source: String,
    accepted_at: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<StateRow> for ActuatorState {
    type Error = Error;

    fn try_from(row: StateRow) -> Result<Self> {
        let source: Source = row.source.parse().map_err(Error::Validation)?;
        Ok(ActuatorState {
            actuator_id: row.actuator_id,
            state: row.state,
            source,
            accepted_at: row.accepted_at,
            recorded_at: row.recorded_at,
        })
    }
}

const READING_COLUMNS: &str = "device_id, ts AS timestamp, voltage, current, tds, flow_rate, total_liters, light, relay_state";
const STATE_COLUMNS: &str = "actuator_id, state, source, accepted_at, recorded_at";

#[async_trait]
impl Store for PgStore {
    async fn insert_readings(&self, batch: &[SensorReading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match insert_readings_inner(&self.pool, batch).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err)) => {
                    if attempts >= max_attempts || !is_transient_error(&db_err) {
                        error!(
                            "Database insert failed permanently after {} attempts: {}",
                            attempts, db_err
                        );
                        return Err(Error::Database(db_err));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Database insert failed with non-database error: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn readings_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<SensorReading>> {
        let query = format!(
            "SELECT {} FROM sensor_readings WHERE ts >= $1 ORDER BY ts DESC LIMIT $2",
            READING_COLUMNS
        );
        let readings = sqlx::query_as::<_, SensorReading>(&query)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(readings)
    }

    async fn latest_reading(&self) -> Result<Option<SensorReading>> {
        let query = format!(
            "SELECT {} FROM sensor_readings ORDER BY ts DESC, id DESC LIMIT 1",
            READING_COLUMNS
        );
        let reading = sqlx::query_as::<_, SensorReading>(&query)
            .fetch_optional(&self.pool)
            .await?;
        Ok(reading)
    }

    async fn latest_state(&self, actuator_id: &str) -> Result<Option<ActuatorState>> {
        let query = format!(
            "SELECT {} FROM actuator_states WHERE actuator_id = $1 \
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
            STATE_COLUMNS
        );
        let row = sqlx::query_as::<_, StateRow>(&query)
            .bind(actuator_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ActuatorState::try_from).transpose()
    }

    async fn append_state(&self, record: &ActuatorState) -> Result<()> {
        sqlx::query(
            "INSERT INTO actuator_states (actuator_id, state, source, accepted_at, recorded_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&record.actuator_id)
        .bind(record.state)
        .bind(record.source.as_str())
        .bind(record.accepted_at)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn state_history(&self, actuator_id: &str, limit: i64) -> Result<Vec<ActuatorState>> {
        let query = format!(
            "SELECT {} FROM actuator_states WHERE actuator_id = $1 \
             ORDER BY recorded_at DESC, id DESC LIMIT $2",
            STATE_COLUMNS
        );
        let rows = sqlx::query_as::<_, StateRow>(&query)
            .bind(actuator_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ActuatorState::try_from).collect()
    }

    async fn create_user(&self, user: &User) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (username, email, password_hash, role, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.role)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT username, email, password_hash, role, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (token, username, created_at, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&session.token)
        .bind(&session.username)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session_user(&self, token: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let username = sqlx::query_scalar::<_, String>(
            "SELECT username FROM sessions WHERE token = $1 AND expires_at > $2",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(username)
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_readings_inner(pool: &PgPool, batch: &[SensorReading]) -> Result<()> {
    let device_ids: Vec<&str> = batch.iter().map(|r| r.device_id.as_str()).collect();
    let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|r| r.timestamp).collect();
    let voltages: Vec<f64> = batch.iter().map(|r| r.voltage).collect();
    let currents: Vec<f64> = batch.iter().map(|r| r.current).collect();
    let tds: Vec<f64> = batch.iter().map(|r| r.tds).collect();
    let flow_rates: Vec<f64> = batch.iter().map(|r| r.flow_rate).collect();
    let totals: Vec<f64> = batch.iter().map(|r| r.total_liters).collect();
    let lights: Vec<i32> = batch.iter().map(|r| r.light).collect();
    let relays: Vec<Option<bool>> = batch.iter().map(|r| r.relay_state).collect();

    let query = r#"
        INSERT INTO sensor_readings
            (device_id, ts, voltage, current, tds, flow_rate, total_liters, light, relay_state)
        SELECT * FROM UNNEST(
            $1::text[], $2::timestamptz[], $3::float8[], $4::float8[], $5::float8[],
            $6::float8[], $7::float8[], $8::int4[], $9::bool[]
        )
        ON CONFLICT (device_id, ts) DO NOTHING
        "#;

    sqlx::query(query)
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(&voltages)
        .bind(&currents)
        .bind(&tds)
        .bind(&flow_rates)
        .bind(&totals)
        .bind(&lights)
        .bind(&relays)
        .execute(pool)
        .await?;

    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}
