use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::model::{ActuatorState, SensorReading, Session, User};

/// Persistence seam for readings and the actuator history.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_readings(&self, batch: &[SensorReading]) -> Result<()>;

    /// Readings at or after `since`, newest first.
    async fn readings_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<SensorReading>>;

    async fn latest_reading(&self) -> Result<Option<SensorReading>>;

    /// Latest history row for the actuator, by `recorded_at` then insertion order.
    async fn latest_state(&self, actuator_id: &str) -> Result<Option<ActuatorState>>;

    /// Appends a history row. Rows are never updated.
    async fn append_state(&self, record: &ActuatorState) -> Result<()>;

    async fn state_history(&self, actuator_id: &str, limit: i64) -> Result<Vec<ActuatorState>>;

    /// Returns false when the username or email is already taken.
    async fn create_user(&self, user: &User) -> Result<bool>;

    async fn find_user(&self, username: &str) -> Result<Option<User>>;

    async fn create_session(&self, session: &Session) -> Result<()>;

    /// Username owning `token`, if the session exists and has not expired at `now`.
    async fn session_user(&self, token: &str, now: DateTime<Utc>) -> Result<Option<String>>;

    async fn delete_session(&self, token: &str) -> Result<()>;
}
