use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A persisted sensor reading from a solar/water board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub voltage: f64,
    pub current: f64,
    pub tds: f64,
    pub flow_rate: f64,
    pub total_liters: f64,
    pub light: i32,
    pub relay_state: Option<bool>,
}

/// Body of `POST /api/readings`.
///
/// Accepts both firmware dialects: `flow`/`liters`/`switch` (0 or 1) as well as
/// `flow_rate`/`total_liters`/`relay_state` (bool). Missing numbers read as zero.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadingPayload {
    pub device_id: Option<String>,
    pub actuator_id: Option<String>,
    #[serde(default)]
    pub voltage: f64,
    #[serde(default)]
    pub current: f64,
    #[serde(default)]
    pub tds: f64,
    #[serde(default, alias = "flow")]
    pub flow_rate: f64,
    #[serde(default, alias = "liters")]
    pub total_liters: f64,
    #[serde(default, deserialize_with = "adc_level")]
    pub light: i32,
    #[serde(default, alias = "switch", deserialize_with = "relay_flag")]
    pub relay_state: Option<bool>,
}

impl ReadingPayload {
    pub fn into_reading(self, device_id: String, timestamp: DateTime<Utc>) -> SensorReading {
        SensorReading {
            device_id,
            timestamp,
            voltage: self.voltage,
            current: self.current,
            tds: self.tds,
            flow_rate: self.flow_rate,
            total_liters: self.total_liters,
            light: self.light,
            relay_state: self.relay_state,
        }
    }
}

fn relay_flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(b)) => Ok(Some(b)),
        Some(Flag::Int(0)) => Ok(Some(false)),
        Some(Flag::Int(1)) => Ok(Some(true)),
        Some(Flag::Int(other)) => Err(serde::de::Error::custom(format!(
            "relay flag must be 0 or 1, got {}",
            other
        ))),
    }
}

/// ADC counts, sent as `2048` by one firmware and `2048.0` by the other.
fn adc_level<'de, D>(deserializer: D) -> std::result::Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
        return Err(serde::de::Error::custom(format!(
            "light must be a whole number, got {}",
            value
        )));
    }
    Ok(value as i32)
}

/// Who asserted an actuator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Device,
    User,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Device => "device",
            Source::User => "user",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "device" => Ok(Source::Device),
            "user" => Ok(Source::User),
            other => Err(format!("unknown state source '{}'", other)),
        }
    }
}

/// A proposed actuator state. `state` is `None` when a device has no preference.
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub actuator_id: String,
    pub state: Option<bool>,
    pub source: Source,
    pub at: DateTime<Utc>,
}

/// One row of the append-only actuator history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub actuator_id: String,
    pub state: bool,
    pub source: Source,
    pub accepted_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub relay_command: bool,
    pub switch: &'static str,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub status: &'static str,
    pub count: usize,
    pub data: Vec<SensorReading>,
}

#[derive(Debug, Serialize)]
pub struct LatestReadingResponse {
    pub status: &'static str,
    pub data: SensorReading,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Absent,
}

#[derive(Debug, Serialize)]
pub struct ActuatorStateResponse {
    pub actuator_id: String,
    pub freshness: Freshness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub actuator_id: String,
    pub count: usize,
    pub data: Vec<ActuatorState>,
}

#[derive(Debug, Deserialize)]
pub struct RelayCommand {
    pub state: bool,
    pub actuator_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RelayCommandResponse {
    pub status: &'static str,
    pub message: String,
    pub relay_state: bool,
    pub accepted_at: DateTime<Utc>,
}

/// Dashboard account. `password_hash` is a PHC string.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct User {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub token: String,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}
