use crate::errors::{Error, Result};
use crate::model::SensorReading;

const LIGHT_MIN: i32 = 0;
const LIGHT_MAX: i32 = 4095;
const VOLTAGE_MAX: f64 = 1000.0;
const CURRENT_ABS_MAX: f64 = 100.0;
const ID_MAX_LEN: usize = 64;

/// Validates a sensor reading before it is queued for insert.
pub fn validate(reading: &SensorReading) -> Result<()> {
    validate_id("Device ID", &reading.device_id)?;

    let fields = [
        ("Voltage", reading.voltage),
        ("Current", reading.current),
        ("TDS", reading.tds),
        ("Flow rate", reading.flow_rate),
        ("Total liters", reading.total_liters),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(Error::Validation(format!("{} must be a finite number", name)));
        }
    }

    if reading.voltage < 0.0 || reading.voltage > VOLTAGE_MAX {
        return Err(Error::Validation(format!(
            "Voltage {} out of range [0, {}]",
            reading.voltage, VOLTAGE_MAX
        )));
    }

    // ACS712 output swings negative when the sensor is wired backwards
    if reading.current.abs() > CURRENT_ABS_MAX {
        return Err(Error::Validation(format!(
            "Current {} out of range [-{}, {}]",
            reading.current, CURRENT_ABS_MAX, CURRENT_ABS_MAX
        )));
    }

    for (name, value) in [
        ("TDS", reading.tds),
        ("Flow rate", reading.flow_rate),
        ("Total liters", reading.total_liters),
    ] {
        if value < 0.0 {
            return Err(Error::Validation(format!("{} {} must not be negative", name, value)));
        }
    }

    if reading.light < LIGHT_MIN || reading.light > LIGHT_MAX {
        return Err(Error::Validation(format!(
            "Light {} out of range [{}, {}]",
            reading.light, LIGHT_MIN, LIGHT_MAX
        )));
    }

    Ok(())
}

pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} cannot be empty", kind)));
    }
    if id.len() > ID_MAX_LEN {
        return Err(Error::Validation(format!(
            "{} longer than {} characters",
            kind, ID_MAX_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading() -> SensorReading {
        SensorReading {
            device_id: "octa-solar-1".to_string(),
            timestamp: Utc::now(),
            voltage: 12.6,
            current: 0.45,
            tds: 320.0,
            flow_rate: 1.2,
            total_liters: 54.3,
            light: 2100,
            relay_state: Some(true),
        }
    }

    #[test]
    fn test_valid_reading() {
        assert!(validate(&reading()).is_ok());

        let mut idle = reading();
        idle.current = -0.03;
        idle.flow_rate = 0.0;
        idle.relay_state = None;
        assert!(validate(&idle).is_ok());
    }

    #[test]
    fn test_non_finite_values() {
        let mut r = reading();
        r.voltage = f64::NAN;
        assert!(validate(&r).is_err());

        let mut r = reading();
        r.total_liters = f64::INFINITY;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_negative_tds() {
        let mut r = reading();
        r.tds = -1.0;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_light_out_of_adc_range() {
        let mut r = reading();
        r.light = 4096;
        assert!(validate(&r).is_err());

        r.light = -1;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let mut r = reading();
        r.device_id = "  ".to_string();
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_long_actuator_id() {
        assert!(validate_id("Actuator ID", "pump").is_ok());
        assert!(validate_id("Actuator ID", &"p".repeat(65)).is_err());
    }
}
