use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reading as posted by the sensor board firmware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub actuator_id: String,
    pub voltage: f64,
    pub current: f64,
    pub tds: f64,
    pub flow: f64,
    pub liters: f64,
    pub light: i32,
    pub switch: u8,
}

/// The part of the ingest response the board acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEcho {
    pub switch: String,
}

impl CommandEcho {
    /// Mirrors the firmware: anything but `switch_on`/`switch_off` leaves the relay alone.
    pub fn relay(&self) -> Option<bool> {
        match self.switch.as_str() {
            "switch_on" => Some(true),
            "switch_off" => Some(false),
            _ => None,
        }
    }
}

/// Simulated board: solar panel, TDS probe, flow meter and the pump relay.
#[derive(Debug, Clone)]
pub struct Board {
    pub device_id: String,
    pub actuator_id: String,
    pub relay_on: bool,
    pub total_liters: f64,
}

impl Board {
    pub fn new(device_id: String, actuator_id: String) -> Self {
        Self {
            device_id,
            actuator_id,
            relay_on: false,
            total_liters: 0.0,
        }
    }

    /// Samples the sensors over `interval_secs`, accumulating pumped water.
    pub fn sample(&mut self, rng: &mut impl Rng, interval_secs: f64) -> Reading {
        let voltage = if rng.gen_bool(0.03) {
            rng.gen_range(0.0..5.0) // 3% shading/dropouts
        } else {
            rng.gen_range(11.5..14.4)
        };

        // the pump only draws current and moves water while the relay is closed
        let (current, flow): (f64, f64) = if self.relay_on {
            (rng.gen_range(0.8..2.2), rng.gen_range(1.0..3.0))
        } else {
            (rng.gen_range(-0.05..0.05), 0.0)
        };
        // flow in L/min
        self.total_liters += flow * interval_secs / 60.0;

        Reading {
            device_id: self.device_id.clone(),
            actuator_id: self.actuator_id.clone(),
            voltage: round1(voltage),
            current: (current * 100.0).round() / 100.0,
            tds: round1(rng.gen_range(150.0..650.0)),
            flow: round1(flow),
            liters: round1(self.total_liters),
            light: rng.gen_range(0..4096),
            switch: u8::from(self.relay_on),
        }
    }

    /// Applies an echoed command. Returns true when the relay toggled.
    pub fn apply(&mut self, echo: &CommandEcho) -> bool {
        match echo.relay() {
            Some(on) if on != self.relay_on => {
                self.relay_on = on;
                true
            }
            _ => false,
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
