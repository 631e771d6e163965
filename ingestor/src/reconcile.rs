//! Actuator state reconciliation.
//!
//! A pump relay has two writers: the device, which reports the state it sees on
//! every reading, and users, who send explicit commands. Whichever assertion was
//! accepted last is frozen for a freshness window. During that window device
//! reports are answered with the frozen state, and the device applies it as its
//! command. Once the window has passed, the next report goes through.
//!
//! Every call appends one row to the actuator history. When the prior state holds,
//! the appended row repeats it with the prior `accepted_at`, so repeats never
//! extend the window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::errors::Result;
use crate::metrics::{RECONCILE_TOTAL, RELAY_COMMANDS_TOTAL};
use crate::model::{ActuatorState, Assertion, Freshness, Source};
use crate::store::Store;

pub const DEFAULT_FRESHNESS_WINDOW_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The prior state stayed authoritative and was repeated.
    Kept,
    /// The incoming assertion became authoritative.
    Accepted,
    /// No prior state and no preference: the relay defaults to off.
    Defaulted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Kept => "kept",
            Outcome::Accepted => "accepted",
            Outcome::Defaulted => "defaulted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// The row to append. Its `state` is the command echoed to the device.
    pub record: ActuatorState,
    pub outcome: Outcome,
}

/// True while `now` is inside the window that follows the prior acceptance.
///
/// An `accepted_at` in the future (clock skew between writers) counts as fresh.
pub fn is_fresh(prior: &ActuatorState, now: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(prior.accepted_at) < window
}

/// Picks the authoritative state for `assertion` given the latest history row.
///
/// User commands are the newest write and are always accepted. Device reports
/// are accepted only when there is no prior row or the prior row is stale.
pub fn decide(prior: Option<&ActuatorState>, assertion: &Assertion, window: Duration) -> Decision {
    let now = assertion.at;

    let prior = match prior {
        Some(prior) if assertion.source == Source::User => {
            debug!(
                "User command overrides {} state for {}",
                prior.source, prior.actuator_id
            );
            None
        }
        other => other,
    };

    match (prior, assertion.state) {
        (Some(prior), _) if is_fresh(prior, now, window) => repeat(prior, now),
        (Some(prior), None) => repeat(prior, now),
        (_, Some(state)) => Decision {
            record: ActuatorState {
                actuator_id: assertion.actuator_id.clone(),
                state,
                source: assertion.source,
                accepted_at: now,
                recorded_at: now,
            },
            outcome: Outcome::Accepted,
        },
        (None, None) => Decision {
            record: ActuatorState {
                actuator_id: assertion.actuator_id.clone(),
                state: false,
                source: assertion.source,
                accepted_at: now,
                recorded_at: now,
            },
            outcome: Outcome::Defaulted,
        },
    }
}

fn repeat(prior: &ActuatorState, now: DateTime<Utc>) -> Decision {
    Decision {
        record: ActuatorState {
            recorded_at: now,
            ..prior.clone()
        },
        outcome: Outcome::Kept,
    }
}

/// What the query endpoint reports for an actuator.
#[derive(Debug, Clone, PartialEq)]
pub enum StateView {
    Fresh(ActuatorState),
    Stale(ActuatorState),
    Absent,
}

impl StateView {
    pub fn freshness(&self) -> Freshness {
        match self {
            StateView::Fresh(_) => Freshness::Fresh,
            StateView::Stale(_) => Freshness::Stale,
            StateView::Absent => Freshness::Absent,
        }
    }

    pub fn record(&self) -> Option<&ActuatorState> {
        match self {
            StateView::Fresh(record) | StateView::Stale(record) => Some(record),
            StateView::Absent => None,
        }
    }
}

/// Read-decide-append against a [`Store`].
///
/// No lock is held between the read and the append. Two concurrent calls for one
/// actuator may both be accepted inside a window, and the history converges on
/// the later row.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    window: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, window_secs: i64) -> Self {
        Self {
            store,
            window: Duration::seconds(window_secs),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Reconciles a device report and returns the authoritative row.
    pub async fn reconcile(
        &self,
        actuator_id: &str,
        reported: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<ActuatorState> {
        self.apply(Assertion {
            actuator_id: actuator_id.to_string(),
            state: reported,
            source: Source::Device,
            at: now,
        })
        .await
    }

    /// Applies a user command. It always wins and restarts the window.
    pub async fn command(
        &self,
        actuator_id: &str,
        state: bool,
        now: DateTime<Utc>,
    ) -> Result<ActuatorState> {
        let record = self
            .apply(Assertion {
                actuator_id: actuator_id.to_string(),
                state: Some(state),
                source: Source::User,
                at: now,
            })
            .await?;
        RELAY_COMMANDS_TOTAL.inc();
        Ok(record)
    }

    pub async fn current(&self, actuator_id: &str, now: DateTime<Utc>) -> Result<StateView> {
        let view = match self.store.latest_state(actuator_id).await? {
            Some(record) if is_fresh(&record, now, self.window) => StateView::Fresh(record),
            Some(record) => StateView::Stale(record),
            None => StateView::Absent,
        };
        Ok(view)
    }

    async fn apply(&self, assertion: Assertion) -> Result<ActuatorState> {
        let prior = self.store.latest_state(&assertion.actuator_id).await?;
        let decision = decide(prior.as_ref(), &assertion, self.window);

        self.store.append_state(&decision.record).await?;
        RECONCILE_TOTAL
            .with_label_values(&[decision.outcome.as_str()])
            .inc();

        match decision.outcome {
            Outcome::Kept => debug!(
                "{} stays {} (accepted {}), {} report {:?} held back",
                assertion.actuator_id,
                on_off(decision.record.state),
                decision.record.accepted_at,
                assertion.source,
                assertion.state
            ),
            Outcome::Accepted | Outcome::Defaulted => info!(
                "{} set {} by {}",
                assertion.actuator_id,
                on_off(decision.record.state),
                assertion.source
            ),
        }

        Ok(decision.record)
    }
}

fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}
