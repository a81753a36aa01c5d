//! Per-batch temperature control.
//!
//! A single loop ticks every [`CONTROL_TICK`], enumerates the fermenting
//! batches with a linked device, a target and at least one actuator, and
//! drives each one through staleness, override, decision, mutex, dwell and
//! apply stages. An error on one batch never affects another, and the
//! mutex and dwell guarantees hold no matter which strategy produced the
//! decision.

pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::controller::strategy::{ControlStrategy, Desire, HysteresisStrategy};
use crate::error::Result;
use crate::hub::BroadcastHub;
use crate::store::{Batch, Database};
use crate::switch::{SwitchService, SwitchState};

/// Interval between control ticks.
pub const CONTROL_TICK: Duration = Duration::from_secs(30);

/// A reading older than this is too stale to act on.
pub const STALE_AFTER: chrono::Duration = chrono::Duration::minutes(5);

/// Minimum interval between opposite-direction commands to one actuator.
pub const DWELL: chrono::Duration = chrono::Duration::minutes(5);

/// Hysteresis half-band used when a batch has none configured, °C.
pub const DEFAULT_HYSTERESIS: f64 = 0.5;

/// History slice handed to model-based strategies.
const STRATEGY_HISTORY: i64 = 60;

/// Which actuator an override targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorTarget {
    Heater,
    Cooler,
}

/// A manual override forcing one actuator until expiry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlOverride {
    /// Which actuator is forced.
    pub target: ActuatorTarget,
    /// The forced state.
    pub force_on: bool,
    /// When the override lapses.
    pub expires_at: DateTime<Utc>,
}

/// Last known commanded state of one actuator.
#[derive(Debug, Clone, Copy)]
struct CommandRecord {
    state: SwitchState,
    /// When the state last changed via a successful apply.
    last_transition_at: Option<DateTime<Utc>>,
}

impl Default for CommandRecord {
    fn default() -> Self {
        Self {
            state: SwitchState::Unknown,
            last_transition_at: None,
        }
    }
}

/// In-memory control state per batch.
#[derive(Debug, Default)]
struct BatchControlState {
    heater: CommandRecord,
    cooler: CommandRecord,
    override_: Option<ControlOverride>,
}

/// The per-batch temperature controller.
pub struct TempController {
    db: Arc<Database>,
    switch: Arc<dyn SwitchService>,
    hub: Arc<BroadcastHub>,
    config: Arc<ConfigStore>,
    strategy: Box<dyn ControlStrategy>,
    states: Mutex<HashMap<i64, BatchControlState>>,
}

impl TempController {
    /// Create a controller with the default hysteresis strategy.
    pub fn new(
        db: Arc<Database>,
        switch: Arc<dyn SwitchService>,
        hub: Arc<BroadcastHub>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self::with_strategy(db, switch, hub, config, Box::new(HysteresisStrategy))
    }

    /// Create a controller with an injected decision strategy (the MPC
    /// seam). Mutex and dwell stages are unchanged.
    pub fn with_strategy(
        db: Arc<Database>,
        switch: Arc<dyn SwitchService>,
        hub: Arc<BroadcastHub>,
        config: Arc<ConfigStore>,
        strategy: Box<dyn ControlStrategy>,
    ) -> Self {
        Self {
            db,
            switch,
            hub,
            config,
            strategy,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Run the tick loop until shutdown, then send every actuator to the
    /// safe-stop state.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("temperature controller started");
        let mut ticker = tokio::time::interval(CONTROL_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
        self.safe_stop().await;
        info!("temperature controller stopped");
    }

    /// One pass over all controllable batches. Batches are processed
    /// sequentially; a failure on one is logged and isolated.
    pub async fn tick(&self, now: DateTime<Utc>) {
        // Config is re-read every tick; with the switch service disabled
        // the controller is a bystander.
        if !self.config.get().ha_enabled {
            return;
        }
        let batches = match self.db.active_control_batches().await {
            Ok(batches) => batches,
            Err(e) => {
                warn!("controller tick could not enumerate batches: {e}");
                return;
            }
        };
        let active: Vec<i64> = batches.iter().map(|b| b.id).collect();
        for batch in batches {
            if let Err(e) = self.tick_batch(&batch, now).await {
                warn!(batch_id = batch.id, "controller skipped batch: {e}");
            }
        }
        self.prune_states(&active);
    }

    /// Set a manual override; expiry is checked each tick.
    pub fn set_override(&self, batch_id: i64, override_: ControlOverride) {
        info!(
            batch_id,
            target = ?override_.target,
            force_on = override_.force_on,
            expires_at = %override_.expires_at,
            "manual override set"
        );
        self.states.lock().entry(batch_id).or_default().override_ = Some(override_);
    }

    /// Clear a manual override.
    pub fn clear_override(&self, batch_id: i64) {
        if let Some(state) = self.states.lock().get_mut(&batch_id) {
            if state.override_.take().is_some() {
                info!(batch_id, "manual override cleared");
            }
        }
    }

    /// The active override for a batch, if any.
    pub fn get_override(&self, batch_id: i64) -> Option<ControlOverride> {
        self.states.lock().get(&batch_id).and_then(|s| s.override_)
    }

    /// Best-effort OFF to both actuators of every controllable batch.
    pub async fn safe_stop(&self) {
        if !self.config.get().ha_enabled {
            return;
        }
        let batches = match self.db.active_control_batches().await {
            Ok(batches) => batches,
            Err(e) => {
                warn!("safe-stop could not enumerate batches: {e}");
                return;
            }
        };
        for batch in &batches {
            for entity in [&batch.heater_entity, &batch.cooler_entity]
                .into_iter()
                .flatten()
            {
                if let Err(e) = self.switch.set_state(entity, false).await {
                    warn!(entity, "safe-stop command failed: {e}");
                }
            }
        }
        info!("safe-stop issued for {} batches", batches.len());
    }

    async fn tick_batch(&self, batch: &Batch, now: DateTime<Utc>) -> Result<()> {
        // The enumeration query guarantees these.
        let Some(device_id) = batch.device_id.as_deref() else {
            return Ok(());
        };
        let Some(target) = batch.temp_target else {
            return Ok(());
        };
        let hysteresis = batch.temp_hysteresis.unwrap_or(DEFAULT_HYSTERESIS);

        // 1. Staleness gate.
        let latest = self.db.latest_valid_reading(device_id).await?;
        let Some(reading) = latest else {
            debug!(batch_id = batch.id, "no readings yet; skipping");
            return Ok(());
        };
        let Some(temp_c) = reading.temperature_filtered else {
            debug!(batch_id = batch.id, "no filtered temperature; skipping");
            return Ok(());
        };
        if now - reading.timestamp > STALE_AFTER {
            warn!(
                batch_id = batch.id,
                age_secs = (now - reading.timestamp).num_seconds(),
                "latest temperature too stale; skipping control decision"
            );
            return Ok(());
        }

        self.seed_actuator_states(batch).await;

        // 2. Override, with expiry check.
        let override_ = {
            let mut states = self.states.lock();
            let state = states.entry(batch.id).or_default();
            if let Some(o) = state.override_ {
                if now >= o.expires_at {
                    info!(batch_id = batch.id, "override expired");
                    state.override_ = None;
                    None
                } else {
                    Some(o)
                }
            } else {
                None
            }
        };

        let (heater_state, cooler_state) = {
            let states = self.states.lock();
            states
                .get(&batch.id)
                .map(|s| (s.heater, s.cooler))
                .unwrap_or_default()
        };

        let (heater_next, cooler_next) = match override_ {
            // An override goes straight to apply: the operator's forced
            // state for the target, the other actuator off.
            Some(o) => {
                let forced = if o.force_on {
                    SwitchState::On
                } else {
                    SwitchState::Off
                };
                match o.target {
                    ActuatorTarget::Heater => (forced, SwitchState::Off),
                    ActuatorTarget::Cooler => (SwitchState::Off, forced),
                }
            }
            None => {
                // 3. Delegate the decision to the configured strategy.
                let history = self
                    .db
                    .recent_batch_readings(batch.id, STRATEGY_HISTORY)
                    .await?;
                let ambient = self.hub.latest_ambient().map(|(t, _)| t);
                let (mut heater_desire, mut cooler_desire) = self
                    .strategy
                    .decide(&history, temp_c, target, hysteresis, ambient);

                // 4. Mutex on the raw desires. Impossible from hysteresis
                // with h > 0, but the strategy is pluggable.
                if heater_desire == Desire::On && cooler_desire == Desire::On {
                    warn!(
                        batch_id = batch.id,
                        "strategy asked for heater and cooler simultaneously; forcing both off"
                    );
                    heater_desire = Desire::Off;
                    cooler_desire = Desire::Off;
                }

                // 5. Dwell, bypassed on runaway.
                let runaway = (temp_c - target).abs() > 2.0 * hysteresis;
                let heater_next =
                    Self::resolve(heater_state, heater_desire, now, runaway, batch.id, "heater");
                let cooler_next =
                    Self::resolve(cooler_state, cooler_desire, now, runaway, batch.id, "cooler");

                // Post-dwell mutex: if suppression left one actuator on,
                // the other may not turn on this tick.
                if heater_next == SwitchState::On && cooler_next == SwitchState::On {
                    if heater_state.state == SwitchState::On {
                        debug!(batch_id = batch.id, "cooler start deferred while heater dwells");
                        (SwitchState::On, cooler_state.state)
                    } else {
                        debug!(batch_id = batch.id, "heater start deferred while cooler dwells");
                        (heater_state.state, SwitchState::On)
                    }
                } else {
                    (heater_next, cooler_next)
                }
            }
        };

        // 6-7. Apply offs before ons so the wire never sees both on, then
        // record successful transitions.
        if heater_next != SwitchState::On {
            self.apply(batch, ActuatorTarget::Heater, heater_next, heater_state, now)
                .await;
        }
        if cooler_next != SwitchState::On {
            self.apply(batch, ActuatorTarget::Cooler, cooler_next, cooler_state, now)
                .await;
        }
        if heater_next == SwitchState::On {
            self.apply(batch, ActuatorTarget::Heater, heater_next, heater_state, now)
                .await;
        }
        if cooler_next == SwitchState::On {
            self.apply(batch, ActuatorTarget::Cooler, cooler_next, cooler_state, now)
                .await;
        }

        Ok(())
    }

    /// Fold a desire into the actuator's next state, honoring dwell.
    fn resolve(
        record: CommandRecord,
        desire: Desire,
        now: DateTime<Utc>,
        runaway: bool,
        batch_id: i64,
        name: &str,
    ) -> SwitchState {
        let wanted = match desire {
            Desire::On => SwitchState::On,
            Desire::Off => SwitchState::Off,
            Desire::Unchanged => return record.state,
        };
        if wanted == record.state {
            return record.state;
        }
        // A transition out of Unknown has no dwell basis.
        if record.state != SwitchState::Unknown {
            if let Some(changed_at) = record.last_transition_at {
                if now - changed_at < DWELL && !runaway {
                    debug!(
                        batch_id,
                        actuator = name,
                        since_secs = (now - changed_at).num_seconds(),
                        "transition suppressed by dwell"
                    );
                    return record.state;
                }
            }
        }
        wanted
    }

    /// Send the command if the state changes; record only on success.
    async fn apply(
        &self,
        batch: &Batch,
        target: ActuatorTarget,
        next: SwitchState,
        current: CommandRecord,
        now: DateTime<Utc>,
    ) {
        if next == current.state || next == SwitchState::Unknown {
            return;
        }
        let entity = match target {
            ActuatorTarget::Heater => batch.heater_entity.as_deref(),
            ActuatorTarget::Cooler => batch.cooler_entity.as_deref(),
        };
        let Some(entity) = entity else {
            return;
        };

        match self.switch.set_state(entity, next == SwitchState::On).await {
            Ok(()) => {
                info!(batch_id = batch.id, entity, state = %next, "actuator commanded");
                let mut states = self.states.lock();
                let state = states.entry(batch.id).or_default();
                let record = match target {
                    ActuatorTarget::Heater => &mut state.heater,
                    ActuatorTarget::Cooler => &mut state.cooler,
                };
                record.state = next;
                record.last_transition_at = Some(now);
                drop(states);
                self.hub
                    .publish_actuator_state(batch.id, entity, next.as_str(), now);
            }
            Err(e) => {
                // Transient by policy: state is untouched and the next tick
                // retries.
                warn!(batch_id = batch.id, entity, "switch command failed: {e}");
            }
        }
    }

    /// Replace Unknown actuator states with a first successful read from
    /// the switch service.
    async fn seed_actuator_states(&self, batch: &Batch) {
        let needs_seed = {
            let states = self.states.lock();
            match states.get(&batch.id) {
                Some(s) => {
                    s.heater.state == SwitchState::Unknown
                        || s.cooler.state == SwitchState::Unknown
                }
                None => true,
            }
        };
        if !needs_seed {
            return;
        }
        let heater = match &batch.heater_entity {
            Some(entity) => self.switch.get_state(entity).await.ok(),
            None => None,
        };
        let cooler = match &batch.cooler_entity {
            Some(entity) => self.switch.get_state(entity).await.ok(),
            None => None,
        };
        let mut states = self.states.lock();
        let state = states.entry(batch.id).or_default();
        if state.heater.state == SwitchState::Unknown {
            if let Some(s) = heater {
                state.heater.state = s;
            }
        }
        if state.cooler.state == SwitchState::Unknown {
            if let Some(s) = cooler {
                state.cooler.state = s;
            }
        }
    }

    /// Drop state for batches that left the controllable set.
    fn prune_states(&self, active: &[i64]) {
        self.states.lock().retain(|id, _| active.contains(id));
    }

    /// Commanded states as seen by the controller, for the status API.
    pub fn actuator_states(&self, batch_id: i64) -> (SwitchState, SwitchState) {
        let states = self.states.lock();
        match states.get(&batch_id) {
            Some(s) => (s.heater.state, s.cooler.state),
            None => (SwitchState::Unknown, SwitchState::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BatchPatch, BatchStatus, NewReading, ReadingStatus};
    use crate::switch::mock::MockSwitch;
    use chrono::Duration as ChronoDuration;

    struct Rig {
        db: Arc<Database>,
        switch: Arc<MockSwitch>,
        controller: TempController,
        batch_id: i64,
    }

    async fn rig() -> Rig {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let hub = Arc::new(BroadcastHub::new());
        let switch = Arc::new(MockSwitch::new());
        let config = Arc::new(ConfigStore::load(db.clone()).await.unwrap());
        config
            .update(&crate::config::SettingsPatch {
                ha_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        db.upsert_device("tilt-red", "tilt", "SG", "F", Utc::now())
            .await
            .unwrap();
        let batch = db.create_batch(Some("tilt-red"), None, 1).await.unwrap();
        db.update_batch(
            batch.id,
            &BatchPatch {
                status: Some(BatchStatus::Fermenting),
                heater_entity: Some(Some("switch.heater".to_string())),
                cooler_entity: Some(Some("switch.cooler".to_string())),
                temp_target: Some(Some(20.0)),
                temp_hysteresis: Some(Some(0.5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let controller = TempController::new(db.clone(), switch.clone(), hub, config);
        Rig {
            db,
            switch,
            controller,
            batch_id: batch.id,
        }
    }

    async fn insert_temperature(db: &Database, temp_c: f64, at: DateTime<Utc>) {
        db.insert_reading(&NewReading {
            device_id: "tilt-red".to_string(),
            timestamp: at,
            gravity_raw: Some(1.050),
            gravity_calibrated: Some(1.050),
            gravity_filtered: Some(1.050),
            temperature_raw: Some(temp_c),
            temperature_calibrated: Some(temp_c),
            temperature_filtered: Some(temp_c),
            rssi: None,
            confidence: 0.9,
            gravity_rate: 0.0,
            temperature_rate: 0.0,
            is_anomaly: false,
            anomaly_score: 0.0,
            anomaly_reasons: String::new(),
            batch_id: None,
            status: ReadingStatus::Valid,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cold_batch_turns_heater_on() {
        let rig = rig().await;
        let now = Utc::now();
        insert_temperature(&rig.db, 19.3, now).await;

        rig.controller.tick(now).await;

        let commands = rig.switch.commands();
        assert!(commands.contains(&("switch.heater".to_string(), true)));
        assert!(!commands.contains(&("switch.cooler".to_string(), true)));
        let (heater, cooler) = rig.controller.actuator_states(rig.batch_id);
        assert_eq!(heater, SwitchState::On);
        assert_ne!(cooler, SwitchState::On);
    }

    #[tokio::test]
    async fn test_stale_reading_skips_decision() {
        let rig = rig().await;
        let now = Utc::now();
        insert_temperature(&rig.db, 19.3, now - ChronoDuration::minutes(10)).await;

        rig.controller.tick(now).await;
        assert!(rig.switch.commands().is_empty());
    }

    #[tokio::test]
    async fn test_inside_band_no_commands() {
        let rig = rig().await;
        let now = Utc::now();
        insert_temperature(&rig.db, 20.0, now).await;

        rig.controller.tick(now).await;
        assert!(rig.switch.commands().is_empty());
    }

    #[tokio::test]
    async fn test_dwell_suppresses_rapid_reversal() {
        let rig = rig().await;
        let t0 = Utc::now();

        // Cold: heater on.
        insert_temperature(&rig.db, 19.3, t0).await;
        rig.controller.tick(t0).await;
        assert_eq!(
            rig.controller.actuator_states(rig.batch_id).0,
            SwitchState::On
        );

        // Two minutes later the temperature overshoots past the band; the
        // heater-off (and therefore cooler-on) must wait out the dwell.
        let t1 = t0 + ChronoDuration::minutes(2);
        insert_temperature(&rig.db, 20.6, t1).await;
        rig.controller.tick(t1).await;
        let (heater, cooler) = rig.controller.actuator_states(rig.batch_id);
        assert_eq!(heater, SwitchState::On, "heater-off must dwell");
        assert_ne!(cooler, SwitchState::On, "cooler must wait for the heater");

        // Past the dwell the reversal proceeds.
        let t2 = t0 + ChronoDuration::minutes(5) + ChronoDuration::seconds(1);
        insert_temperature(&rig.db, 20.6, t2).await;
        rig.controller.tick(t2).await;
        let (heater, cooler) = rig.controller.actuator_states(rig.batch_id);
        assert_eq!(heater, SwitchState::Off);
        assert_eq!(cooler, SwitchState::On);
    }

    #[tokio::test]
    async fn test_runaway_bypasses_dwell() {
        let rig = rig().await;
        let t0 = Utc::now();

        insert_temperature(&rig.db, 19.3, t0).await;
        rig.controller.tick(t0).await;
        assert_eq!(
            rig.controller.actuator_states(rig.batch_id).0,
            SwitchState::On
        );

        // 1.2 °C above target is past 2·h = 1.0: dwell must not hold the
        // heater on while the wort overheats.
        let t1 = t0 + ChronoDuration::minutes(1);
        insert_temperature(&rig.db, 21.2, t1).await;
        rig.controller.tick(t1).await;
        let (heater, cooler) = rig.controller.actuator_states(rig.batch_id);
        assert_eq!(heater, SwitchState::Off);
        assert_eq!(cooler, SwitchState::On);
    }

    #[tokio::test]
    async fn test_mutual_exclusion_holds_across_run() {
        let rig = rig().await;
        let mut now = Utc::now();
        // Swing the temperature wildly; at no point may both be commanded
        // on after a tick.
        for temp in [18.0, 22.0, 18.0, 22.0, 20.0, 17.0, 23.0] {
            insert_temperature(&rig.db, temp, now).await;
            rig.controller.tick(now).await;
            let (heater, cooler) = rig.controller.actuator_states(rig.batch_id);
            assert!(
                !(heater == SwitchState::On && cooler == SwitchState::On),
                "mutex violated at {temp}°C"
            );
            now += ChronoDuration::minutes(6);
        }
    }

    #[tokio::test]
    async fn test_override_forces_target_and_other_off() {
        let rig = rig().await;
        let now = Utc::now();
        insert_temperature(&rig.db, 20.0, now).await;

        rig.controller.set_override(
            rig.batch_id,
            ControlOverride {
                target: ActuatorTarget::Cooler,
                force_on: true,
                expires_at: now + ChronoDuration::minutes(30),
            },
        );
        rig.controller.tick(now).await;
        let (heater, cooler) = rig.controller.actuator_states(rig.batch_id);
        assert_eq!(cooler, SwitchState::On);
        assert_ne!(heater, SwitchState::On);
    }

    #[tokio::test]
    async fn test_override_expires() {
        let rig = rig().await;
        let now = Utc::now();
        insert_temperature(&rig.db, 20.0, now).await;

        rig.controller.set_override(
            rig.batch_id,
            ControlOverride {
                target: ActuatorTarget::Heater,
                force_on: true,
                expires_at: now - ChronoDuration::seconds(1),
            },
        );
        rig.controller.tick(now).await;
        // Expired override: in-band temperature means no commands at all.
        assert_eq!(rig.controller.get_override(rig.batch_id), None);
        let (heater, _) = rig.controller.actuator_states(rig.batch_id);
        assert_ne!(heater, SwitchState::On);
    }

    #[tokio::test]
    async fn test_switch_failure_leaves_state_for_retry() {
        let rig = rig().await;
        let now = Utc::now();
        insert_temperature(&rig.db, 19.3, now).await;

        rig.switch.set_failing(true);
        rig.controller.tick(now).await;
        let (heater, _) = rig.controller.actuator_states(rig.batch_id);
        assert_ne!(heater, SwitchState::On);

        // Service recovers: the next tick retries and succeeds.
        rig.switch.set_failing(false);
        let later = now + ChronoDuration::seconds(30);
        insert_temperature(&rig.db, 19.3, later).await;
        rig.controller.tick(later).await;
        assert_eq!(
            rig.controller.actuator_states(rig.batch_id).0,
            SwitchState::On
        );
    }

    #[tokio::test]
    async fn test_safe_stop_turns_everything_off() {
        let rig = rig().await;
        let now = Utc::now();
        insert_temperature(&rig.db, 19.3, now).await;
        rig.controller.tick(now).await;

        rig.controller.safe_stop().await;
        let commands = rig.switch.commands();
        assert_eq!(commands.last(), Some(&("switch.cooler".to_string(), false)));
        assert!(commands.contains(&("switch.heater".to_string(), false)));
    }
}
