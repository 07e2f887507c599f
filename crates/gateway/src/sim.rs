//! Simulated flight controller
//!
//! A software-in-the-loop stand-in for a real autopilot: straight-line
//! kinematics at a fixed speed, battery drain while armed, a home position
//! for return-to-launch and a small payload magazine. Faults (slow links,
//! transient failures, refusals, dropped links) can be injected so the
//! gateway and the fleet engine can be exercised without hardware.
//!
//! Time is read from `tokio::time`, so paused-clock tests fly missions in
//! virtual time.

use aerotask_core::geo::METERS_PER_DEGREE_LAT;
use aerotask_core::{now_ns, Coordinate, FlightMode, GpsFix, LinkHealth, TelemetrySnapshot};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::command::FlightCommand;
use crate::error::LinkError;
use crate::link::FlightLink;

/// Initial simulator settings
#[derive(Debug, Clone)]
pub struct SimSettings {
    /// Launch point
    pub home: Coordinate,
    /// Cruise, climb and descent speed
    pub speed_m_s: f64,
    /// Starting battery
    pub battery_pct: f64,
    /// Battery drain while armed
    pub drain_pct_per_s: f64,
    /// Payload items loaded
    pub payload_count: u32,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            home: Coordinate::new(47.397742, 8.545594, 0.0),
            speed_m_s: 10.0,
            battery_pct: 100.0,
            drain_pct_per_s: 0.02,
            payload_count: 5,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    command_delay: Option<Duration>,
    query_delay: Option<Duration>,
    failing_commands: u32,
    failing_queries: u32,
    reject_reason: Option<String>,
    link_down: bool,
}

#[derive(Debug)]
struct SimState {
    position: Coordinate,
    home: Coordinate,
    target: Option<Coordinate>,
    armed: bool,
    mode: FlightMode,
    battery_pct: f64,
    gps_fix: GpsFix,
    link_health: LinkHealth,
    payloads: u32,
    captures: u32,
    releases: u32,
    last_tick: Instant,
    last_timestamp_ns: u64,
    log: Vec<FlightCommand>,
}

/// In-process simulated vehicle
pub struct SimLink {
    name: String,
    speed_m_s: f64,
    drain_pct_per_s: f64,
    state: Mutex<SimState>,
    faults: Mutex<Faults>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned simulator is still a usable simulator.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimLink {
    /// Create a vehicle parked and disarmed at `settings.home`
    pub fn new(name: impl Into<String>, settings: SimSettings) -> Self {
        let home = settings.home.with_alt(0.0);
        Self {
            name: name.into(),
            speed_m_s: settings.speed_m_s.max(0.1),
            drain_pct_per_s: settings.drain_pct_per_s.max(0.0),
            state: Mutex::new(SimState {
                position: home,
                home,
                target: None,
                armed: false,
                mode: FlightMode::Hold,
                battery_pct: settings.battery_pct.clamp(0.0, 100.0),
                gps_fix: GpsFix::Fix3d,
                link_health: LinkHealth::Healthy,
                payloads: settings.payload_count,
                captures: 0,
                releases: 0,
                last_tick: Instant::now(),
                last_timestamp_ns: 0,
                log: Vec::new(),
            }),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Simulated vehicle at `home` with default performance
    pub fn at(name: impl Into<String>, home: Coordinate) -> Self {
        Self::new(
            name,
            SimSettings {
                home,
                ..SimSettings::default()
            },
        )
    }

    fn advance(&self, state: &mut SimState) {
        let now = Instant::now();
        let dt = now.saturating_duration_since(state.last_tick).as_secs_f64();
        state.last_tick = now;
        if dt <= 0.0 {
            return;
        }

        if state.armed {
            state.battery_pct = (state.battery_pct - self.drain_pct_per_s * dt).max(0.0);
        }

        let Some(target) = state.target else {
            return;
        };
        let p = state.position;
        let north = (target.lat - p.lat) * METERS_PER_DEGREE_LAT;
        let east = (target.lon - p.lon) * METERS_PER_DEGREE_LAT * p.lat.to_radians().cos();
        let up = target.alt - p.alt;
        let remaining = (north * north + east * east + up * up).sqrt();
        let step = self.speed_m_s * dt;

        if remaining <= step {
            state.position = target;
            state.target = None;
            match state.mode {
                FlightMode::Takeoff => state.mode = FlightMode::Hold,
                FlightMode::Land | FlightMode::ReturnToLaunch => {
                    state.position.alt = 0.0;
                    state.armed = false;
                    state.mode = FlightMode::Hold;
                }
                _ => {}
            }
        } else {
            let frac = step / remaining;
            state.position = Coordinate::new(
                p.lat + (target.lat - p.lat) * frac,
                p.lon + (target.lon - p.lon) * frac,
                p.alt + up * frac,
            );
        }
    }

    fn apply(&self, state: &mut SimState, command: &FlightCommand) -> Result<(), LinkError> {
        let airborne = state.position.alt > TelemetrySnapshot::AIRBORNE_ALT_M;
        match command {
            FlightCommand::Arm => {
                if state.battery_pct <= 0.0 {
                    return Err(LinkError::Rejected("battery depleted".into()));
                }
                state.armed = true;
            }
            FlightCommand::Disarm => {
                if airborne {
                    return Err(LinkError::Rejected("cannot disarm in flight".into()));
                }
                state.armed = false;
            }
            FlightCommand::SetMode { mode } => match mode {
                FlightMode::ReturnToLaunch => return self.apply(state, &FlightCommand::ReturnToLaunch),
                FlightMode::Land => return self.apply(state, &FlightCommand::Land),
                FlightMode::Hold => {
                    state.target = None;
                    state.mode = FlightMode::Hold;
                }
                other => state.mode = *other,
            },
            FlightCommand::Goto { waypoint } => {
                if !state.armed {
                    return Err(LinkError::Rejected("not armed".into()));
                }
                state.mode = FlightMode::Guided;
                state.target = Some(*waypoint);
            }
            FlightCommand::Takeoff { altitude_m } => {
                if !state.armed {
                    return Err(LinkError::Rejected("not armed".into()));
                }
                state.mode = FlightMode::Takeoff;
                state.target = Some(state.position.with_alt(*altitude_m));
            }
            FlightCommand::Land => {
                state.mode = FlightMode::Land;
                state.target = Some(state.position.with_alt(0.0));
            }
            FlightCommand::ReturnToLaunch => {
                if airborne {
                    state.mode = FlightMode::ReturnToLaunch;
                    state.target = Some(state.home);
                } else {
                    state.target = None;
                    state.armed = false;
                    state.mode = FlightMode::Hold;
                }
            }
            FlightCommand::Capture => state.captures += 1,
            FlightCommand::ReleasePayload => {
                if state.payloads == 0 {
                    return Err(LinkError::Rejected("payload bay empty".into()));
                }
                state.payloads -= 1;
                state.releases += 1;
            }
        }
        Ok(())
    }

    fn snapshot(&self, state: &mut SimState) -> TelemetrySnapshot {
        let timestamp_ns = now_ns().max(state.last_timestamp_ns + 1);
        state.last_timestamp_ns = timestamp_ns;
        TelemetrySnapshot {
            position: state.position,
            battery_pct: state.battery_pct,
            armed: state.armed,
            mode: state.mode,
            gps_fix: state.gps_fix,
            link_health: state.link_health,
            timestamp_ns,
        }
    }

    /// Simulator instance name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state without going through fault injection
    pub fn peek(&self) -> TelemetrySnapshot {
        let mut state = lock(&self.state);
        self.advance(&mut state);
        self.snapshot(&mut state)
    }

    /// Every command that reached the link, in order
    pub fn commands(&self) -> Vec<FlightCommand> {
        lock(&self.state).log.clone()
    }

    /// Number of commands that reached the link
    pub fn command_count(&self) -> usize {
        lock(&self.state).log.len()
    }

    /// Camera triggers performed
    pub fn captures(&self) -> u32 {
        lock(&self.state).captures
    }

    /// Payload items released
    pub fn releases(&self) -> u32 {
        lock(&self.state).releases
    }

    /// Override the battery level
    pub fn set_battery(&self, pct: f64) {
        lock(&self.state).battery_pct = pct.clamp(0.0, 100.0);
    }

    /// Override the GPS fix quality
    pub fn set_gps_fix(&self, fix: GpsFix) {
        lock(&self.state).gps_fix = fix;
    }

    /// Override the reported link health
    pub fn set_link_health(&self, health: LinkHealth) {
        lock(&self.state).link_health = health;
    }

    /// Move the vehicle instantly
    pub fn teleport(&self, position: Coordinate) {
        let mut state = lock(&self.state);
        state.position = position;
    }

    /// Delay every command by `delay`
    pub fn set_command_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).command_delay = delay;
    }

    /// Delay every state query by `delay`
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).query_delay = delay;
    }

    /// Fail the next `n` commands with a transient error
    pub fn fail_next_commands(&self, n: u32) {
        lock(&self.faults).failing_commands = n;
    }

    /// Fail the next `n` queries with a transient error
    pub fn fail_next_queries(&self, n: u32) {
        lock(&self.faults).failing_queries = n;
    }

    /// Refuse every command with `reason` until cleared
    pub fn reject_commands(&self, reason: Option<String>) {
        lock(&self.faults).reject_reason = reason;
    }

    /// Take the link down; requests fail until [`SimLink::restore_link`]
    pub fn drop_link(&self) {
        lock(&self.faults).link_down = true;
    }

    /// Bring a dropped link back; the next reconnect succeeds
    pub fn restore_link(&self) {
        lock(&self.faults).link_down = false;
    }
}

#[async_trait]
impl FlightLink for SimLink {
    fn endpoint(&self) -> String {
        format!("sim://{}", self.name)
    }

    async fn send(&self, command: &FlightCommand) -> Result<(), LinkError> {
        lock(&self.state).log.push(command.clone());

        let delay = lock(&self.faults).command_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut faults = lock(&self.faults);
            if faults.link_down {
                return Err(LinkError::Closed);
            }
            if faults.failing_commands > 0 {
                faults.failing_commands -= 1;
                return Err(LinkError::Transient("injected command failure".into()));
            }
            if let Some(reason) = &faults.reject_reason {
                return Err(LinkError::Rejected(reason.clone()));
            }
        }

        let mut state = lock(&self.state);
        self.advance(&mut state);
        let result = self.apply(&mut state, command);
        debug!(sim = %self.name, command = command.name(), ok = result.is_ok(), "sim command");
        result
    }

    async fn query_state(&self) -> Result<TelemetrySnapshot, LinkError> {
        let delay = lock(&self.faults).query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut faults = lock(&self.faults);
            if faults.link_down {
                return Err(LinkError::Closed);
            }
            if faults.failing_queries > 0 {
                faults.failing_queries -= 1;
                return Err(LinkError::Transient("injected query failure".into()));
            }
        }

        let mut state = lock(&self.state);
        self.advance(&mut state);
        Ok(self.snapshot(&mut state))
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        if lock(&self.faults).link_down {
            Err(LinkError::Closed)
        } else {
            Ok(())
        }
    }
}
