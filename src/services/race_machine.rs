//! Race lifecycle state machine
//!
//! Single writer for the current race and the history of finished races.
//! Every method handles exactly one input synchronously and returns the
//! outputs it committed, in order. The caller publishes them.
//!
//! ```text
//! Idle --load--> Loaded --both armed--> Ready --start--> Racing --> Finished
//!                                                          \------> Faulted
//! any --reset--> Idle
//! ```

use crate::domain::race::{LaneOutcome, Race, RaceResult, ReadingOutcome};
use crate::domain::types::{
    Command, GateKind, Lane, LaneEvent, LaneEventKind, LaneReading, RaceId, RaceState,
};
use crate::infra::config::TimingSettings;
use crate::services::clock::RaceClock;
use chrono::Utc;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Command not legal in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: cannot {command} while {state}")]
pub struct InvalidTransition {
    pub state: RaceState,
    pub command: Command,
}

/// Why an input was dropped without effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotRacing,
    NotLoaded,
    DuplicateStart,
    LaneResolved,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::NotRacing => "not_racing",
            IgnoreReason::NotLoaded => "not_loaded",
            IgnoreReason::DuplicateStart => "duplicate_start",
            IgnoreReason::LaneResolved => "lane_resolved",
        }
    }
}

/// Committed effect of one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutput {
    StateChanged { race_id: Option<RaceId>, from: RaceState, to: RaceState },
    /// A lane crossed its finish gate
    LaneFinished { race_id: RaceId, lane: Lane, time: Duration },
    /// Race finished; result is now immutable and in history
    Completed(RaceResult),
    /// Race exceeded the maximum duration with lanes still pending
    TimedOut { race_id: RaceId, unfinished: Vec<Lane> },
    /// Reading or signal had no effect
    Ignored { lane: Lane, reason: IgnoreReason },
}

pub struct RaceMachine {
    settings: TimingSettings,
    clock: RaceClock,
    state: RaceState,
    race: Option<Race>,
    next_id: u64,
    armed: [bool; 2],
    history: VecDeque<RaceResult>,
}

impl RaceMachine {
    pub fn new(settings: TimingSettings) -> Self {
        Self {
            settings,
            clock: RaceClock::new(),
            state: RaceState::Idle,
            race: None,
            next_id: 1,
            armed: [false; 2],
            history: VecDeque::with_capacity(settings.history_size),
        }
    }

    pub fn state(&self) -> RaceState {
        self.state
    }

    /// Race loaded, running or just ended; `None` when idle
    pub fn current(&self) -> Option<&Race> {
        self.race.as_ref()
    }

    /// Finished races, oldest first
    pub fn history(&self) -> &VecDeque<RaceResult> {
        &self.history
    }

    pub fn is_armed(&self, lane: Lane) -> bool {
        self.armed[lane.index()]
    }

    pub fn settings(&self) -> &TimingSettings {
        &self.settings
    }

    /// When the running race times out; `None` unless racing
    pub fn race_deadline(&self) -> Option<Instant> {
        if self.state != RaceState::Racing {
            return None;
        }
        self.clock.deadline(self.settings.max_race)
    }

    /// Legality of a command in the current state
    pub fn check(&self, command: Command) -> Result<(), InvalidTransition> {
        let legal = match command {
            Command::Load => {
                matches!(self.state, RaceState::Idle | RaceState::Finished | RaceState::Faulted)
            }
            Command::Start => self.state == RaceState::Ready,
            Command::Reset => true,
        };
        if legal {
            Ok(())
        } else {
            Err(InvalidTransition { state: self.state, command })
        }
    }

    /// Apply a command. `at` is the instant the hardware acknowledged it.
    pub fn apply(
        &mut self,
        command: Command,
        at: Instant,
    ) -> Result<Vec<RaceOutput>, InvalidTransition> {
        match command {
            Command::Load => self.load(),
            Command::Start => self.start(at),
            Command::Reset => Ok(self.reset()),
        }
    }

    /// Allocate a new race; legal from Idle or a terminal state
    pub fn load(&mut self) -> Result<Vec<RaceOutput>, InvalidTransition> {
        self.check(Command::Load)?;

        let id = RaceId(self.next_id);
        self.next_id += 1;
        self.armed = [false; 2];
        self.clock.clear();
        self.race = Some(Race::new(id));

        info!(race_id = %id, "race_loaded");
        let mut out = Vec::with_capacity(1);
        self.transition(RaceState::Loaded, &mut out);
        Ok(out)
    }

    /// Zero the clock at `at` and start racing; legal only from Ready
    pub fn start(&mut self, at: Instant) -> Result<Vec<RaceOutput>, InvalidTransition> {
        self.check(Command::Start)?;

        self.clock.zero_at(at);
        if let Some(race) = self.race.as_mut() {
            race.started_at = Some(Utc::now());
            info!(race_id = %race.id, max_race_ms = %self.settings.max_race.as_millis(), "race_started");
        }
        let mut out = Vec::with_capacity(1);
        self.transition(RaceState::Racing, &mut out);
        Ok(out)
    }

    /// Force Idle from any state; an unfinished race is discarded
    pub fn reset(&mut self) -> Vec<RaceOutput> {
        let mut out = Vec::new();
        if let Some(race) = self.race.take() {
            if race.state != RaceState::Finished {
                info!(race_id = %race.id, state = %race.state, "race_discarded");
            }
        }
        self.armed = [false; 2];
        self.clock.clear();
        if self.state != RaceState::Idle {
            let from = self.state;
            self.state = RaceState::Idle;
            out.push(RaceOutput::StateChanged { race_id: None, from, to: RaceState::Idle });
        }
        out
    }

    /// Feed one normalized sensor signal
    pub fn handle_lane_event(&mut self, event: &LaneEvent) -> Vec<RaceOutput> {
        let mut out = Vec::new();
        match &event.kind {
            LaneEventKind::Armed => self.on_armed(event.lane, &mut out),
            LaneEventKind::Trigger(gate) => {
                self.on_trigger(event.lane, *gate, event.timestamp, &mut out)
            }
            LaneEventKind::Fault(reason) => self.on_fault(event.lane, reason, &mut out),
            // Health is tracked by the sensor gate; the lifecycle does not change
            LaneEventKind::Recovered => {}
        }
        out
    }

    /// Finish a race that ran past its deadline
    pub fn expire(&mut self, now: Instant) -> Vec<RaceOutput> {
        let mut out = Vec::new();
        let Some(deadline) = self.race_deadline() else {
            return out;
        };
        if now < deadline {
            return out;
        }
        let Some(race) = self.race.as_mut() else {
            return out;
        };

        let mut unfinished = Vec::new();
        for lane in Lane::ALL {
            let record = race.lane_mut(lane);
            if !record.outcome.is_resolved() {
                record.outcome = LaneOutcome::DidNotFinish;
                unfinished.push(lane);
            }
        }
        warn!(race_id = %race.id, unfinished = ?unfinished, "race_timed_out");
        out.push(RaceOutput::TimedOut { race_id: race.id, unfinished });
        self.finish(&mut out);
        out
    }

    fn on_armed(&mut self, lane: Lane, out: &mut Vec<RaceOutput>) {
        match self.state {
            RaceState::Loaded => {
                self.armed[lane.index()] = true;
                debug!(lane = %lane, "lane_armed");
                if self.armed.iter().all(|a| *a) {
                    self.transition(RaceState::Ready, out);
                }
            }
            RaceState::Ready => {}
            _ => out.push(RaceOutput::Ignored { lane, reason: IgnoreReason::NotLoaded }),
        }
    }

    fn on_trigger(&mut self, lane: Lane, gate: GateKind, at: Instant, out: &mut Vec<RaceOutput>) {
        if self.state != RaceState::Racing {
            out.push(RaceOutput::Ignored { lane, reason: IgnoreReason::NotRacing });
            return;
        }
        let Some(race) = self.race.as_mut() else {
            return;
        };

        let reading = LaneReading { lane, at: self.clock.since_zero(at), source: gate };
        match race.lane_mut(lane).record(reading) {
            ReadingOutcome::StartRecorded => {
                debug!(race_id = %race.id, lane = %lane, at_us = %reading.at.as_micros(), "lane_start_recorded");
            }
            ReadingOutcome::DuplicateStart => {
                out.push(RaceOutput::Ignored { lane, reason: IgnoreReason::DuplicateStart });
            }
            ReadingOutcome::Rejected => {
                out.push(RaceOutput::Ignored { lane, reason: IgnoreReason::LaneResolved });
            }
            ReadingOutcome::Finished(time) => {
                info!(race_id = %race.id, lane = %lane, time_us = %time.as_micros(), "lane_finished");
                out.push(RaceOutput::LaneFinished { race_id: race.id, lane, time });
                if race.all_resolved() {
                    self.finish(out);
                }
            }
        }
    }

    fn on_fault(&mut self, lane: Lane, reason: &str, out: &mut Vec<RaceOutput>) {
        if self.state != RaceState::Racing {
            return;
        }
        if let Some(race) = self.race.as_mut() {
            race.fault = Some(format!("{}: {}", lane, reason));
            warn!(race_id = %race.id, lane = %lane, reason = %reason, "race_faulted");
        }
        self.transition(RaceState::Faulted, out);
    }

    fn finish(&mut self, out: &mut Vec<RaceOutput>) {
        let tolerance = self.settings.tie_tolerance;
        let Some(race) = self.race.as_mut() else {
            return;
        };
        let Some(winner) = race.compute_winner(tolerance) else {
            return;
        };
        race.winner = winner;
        race.finished_at = Some(Utc::now());
        race.state = RaceState::Finished;

        if let Some(result) = race.to_result() {
            info!(
                race_id = %result.race_id,
                car1_time_ms = ?result.car1_time_ms,
                car2_time_ms = ?result.car2_time_ms,
                winner = %result.winner.as_str(),
                "race_completed"
            );
            if self.settings.history_size > 0 {
                while self.history.len() >= self.settings.history_size {
                    self.history.pop_front();
                }
                self.history.push_back(result.clone());
            }
            out.push(RaceOutput::Completed(result));
        }
        self.transition(RaceState::Finished, out);
    }

    fn transition(&mut self, to: RaceState, out: &mut Vec<RaceOutput>) {
        let from = self.state;
        self.state = to;
        let race_id = self.race.as_mut().map(|race| {
            race.state = to;
            race.id
        });
        debug!(from = %from, to = %to, "race_state_changed");
        out.push(RaceOutput::StateChanged { race_id, from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Winner;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn machine() -> RaceMachine {
        RaceMachine::new(TimingSettings::default())
    }

    fn event(lane: Lane, kind: LaneEventKind, at: Instant) -> LaneEvent {
        LaneEvent { lane, timestamp: at, kind }
    }

    fn arm_both(m: &mut RaceMachine) {
        let now = Instant::now();
        m.handle_lane_event(&event(Lane::Lane1, LaneEventKind::Armed, now));
        m.handle_lane_event(&event(Lane::Lane2, LaneEventKind::Armed, now));
    }

    /// Machine in Racing with time zero at the returned instant
    fn racing() -> (RaceMachine, Instant) {
        let mut m = machine();
        m.load().unwrap();
        arm_both(&mut m);
        let t0 = Instant::now();
        m.start(t0).unwrap();
        (m, t0)
    }

    fn finish(m: &mut RaceMachine, lane: Lane, at: Instant) -> Vec<RaceOutput> {
        m.handle_lane_event(&event(lane, LaneEventKind::Trigger(GateKind::Finish), at))
    }

    fn completed(out: &[RaceOutput]) -> Option<&RaceResult> {
        out.iter().find_map(|o| match o {
            RaceOutput::Completed(r) => Some(r),
            _ => None,
        })
    }

    #[test]
    fn test_load_allocates_monotonic_ids() {
        let mut m = machine();
        m.load().unwrap();
        assert_eq!(m.current().unwrap().id, RaceId(1));
        m.reset();
        m.load().unwrap();
        assert_eq!(m.current().unwrap().id, RaceId(2));
    }

    #[test]
    fn test_ready_requires_both_lanes_armed() {
        let mut m = machine();
        m.load().unwrap();
        let now = Instant::now();

        m.handle_lane_event(&event(Lane::Lane1, LaneEventKind::Armed, now));
        assert_eq!(m.state(), RaceState::Loaded);
        assert_eq!(m.check(Command::Start), Err(InvalidTransition {
            state: RaceState::Loaded,
            command: Command::Start
        }));

        let out = m.handle_lane_event(&event(Lane::Lane2, LaneEventKind::Armed, now));
        assert_eq!(m.state(), RaceState::Ready);
        assert_eq!(
            out,
            vec![RaceOutput::StateChanged {
                race_id: Some(RaceId(1)),
                from: RaceState::Loaded,
                to: RaceState::Ready
            }]
        );
        m.start(now).unwrap();
        assert_eq!(m.state(), RaceState::Racing);
    }

    #[test]
    fn test_armed_before_load_does_not_count() {
        let mut m = machine();
        arm_both(&mut m);
        m.load().unwrap();
        assert_eq!(m.state(), RaceState::Loaded);
        assert!(!m.is_armed(Lane::Lane1));
    }

    #[test]
    fn test_start_from_idle_is_invalid() {
        let mut m = machine();
        let err = m.start(Instant::now()).unwrap_err();
        assert_eq!(err.state, RaceState::Idle);
        assert_eq!(err.command, Command::Start);
        assert_eq!(m.state(), RaceState::Idle);
        assert_eq!(err.to_string(), "invalid transition: cannot start while idle");
    }

    #[test]
    fn test_load_while_racing_is_invalid() {
        let (mut m, _) = racing();
        assert!(m.load().is_err());
        assert_eq!(m.state(), RaceState::Racing);
    }

    #[test]
    fn test_winner_lane1() {
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane1, t0 + ms(2345));
        let out = finish(&mut m, Lane::Lane2, t0 + ms(2400));

        let result = completed(&out).unwrap();
        assert_eq!(result.winner, Winner::Lane1);
        assert_eq!(result.car1_time_ms, Some(2345));
        assert_eq!(result.car2_time_ms, Some(2400));
        assert_eq!(m.state(), RaceState::Finished);
    }

    #[test]
    fn test_tie_within_one_ms() {
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane2, t0 + ms(2346));
        let out = finish(&mut m, Lane::Lane1, t0 + ms(2345));
        assert_eq!(completed(&out).unwrap().winner, Winner::Tie);
    }

    #[test]
    fn test_lane_time_measured_from_start_reading() {
        let (mut m, t0) = racing();
        m.handle_lane_event(&event(Lane::Lane1, LaneEventKind::Trigger(GateKind::Start), t0 + ms(3)));
        let out = finish(&mut m, Lane::Lane1, t0 + ms(1503));
        assert!(out.contains(&RaceOutput::LaneFinished {
            race_id: RaceId(1),
            lane: Lane::Lane1,
            time: ms(1500)
        }));
    }

    #[test]
    fn test_duplicate_start_does_not_alter_time() {
        let (mut m, t0) = racing();
        let start = LaneEventKind::Trigger(GateKind::Start);
        m.handle_lane_event(&event(Lane::Lane1, start.clone(), t0 + ms(1)));
        let out = m.handle_lane_event(&event(Lane::Lane1, start, t0 + ms(20)));

        assert_eq!(
            out,
            vec![RaceOutput::Ignored { lane: Lane::Lane1, reason: IgnoreReason::DuplicateStart }]
        );
        assert_eq!(m.current().unwrap().lane(Lane::Lane1).start.unwrap().at, ms(1));
    }

    #[test]
    fn test_extra_finish_rejected() {
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane1, t0 + ms(1000));
        let out = finish(&mut m, Lane::Lane1, t0 + ms(1200));
        assert_eq!(
            out,
            vec![RaceOutput::Ignored { lane: Lane::Lane1, reason: IgnoreReason::LaneResolved }]
        );
        assert_eq!(m.current().unwrap().lane_time(Lane::Lane1), Some(ms(1000)));
        assert_eq!(m.state(), RaceState::Racing);
    }

    #[test]
    fn test_fault_during_racing_is_terminal() {
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane1, t0 + ms(1000));
        let out = m.handle_lane_event(&event(
            Lane::Lane2,
            LaneEventKind::Fault("i2c timeout".to_string()),
            t0 + ms(1100),
        ));

        assert_eq!(m.state(), RaceState::Faulted);
        assert!(completed(&out).is_none());
        let race = m.current().unwrap();
        assert_eq!(race.winner, Winner::Unresolved);
        assert_eq!(race.lane_time(Lane::Lane1), Some(ms(1000)));
        assert!(m.history().is_empty());

        // Further finishes do not revive it
        let out = finish(&mut m, Lane::Lane2, t0 + ms(1200));
        assert_eq!(out, vec![RaceOutput::Ignored { lane: Lane::Lane2, reason: IgnoreReason::NotRacing }]);
        assert_eq!(m.state(), RaceState::Faulted);
    }

    #[test]
    fn test_fault_outside_race_keeps_state() {
        let mut m = machine();
        m.load().unwrap();
        let out = m.handle_lane_event(&event(
            Lane::Lane1,
            LaneEventKind::Fault("disconnected".to_string()),
            Instant::now(),
        ));
        assert!(out.is_empty());
        assert_eq!(m.state(), RaceState::Loaded);
    }

    #[test]
    fn test_reset_from_every_state() {
        // Idle
        let mut m = machine();
        assert!(m.reset().is_empty());
        assert_eq!(m.state(), RaceState::Idle);

        // Loaded
        let mut m = machine();
        m.load().unwrap();
        m.reset();
        assert_eq!(m.state(), RaceState::Idle);
        assert!(m.current().is_none());

        // Racing: discarded, not in history
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane1, t0 + ms(900));
        let out = m.reset();
        assert_eq!(
            out,
            vec![RaceOutput::StateChanged {
                race_id: None,
                from: RaceState::Racing,
                to: RaceState::Idle
            }]
        );
        assert!(m.current().is_none());
        assert!(m.history().is_empty());
        assert!(m.race_deadline().is_none());

        // Finished: stays in history
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane1, t0 + ms(900));
        finish(&mut m, Lane::Lane2, t0 + ms(950));
        m.reset();
        assert_eq!(m.state(), RaceState::Idle);
        assert_eq!(m.history().len(), 1);
    }

    #[test]
    fn test_load_after_finish_starts_fresh() {
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane1, t0 + ms(900));
        finish(&mut m, Lane::Lane2, t0 + ms(950));
        m.load().unwrap();
        let race = m.current().unwrap();
        assert_eq!(race.id, RaceId(2));
        assert_eq!(race.lane(Lane::Lane1).finish, None);
        assert_eq!(m.state(), RaceState::Loaded);
    }

    #[test]
    fn test_timeout_marks_unfinished_lanes() {
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane2, t0 + ms(3000));
        assert!(m.expire(t0 + ms(9999)).is_empty());

        let out = m.expire(t0 + ms(10_000));
        assert_eq!(
            out[0],
            RaceOutput::TimedOut { race_id: RaceId(1), unfinished: vec![Lane::Lane1] }
        );
        let result = completed(&out).unwrap();
        assert_eq!(result.winner, Winner::Lane2);
        assert_eq!(result.car1_time_ms, None);
        assert_eq!(m.state(), RaceState::Finished);
    }

    #[test]
    fn test_timeout_with_no_finishers_is_unresolved() {
        let (mut m, t0) = racing();
        let out = m.expire(t0 + ms(10_000));
        assert_eq!(completed(&out).unwrap().winner, Winner::Unresolved);
    }

    #[test]
    fn test_history_is_bounded() {
        let settings = TimingSettings { history_size: 2, ..TimingSettings::default() };
        let mut m = RaceMachine::new(settings);
        for _ in 0..3 {
            m.load().unwrap();
            arm_both(&mut m);
            let t0 = Instant::now();
            m.start(t0).unwrap();
            finish(&mut m, Lane::Lane1, t0 + ms(1000));
            finish(&mut m, Lane::Lane2, t0 + ms(1100));
        }
        let ids: Vec<u64> = m.history().iter().map(|r| r.race_id.0).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_completed_precedes_finished_state() {
        let (mut m, t0) = racing();
        finish(&mut m, Lane::Lane1, t0 + ms(1000));
        let out = finish(&mut m, Lane::Lane2, t0 + ms(1100));
        assert!(matches!(out[0], RaceOutput::LaneFinished { lane: Lane::Lane2, .. }));
        assert!(matches!(out[1], RaceOutput::Completed(_)));
        assert!(matches!(out[2], RaceOutput::StateChanged { to: RaceState::Finished, .. }));
    }
}
