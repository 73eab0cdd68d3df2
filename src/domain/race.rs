//! Race data model: lane readings, outcomes and finished results

use crate::domain::types::{duration_ms, GateKind, Lane, LaneReading, RaceId, RaceState, Winner};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Finish-side outcome of a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaneOutcome {
    #[default]
    Pending,
    /// Lane time (finish reading minus start reading)
    Finished(Duration),
    /// Race timed out before the finish gate fired
    DidNotFinish,
}

impl LaneOutcome {
    #[inline]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, LaneOutcome::Pending)
    }

    #[inline]
    pub fn time(&self) -> Option<Duration> {
        match self {
            LaneOutcome::Finished(t) => Some(*t),
            _ => None,
        }
    }
}

/// Readings for one lane of the current race
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaneRecord {
    pub start: Option<LaneReading>,
    pub finish: Option<LaneReading>,
    pub outcome: LaneOutcome,
}

/// Result of offering a reading to a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingOutcome {
    /// Start reading stored
    StartRecorded,
    /// Start reading already present, new one ignored
    DuplicateStart,
    /// Finish stored, lane time computed
    Finished(Duration),
    /// Lane already resolved, reading rejected
    Rejected,
}

impl LaneRecord {
    /// Record a reading. Start is write-once; finish resolves the lane.
    ///
    /// A finish without a prior start reading implies a start at time zero.
    pub fn record(&mut self, reading: LaneReading) -> ReadingOutcome {
        if self.outcome.is_resolved() {
            return ReadingOutcome::Rejected;
        }
        match reading.source {
            GateKind::Start => {
                if self.start.is_some() {
                    return ReadingOutcome::DuplicateStart;
                }
                self.start = Some(reading);
                ReadingOutcome::StartRecorded
            }
            GateKind::Finish => {
                let start = *self.start.get_or_insert(LaneReading {
                    lane: reading.lane,
                    at: Duration::ZERO,
                    source: GateKind::Start,
                });
                let time = reading.at.saturating_sub(start.at);
                self.finish = Some(reading);
                self.outcome = LaneOutcome::Finished(time);
                ReadingOutcome::Finished(time)
            }
        }
    }
}

/// The race currently owned by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Race {
    pub id: RaceId,
    pub state: RaceState,
    pub lanes: [LaneRecord; 2],
    pub winner: Winner,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Fault reason if the race ended in `Faulted`
    pub fault: Option<String>,
}

impl Race {
    pub fn new(id: RaceId) -> Self {
        Self {
            id,
            state: RaceState::Loaded,
            lanes: Default::default(),
            winner: Winner::Unresolved,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            fault: None,
        }
    }

    #[inline]
    pub fn lane(&self, lane: Lane) -> &LaneRecord {
        &self.lanes[lane.index()]
    }

    #[inline]
    pub fn lane_mut(&mut self, lane: Lane) -> &mut LaneRecord {
        &mut self.lanes[lane.index()]
    }

    pub fn lane_time(&self, lane: Lane) -> Option<Duration> {
        self.lane(lane).outcome.time()
    }

    /// Both lanes resolved (finished or DNF)
    pub fn all_resolved(&self) -> bool {
        self.lanes.iter().all(|l| l.outcome.is_resolved())
    }

    /// Winner, or `None` while a lane is still pending
    pub fn compute_winner(&self, tie_tolerance: Duration) -> Option<Winner> {
        if !self.all_resolved() {
            return None;
        }
        Some(decide_winner(self.lane_time(Lane::Lane1), self.lane_time(Lane::Lane2), tie_tolerance))
    }

    /// Immutable result record; only valid once finished
    pub fn to_result(&self) -> Option<RaceResult> {
        if self.state != RaceState::Finished {
            return None;
        }
        Some(RaceResult {
            race_id: self.id,
            car1_time_ms: self.lane_time(Lane::Lane1).map(duration_ms),
            car2_time_ms: self.lane_time(Lane::Lane2).map(duration_ms),
            car1_time_us: self.lane_time(Lane::Lane1).map(|t| t.as_micros() as u64),
            car2_time_us: self.lane_time(Lane::Lane2).map(|t| t.as_micros() as u64),
            winner: self.winner,
            created_at: self.created_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Compare two lane times. Missing time means the lane did not finish.
///
/// `|t1 - t2| <= tolerance` is a tie; otherwise the strictly lower time wins.
pub fn decide_winner(t1: Option<Duration>, t2: Option<Duration>, tolerance: Duration) -> Winner {
    match (t1, t2) {
        (Some(a), Some(b)) => {
            let diff = if a > b { a - b } else { b - a };
            if diff <= tolerance {
                Winner::Tie
            } else if a < b {
                Winner::Lane1
            } else {
                Winner::Lane2
            }
        }
        (Some(_), None) => Winner::Lane1,
        (None, Some(_)) => Winner::Lane2,
        (None, None) => Winner::Unresolved,
    }
}

/// Finished race as kept in history and sent to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceResult {
    pub race_id: RaceId,
    /// `None` when the lane did not finish
    pub car1_time_ms: Option<u64>,
    pub car2_time_ms: Option<u64>,
    pub car1_time_us: Option<u64>,
    pub car2_time_us: Option<u64>,
    pub winner: Winner,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Read-only view of one lane for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneView {
    pub start_us: Option<u64>,
    pub finish_us: Option<u64>,
    pub time_ms: Option<u64>,
    /// "pending", "finished" or "dnf"
    pub outcome: &'static str,
}

impl From<&LaneRecord> for LaneView {
    fn from(record: &LaneRecord) -> Self {
        Self {
            start_us: record.start.map(|r| r.at.as_micros() as u64),
            finish_us: record.finish.map(|r| r.at.as_micros() as u64),
            time_ms: record.outcome.time().map(duration_ms),
            outcome: match record.outcome {
                LaneOutcome::Pending => "pending",
                LaneOutcome::Finished(_) => "finished",
                LaneOutcome::DidNotFinish => "dnf",
            },
        }
    }
}

/// Read-only view of the current race
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceView {
    pub race_id: RaceId,
    pub state: RaceState,
    pub lane1: LaneView,
    pub lane2: LaneView,
    pub winner: Winner,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl From<&Race> for RaceView {
    fn from(race: &Race) -> Self {
        Self {
            race_id: race.id,
            state: race.state,
            lane1: race.lane(Lane::Lane1).into(),
            lane2: race.lane(Lane::Lane2).into(),
            winner: race.winner,
            created_at: race.created_at,
            started_at: race.started_at,
            finished_at: race.finished_at,
            fault: race.fault.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn reading(lane: Lane, at: Duration, source: GateKind) -> LaneReading {
        LaneReading { lane, at, source }
    }

    #[test]
    fn test_tie_within_tolerance() {
        assert_eq!(decide_winner(Some(ms(2345)), Some(ms(2346)), ms(1)), Winner::Tie);
        assert_eq!(decide_winner(Some(ms(2345)), Some(ms(2345)), ms(1)), Winner::Tie);
    }

    #[test]
    fn test_lower_time_wins() {
        assert_eq!(decide_winner(Some(ms(2345)), Some(ms(2400)), ms(1)), Winner::Lane1);
        assert_eq!(decide_winner(Some(ms(2400)), Some(ms(2345)), ms(1)), Winner::Lane2);
        // Just outside tolerance
        assert_eq!(
            decide_winner(Some(ms(2345)), Some(ms(2346) + Duration::from_micros(1)), ms(1)),
            Winner::Lane1
        );
    }

    #[test]
    fn test_did_not_finish() {
        assert_eq!(decide_winner(None, Some(ms(3000)), ms(1)), Winner::Lane2);
        assert_eq!(decide_winner(Some(ms(3000)), None, ms(1)), Winner::Lane1);
        assert_eq!(decide_winner(None, None, ms(1)), Winner::Unresolved);
    }

    #[test]
    fn test_duplicate_start_keeps_first() {
        let mut lane = LaneRecord::default();
        assert_eq!(
            lane.record(reading(Lane::Lane1, ms(1), GateKind::Start)),
            ReadingOutcome::StartRecorded
        );
        assert_eq!(
            lane.record(reading(Lane::Lane1, ms(40), GateKind::Start)),
            ReadingOutcome::DuplicateStart
        );
        assert_eq!(lane.start.unwrap().at, ms(1));
    }

    #[test]
    fn test_finish_computes_lane_time_from_start() {
        let mut lane = LaneRecord::default();
        lane.record(reading(Lane::Lane1, ms(2), GateKind::Start));
        let outcome = lane.record(reading(Lane::Lane1, ms(2347), GateKind::Finish));
        assert_eq!(outcome, ReadingOutcome::Finished(ms(2345)));
        assert_eq!(lane.outcome, LaneOutcome::Finished(ms(2345)));
    }

    #[test]
    fn test_finish_without_start_implies_zero() {
        let mut lane = LaneRecord::default();
        let outcome = lane.record(reading(Lane::Lane2, ms(1800), GateKind::Finish));
        assert_eq!(outcome, ReadingOutcome::Finished(ms(1800)));
        assert_eq!(lane.start.unwrap().at, Duration::ZERO);
    }

    #[test]
    fn test_readings_after_finish_rejected() {
        let mut lane = LaneRecord::default();
        lane.record(reading(Lane::Lane1, ms(0), GateKind::Start));
        lane.record(reading(Lane::Lane1, ms(1000), GateKind::Finish));
        assert_eq!(
            lane.record(reading(Lane::Lane1, ms(1100), GateKind::Finish)),
            ReadingOutcome::Rejected
        );
        assert_eq!(lane.outcome, LaneOutcome::Finished(ms(1000)));
    }

    #[test]
    fn test_winner_requires_both_lanes() {
        let mut race = Race::new(RaceId(1));
        race.lane_mut(Lane::Lane1).record(reading(Lane::Lane1, ms(900), GateKind::Finish));
        assert_eq!(race.compute_winner(ms(1)), None);

        race.lane_mut(Lane::Lane2).outcome = LaneOutcome::DidNotFinish;
        assert_eq!(race.compute_winner(ms(1)), Some(Winner::Lane1));
    }

    #[test]
    fn test_result_only_when_finished() {
        let mut race = Race::new(RaceId(7));
        assert!(race.to_result().is_none());

        race.lane_mut(Lane::Lane1).record(reading(Lane::Lane1, ms(2345), GateKind::Finish));
        race.lane_mut(Lane::Lane2).record(reading(Lane::Lane2, ms(2400), GateKind::Finish));
        race.winner = Winner::Lane1;
        race.state = RaceState::Finished;

        let result = race.to_result().unwrap();
        assert_eq!(result.race_id, RaceId(7));
        assert_eq!(result.car1_time_ms, Some(2345));
        assert_eq!(result.car2_time_ms, Some(2400));
        assert_eq!(result.winner, Winner::Lane1);
    }

    #[test]
    fn test_view_reports_lane_outcomes() {
        let mut race = Race::new(RaceId(3));
        race.lane_mut(Lane::Lane1).record(reading(Lane::Lane1, ms(1200), GateKind::Finish));
        race.lane_mut(Lane::Lane2).outcome = LaneOutcome::DidNotFinish;

        let view = RaceView::from(&race);
        assert_eq!(view.lane1.outcome, "finished");
        assert_eq!(view.lane1.time_ms, Some(1200));
        assert_eq!(view.lane1.start_us, Some(0));
        assert_eq!(view.lane2.outcome, "dnf");
        assert_eq!(view.lane2.time_ms, None);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["state"], "loaded");
        assert!(json.get("fault").is_none());
    }
}
