//! Debate phase timer shared by both participants of a match.
//!
//! The timer is independent of the media session: it runs whether or not a
//! [`sync::TimerStore`] is configured, and never touches negotiation.

pub mod sync;

use serde::{Deserialize, Serialize};

pub use sync::{BusTimerStore, TimerStore, TimerStoreError, TimerSync};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Opening1,
    Opening2,
    Rebuttal1,
    Rebuttal2,
    Closing1,
    Closing2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    pub phase: Phase,
    pub name: &'static str,
    pub label: &'static str,
    pub duration_secs: u32,
}

pub const PHASES: [PhaseSpec; 6] = [
    PhaseSpec {
        phase: Phase::Opening1,
        name: "opening1",
        label: "Opening Statement (Speaker 1)",
        duration_secs: 120,
    },
    PhaseSpec {
        phase: Phase::Opening2,
        name: "opening2",
        label: "Opening Statement (Speaker 2)",
        duration_secs: 120,
    },
    PhaseSpec {
        phase: Phase::Rebuttal1,
        name: "rebuttal1",
        label: "Rebuttal (Speaker 1)",
        duration_secs: 60,
    },
    PhaseSpec {
        phase: Phase::Rebuttal2,
        name: "rebuttal2",
        label: "Rebuttal (Speaker 2)",
        duration_secs: 60,
    },
    PhaseSpec {
        phase: Phase::Closing1,
        name: "closing1",
        label: "Closing (Speaker 1)",
        duration_secs: 60,
    },
    PhaseSpec {
        phase: Phase::Closing2,
        name: "closing2",
        label: "Closing (Speaker 2)",
        duration_secs: 60,
    },
];

/// Synced record of a match's timer. `phase` stays a string so records written by
/// a newer peer with phases we don't know still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub phase: String,
    pub time_left: u32,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not running; nothing changed.
    Idle,
    Ticked,
    /// Moved to the next phase with its full duration.
    Advanced(Phase),
    /// The last phase ran out; the timer stopped.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebateTimer {
    index: usize,
    time_left: u32,
    running: bool,
}

impl Default for DebateTimer {
    fn default() -> Self {
        Self {
            index: 0,
            time_left: PHASES[0].duration_secs,
            running: false,
        }
    }
}

impl DebateTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spec(&self) -> &'static PhaseSpec {
        &PHASES[self.index]
    }

    pub fn phase(&self) -> Phase {
        self.spec().phase
    }

    pub fn time_left(&self) -> u32 {
        self.time_left
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn state(&self) -> TimerState {
        TimerState {
            phase: self.spec().name.to_string(),
            time_left: self.time_left,
            running: self.running,
        }
    }

    pub fn start(&mut self) -> TimerState {
        self.running = true;
        self.state()
    }

    pub fn pause(&mut self) -> TimerState {
        self.running = false;
        self.state()
    }

    pub fn reset(&mut self) -> TimerState {
        *self = Self::default();
        self.state()
    }

    /// Advance by one second.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.running {
            return TickOutcome::Idle;
        }
        if self.time_left > 0 {
            self.time_left -= 1;
            if self.time_left > 0 {
                return TickOutcome::Ticked;
            }
        }
        match PHASES.get(self.index + 1) {
            Some(next) => {
                self.index += 1;
                self.time_left = next.duration_secs;
                TickOutcome::Advanced(next.phase)
            }
            None => {
                self.time_left = 0;
                self.running = false;
                TickOutcome::Finished
            }
        }
    }

    /// Adopt a record written by the other participant.
    pub fn apply_remote(&mut self, state: &TimerState) {
        if let Some(index) = PHASES.iter().position(|spec| spec.name == state.phase) {
            self.index = index;
        }
        self.time_left = state.time_left;
        self.running = state.running;
    }

    /// Remaining time as `m:ss`.
    pub fn display(&self) -> String {
        format!("{}:{:02}", self.time_left / 60, self.time_left % 60)
    }

    pub fn progress(&self) -> String {
        format!("Phase {} of {}", self.index + 1, PHASES.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_paused_in_first_opening() {
        let timer = DebateTimer::new();
        assert_eq!(timer.phase(), Phase::Opening1);
        assert_eq!(timer.display(), "2:00");
        assert_eq!(timer.progress(), "Phase 1 of 6");
        assert!(!timer.is_running());
    }

    #[test]
    fn tick_is_idle_while_paused() {
        let mut timer = DebateTimer::new();
        assert_eq!(timer.tick(), TickOutcome::Idle);
        assert_eq!(timer.time_left(), 120);
    }

    #[test]
    fn runs_through_every_phase_then_finishes() {
        let mut timer = DebateTimer::new();
        timer.start();
        let mut advanced = Vec::new();
        let mut ticks = 0;
        loop {
            ticks += 1;
            match timer.tick() {
                TickOutcome::Advanced(phase) => advanced.push(phase),
                TickOutcome::Finished => break,
                TickOutcome::Ticked => {}
                TickOutcome::Idle => panic!("timer stopped early"),
            }
        }
        assert_eq!(
            advanced,
            vec![
                Phase::Opening2,
                Phase::Rebuttal1,
                Phase::Rebuttal2,
                Phase::Closing1,
                Phase::Closing2
            ]
        );
        assert_eq!(ticks, 120 + 120 + 60 * 4);
        assert!(!timer.is_running());
        assert_eq!(timer.state().phase, "closing2");
        assert_eq!(timer.time_left(), 0);
        assert_eq!(timer.tick(), TickOutcome::Idle);
    }

    #[test]
    fn reset_returns_to_first_phase() {
        let mut timer = DebateTimer::new();
        timer.apply_remote(&TimerState {
            phase: "rebuttal2".into(),
            time_left: 17,
            running: true,
        });
        assert_eq!(timer.display(), "0:17");
        let state = timer.reset();
        assert_eq!(
            state,
            TimerState {
                phase: "opening1".into(),
                time_left: 120,
                running: false
            }
        );
    }

    #[test]
    fn unknown_remote_phase_keeps_current_index() {
        let mut timer = DebateTimer::new();
        timer.apply_remote(&TimerState {
            phase: "crossfire".into(),
            time_left: 42,
            running: true,
        });
        assert_eq!(timer.phase(), Phase::Opening1);
        assert_eq!(timer.time_left(), 42);
        assert!(timer.is_running());
    }

    #[test]
    fn running_at_zero_advances_immediately() {
        let mut timer = DebateTimer::new();
        timer.apply_remote(&TimerState {
            phase: "opening1".into(),
            time_left: 0,
            running: true,
        });
        assert_eq!(timer.tick(), TickOutcome::Advanced(Phase::Opening2));
        assert_eq!(timer.time_left(), 120);
    }

    #[test]
    fn wire_form_matches_stored_record() {
        let state = DebateTimer::new().start();
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            serde_json::json!({"phase": "opening1", "time_left": 120, "running": true})
        );
    }
}
