//! Host transport snapshot and the timebase generator.
//!
//! [`Transport`] mirrors the position structure a JACK-style host hands to
//! every callback; the core only ever reads it. [`TransportMaster`] is the
//! optional timebase generator that fills those fields in when this engine
//! drives the host tempo instead of following it.

use crate::time::TimeSignature;

/// Transport position snapshot for one process cycle.
///
/// Copied from the host at the top of each callback; immutable per cycle.
#[derive(Debug, Clone, Copy)]
pub struct Transport {
    /// Absolute frame position.
    pub frame: u64,
    /// Frames per second.
    pub frame_rate: u32,
    /// Current bar, 1-based.
    pub bar: u32,
    /// Current beat within the bar, 1-based.
    pub beat: u32,
    /// Current tick within the beat.
    pub tick: u32,
    /// Tick of the start of the current bar since transport zero.
    pub bar_start_tick: f64,
    pub ticks_per_beat: f64,
    pub beats_per_bar: f64,
    pub beats_per_minute: f64,
    /// Whether the bar/beat/tick fields are valid.
    pub bbt_valid: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            frame: 0,
            frame_rate: 48_000,
            bar: 1,
            beat: 1,
            tick: 0,
            bar_start_tick: 0.0,
            ticks_per_beat: 1920.0,
            beats_per_bar: 4.0,
            beats_per_minute: 120.0,
            bbt_valid: false,
        }
    }
}

impl Transport {
    /// The time signature currently reported by the host.
    pub fn time_signature(&self) -> TimeSignature {
        TimeSignature::new(
            self.bbt_valid,
            self.beats_per_bar as f32,
            self.beat_type(),
        )
    }

    fn beat_type(&self) -> f32 {
        // hosts report beat type separately; we only track beats_per_bar and
        // assume quarter-note beats unless a master overrides it
        4.0
    }
}

/// Host transport state as passed to the sync callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Starting,
    Rolling,
}

/// Timebase generator: computes bar/beat/tick for the host each cycle.
///
/// Runs entirely on the process thread. Tempo and meter changes arrive from
/// the script thread as plain field writes before the master is published, or
/// through the engine's command path afterwards.
#[derive(Debug)]
pub struct TransportMaster {
    beats_per_bar: f64,
    beat_unit: f64,
    ticks_per_beat: f64,
    bpm: f64,
    force_beat: bool,
}

impl TransportMaster {
    pub fn new(bpm: f64, beats_per_bar: f64, beat_unit: f64) -> Self {
        Self {
            beats_per_bar,
            beat_unit,
            ticks_per_beat: 1920.0,
            bpm,
            force_beat: false,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }

    /// Change tempo and snap the next period to a beat boundary.
    pub fn force_beat(&mut self, bpm: f64) {
        self.bpm = bpm;
        self.force_beat = true;
    }

    pub fn set_time_signature(&mut self, numerator: f64, denominator: f64) {
        self.beats_per_bar = numerator;
        self.beat_unit = denominator;
    }

    /// Timebase callback body: fill in the BBT fields for the next period.
    ///
    /// `new_pos` is set by the host after a relocation; the BBT position is
    /// then recomputed from the absolute frame. Otherwise the position
    /// advances incrementally from the previous period.
    pub fn set_time(&mut self, nframes: u32, pos: &mut Transport, new_pos: bool) {
        if new_pos || self.force_beat {
            pos.beats_per_bar = self.beats_per_bar;
            pos.ticks_per_beat = self.ticks_per_beat;
            pos.beats_per_minute = self.bpm;
            pos.bbt_valid = true;

            let minutes = pos.frame as f64 / (pos.frame_rate as f64 * 60.0);
            let tick = (minutes * pos.beats_per_minute * pos.ticks_per_beat) as u64;
            let beat = tick / pos.ticks_per_beat as u64;

            pos.bar = (beat as f64 / pos.beats_per_bar) as u32;
            pos.beat = (beat - (pos.bar as f64 * pos.beats_per_bar) as u64) as u32 + 1;
            pos.tick = (tick - beat * pos.ticks_per_beat as u64) as u32;
            pos.bar_start_tick = pos.bar as f64 * pos.beats_per_bar * pos.ticks_per_beat;
            pos.bar += 1; // bar is 1-based

            self.force_beat = false;
        } else {
            // advance from the previous period
            pos.beats_per_minute = self.bpm;
            let mut tick = pos.tick as f64
                + nframes as f64 * pos.ticks_per_beat * pos.beats_per_minute
                    / (pos.frame_rate as f64 * 60.0);
            while tick >= pos.ticks_per_beat {
                tick -= pos.ticks_per_beat;
                pos.beat += 1;
                if pos.beat as f64 > pos.beats_per_bar {
                    pos.beat = 1;
                    pos.bar += 1;
                    pos.bar_start_tick += pos.beats_per_bar * pos.ticks_per_beat;
                }
            }
            pos.tick = tick as u32;
        }
    }
}
