use daw_transport::PPQN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator: numerator.max(1),
            denominator: denominator.max(1),
        }
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.numerator
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

impl From<(u32, u32)> for TimeSignature {
    fn from((numerator, denominator): (u32, u32)) -> Self {
        Self::new(numerator, denominator)
    }
}

/// Maps beats to bars, pixels and seconds for display. Kept in sync with
/// the engine tempo by the session's bpm listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeContext {
    pub bpm: f64,
    pub time_signature: TimeSignature,
    pub pixels_per_beat: f64,
}

impl TimeContext {
    pub fn new(bpm: f64, time_signature: impl Into<TimeSignature>, pixels_per_beat: f64) -> Self {
        Self {
            bpm,
            time_signature: time_signature.into(),
            pixels_per_beat,
        }
    }

    pub fn beats_to_ticks(&self, beats: f64) -> u64 {
        (beats.max(0.0) * PPQN as f64).round() as u64
    }

    pub fn ticks_to_beats(&self, ticks: u64) -> f64 {
        ticks as f64 / PPQN as f64
    }

    pub fn beats_to_bars(&self, beats: f64) -> f64 {
        beats / self.time_signature.beats_per_bar() as f64
    }

    pub fn beats_to_pixels(&self, beats: f64) -> f64 {
        beats * self.pixels_per_beat
    }

    pub fn pixels_to_beats(&self, pixels: f64) -> f64 {
        pixels / self.pixels_per_beat
    }

    pub fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats * 60.0 / self.bpm
    }

    pub fn seconds_to_beats(&self, seconds: f64) -> f64 {
        seconds * self.bpm / 60.0
    }

    pub fn format_position(&self, beats: f64) -> MusicalPosition {
        let ticks = self.beats_to_ticks(beats);
        let ticks_per_bar = PPQN * self.time_signature.beats_per_bar() as u64;

        MusicalPosition {
            bar: (ticks / ticks_per_bar) as u32 + 1,
            beat: ((ticks % ticks_per_bar) / PPQN) as u32 + 1,
            tick: (ticks % PPQN) as u32,
        }
    }
}

impl Default for TimeContext {
    fn default() -> Self {
        Self::new(120.0, TimeSignature::default(), 100.0)
    }
}

/// `bar.beat.tick`, all but tick counted from one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MusicalPosition {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
}

impl std::fmt::Display for MusicalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{:03}", self.bar, self.beat, self.tick)
    }
}
