use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::f32::consts::TAU;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voice {
    Kick,
    Snare,
    Hat,
}

impl Voice {
    /// General MIDI percussion key to voice.
    pub fn from_key(key: u8) -> Option<Self> {
        match key {
            35 | 36 => Some(Self::Kick),
            37..=40 => Some(Self::Snare),
            42 | 44 | 46 | 49 | 51 => Some(Self::Hat),
            _ => None,
        }
    }

    fn length_seconds(self) -> f32 {
        match self {
            Self::Kick => 0.35,
            Self::Snare => 0.2,
            Self::Hat => 0.06,
        }
    }

    /// Mixes one hit into `out` starting at `start`.
    pub fn strike(self, out: &mut [f32], start: usize, gain: f32, sample_rate: f32) {
        let len = (self.length_seconds() * sample_rate) as usize;
        let mut noise = Noise(0x9e37_79b9 ^ start as u32);
        let mut phase = 0.0_f32;
        let mut previous = 0.0_f32;
        for (i, slot) in out.iter_mut().skip(start).take(len).enumerate() {
            let t = i as f32 / sample_rate;
            let sample = match self {
                Self::Kick => {
                    let freq = 50.0 + 100.0 * (-t * 30.0).exp();
                    phase += TAU * freq / sample_rate;
                    phase.sin() * (-t * 9.0).exp()
                }
                Self::Snare => {
                    phase += TAU * 185.0 / sample_rate;
                    (0.35 * phase.sin() + 0.65 * noise.next()) * (-t * 20.0).exp()
                }
                Self::Hat => {
                    let white = noise.next();
                    let bright = white - previous;
                    previous = white;
                    0.5 * bright * (-t * 60.0).exp()
                }
            };
            *slot = (*slot + gain * sample).clamp(-1.0, 1.0);
        }
    }
}

struct Noise(u32);

impl Noise {
    fn next(&mut self) -> f32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        (self.0 as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

/// One bar of steps per voice, written as `x` (hit) and `.` (rest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub kick: Vec<bool>,
    pub snare: Vec<bool>,
    pub hat: Vec<bool>,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            kick: steps("x...x...x...x..."),
            snare: steps("....x.......x..."),
            hat: steps("x.x.x.x.x.x.x.x."),
        }
    }
}

pub fn steps(text: &str) -> Vec<bool> {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| matches!(c, 'x' | 'X'))
        .collect()
}

impl Pattern {
    fn lanes(&self) -> [(Voice, &[bool]); 3] {
        [
            (Voice::Kick, &self.kick),
            (Voice::Snare, &self.snare),
            (Voice::Hat, &self.hat),
        ]
    }

    /// Renders `bars` repetitions at `bpm`, one bar being four beats.
    pub fn render(&self, bpm: f32, bars: usize, sample_rate: f32) -> Vec<f32> {
        let bar_samples = (sample_rate * 240.0 / bpm.max(1.0)) as usize;
        let mut out = vec![0.0; bar_samples * bars];
        for bar in 0..bars {
            for (voice, lane) in self.lanes() {
                if lane.is_empty() {
                    continue;
                }
                let step_samples = bar_samples / lane.len();
                for (step, _) in lane.iter().enumerate().filter(|(_, hit)| **hit) {
                    let start = bar * bar_samples + step * step_samples;
                    voice.strike(&mut out, start, 0.8, sample_rate);
                }
            }
        }
        out
    }
}

/// Maps ticks to sample offsets through the file's tempo changes.
fn tick_mapper(smf: &Smf<'_>, sample_rate: f64) -> Option<(impl Fn(u64) -> usize, u64)> {
    let Timing::Metrical(ppq) = smf.header.timing else {
        return None;
    };
    let ppq = u64::from(ppq.as_int().max(1));
    let mut tempos: Vec<(u64, u32)> = vec![(0, 500_000)];
    let mut max_tick = 0_u64;
    for track in &smf.tracks {
        let mut tick = 0_u64;
        for event in track {
            tick = tick.saturating_add(u64::from(event.delta.as_int()));
            max_tick = max_tick.max(tick);
            if let TrackEventKind::Meta(MetaMessage::Tempo(us_per_q)) = event.kind {
                tempos.push((tick, us_per_q.as_int()));
            }
        }
    }
    tempos.sort_by_key(|(tick, _)| *tick);
    let mapper = move |tick: u64| -> usize {
        let mut total_us: u128 = 0;
        let mut prev_tick = 0_u64;
        let mut tempo_us = 500_000_u32;
        for (change_tick, change_us) in &tempos {
            if *change_tick > tick {
                break;
            }
            let span = change_tick.saturating_sub(prev_tick);
            total_us += u128::from(span) * u128::from(tempo_us) / u128::from(ppq);
            prev_tick = *change_tick;
            tempo_us = *change_us;
        }
        let rest = tick.saturating_sub(prev_tick);
        total_us += u128::from(rest) * u128::from(tempo_us) / u128::from(ppq);
        ((total_us as f64 / 1_000_000.0) * sample_rate).round() as usize
    };
    Some((mapper, max_tick))
}

/// Renders the percussion note-ons of a standard MIDI file. Notes without a
/// drum voice are skipped.
pub fn render_midi(bytes: &[u8], sample_rate: f32) -> Result<Vec<f32>, midly::Error> {
    let smf = Smf::parse(bytes)?;
    let Some((to_samples, max_tick)) = tick_mapper(&smf, f64::from(sample_rate)) else {
        return Ok(Vec::new());
    };
    let tail = (Voice::Kick.length_seconds() * sample_rate) as usize;
    let mut out = vec![0.0; to_samples(max_tick) + tail];
    for track in &smf.tracks {
        let mut tick = 0_u64;
        for event in track {
            tick = tick.saturating_add(u64::from(event.delta.as_int()));
            if let TrackEventKind::Midi {
                message: MidiMessage::NoteOn { key, vel },
                ..
            } = event.kind
                && vel.as_int() > 0
                && let Some(voice) = Voice::from_key(key.as_int())
            {
                let gain = f32::from(vel.as_int()) / 127.0;
                voice.strike(&mut out, to_samples(tick), gain, sample_rate);
            }
        }
    }
    Ok(out)
}
