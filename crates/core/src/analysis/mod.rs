use std::{f32::consts::PI, fmt};

use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};

use crate::{AnalysisConfig, AppConfig, AudioSource, DriftError, Result, SampleBuffer};

/// Overall RMS below which a track is treated as silence.
const SILENCE_RMS: f32 = 1e-4;
/// Share of the loudest window that marks a drop.
const DROP_ENERGY: f32 = 0.7;
/// Share of the loudest window that marks a build.
const BUILD_ENERGY: f32 = 0.4;
/// Autocorrelation peaks within this share of the best peak count as candidates;
/// the shortest such lag wins to avoid half-tempo picks.
const OCTAVE_PREFERENCE: f32 = 0.9;
/// Share of the chosen peak a peak at half its lag needs to replace it.
const HALF_PERIOD_SUPPORT: f32 = 0.5;
const BOUNDARY_EPSILON_MS: f64 = 1e-6;

/// Structural label attached to a segment of the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentLabel {
    Intro,
    Build,
    Drop,
    Breakdown,
    Outro,
}

impl fmt::Display for SegmentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Intro => "intro",
            Self::Build => "build",
            Self::Drop => "drop",
            Self::Breakdown => "breakdown",
            Self::Outro => "outro",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub label: SegmentLabel,
    pub start_ms: f64,
    pub end_ms: f64,
    pub tempo_bpm: f64,
}

/// Beat, tempo and structure information for one track.
///
/// Instances can only be built through [`AudioTimeline::new`] (or deserialised,
/// which routes through the same checks), so every value upholds:
/// beats strictly increase and lie within `[0, duration_ms]`, and segments
/// partition `[0, duration_ms]` without gaps or overlaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TimelineParts")]
pub struct AudioTimeline {
    sample_rate: u32,
    duration_ms: f64,
    tempo_bpm: f64,
    beat_timestamps_ms: Vec<f64>,
    segments: Vec<Segment>,
}

#[derive(Deserialize)]
struct TimelineParts {
    sample_rate: u32,
    duration_ms: f64,
    tempo_bpm: f64,
    beat_timestamps_ms: Vec<f64>,
    segments: Vec<Segment>,
}

impl TryFrom<TimelineParts> for AudioTimeline {
    type Error = DriftError;

    fn try_from(parts: TimelineParts) -> Result<Self> {
        AudioTimeline::new(
            parts.sample_rate,
            parts.duration_ms,
            parts.tempo_bpm,
            parts.beat_timestamps_ms,
            parts.segments,
        )
    }
}

impl AudioTimeline {
    pub fn new(
        sample_rate: u32,
        duration_ms: f64,
        tempo_bpm: f64,
        beat_timestamps_ms: Vec<f64>,
        segments: Vec<Segment>,
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(DriftError::schema("timeline sample rate must be positive"));
        }
        if !(duration_ms.is_finite() && duration_ms > 0.0) {
            return Err(DriftError::schema(format!(
                "timeline duration must be positive, got {duration_ms}"
            )));
        }
        if !(tempo_bpm.is_finite() && tempo_bpm > 0.0) {
            return Err(DriftError::schema(format!(
                "timeline tempo must be positive, got {tempo_bpm}"
            )));
        }

        for (index, beat) in beat_timestamps_ms.iter().enumerate() {
            if !(0.0..=duration_ms).contains(beat) {
                return Err(DriftError::schema(format!(
                    "beat {index} at {beat} ms lies outside [0, {duration_ms}]"
                )));
            }
        }
        if let Some(index) = beat_timestamps_ms.windows(2).position(|w| w[1] <= w[0]) {
            return Err(DriftError::schema(format!(
                "beat timestamps must strictly increase (beat {})",
                index + 1
            )));
        }

        let first = segments
            .first()
            .ok_or_else(|| DriftError::schema("timeline needs at least one segment"))?;
        if first.start_ms.abs() > BOUNDARY_EPSILON_MS {
            return Err(DriftError::schema("first segment must start at 0 ms"));
        }
        for segment in &segments {
            if segment.end_ms <= segment.start_ms || segment.tempo_bpm <= 0.0 {
                return Err(DriftError::schema(format!(
                    "segment {} [{}, {}] is empty or has no tempo",
                    segment.label, segment.start_ms, segment.end_ms
                )));
            }
        }
        for pair in segments.windows(2) {
            if (pair[1].start_ms - pair[0].end_ms).abs() > BOUNDARY_EPSILON_MS {
                return Err(DriftError::schema(format!(
                    "segments {} and {} leave a gap or overlap at {} ms",
                    pair[0].label, pair[1].label, pair[0].end_ms
                )));
            }
        }
        if let Some(last) = segments.last() {
            if (last.end_ms - duration_ms).abs() > BOUNDARY_EPSILON_MS {
                return Err(DriftError::schema("last segment must end at the track duration"));
            }
        }

        Ok(Self {
            sample_rate,
            duration_ms,
            tempo_bpm,
            beat_timestamps_ms,
            segments,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm
    }

    pub fn beats(&self) -> &[f64] {
        &self.beat_timestamps_ms
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn beat_at(&self, index: usize) -> Option<f64> {
        self.beat_timestamps_ms.get(index).copied()
    }

    /// Returns the `occurrence`-th segment carrying `label`.
    pub fn segment(&self, label: SegmentLabel, occurrence: usize) -> Option<&Segment> {
        self.segments
            .iter()
            .filter(|segment| segment.label == label)
            .nth(occurrence)
    }

    /// Returns the segment covering `time_ms`, clamping to the track bounds.
    pub fn segment_at(&self, time_ms: f64) -> &Segment {
        let index = self
            .segments
            .partition_point(|segment| segment.end_ms <= time_ms)
            .min(self.segments.len() - 1);
        &self.segments[index]
    }

    pub fn beat_interval_ms_at(&self, time_ms: f64) -> f64 {
        60_000.0 / self.segment_at(time_ms).tempo_bpm
    }

    /// Index of the last beat at or before `time_ms`.
    pub fn beat_index_at_or_before(&self, time_ms: f64) -> Option<usize> {
        self.beat_timestamps_ms
            .partition_point(|beat| *beat <= time_ms)
            .checked_sub(1)
    }

    pub fn nearest_beat(&self, time_ms: f64) -> Option<f64> {
        let after = self.beat_timestamps_ms.partition_point(|beat| *beat < time_ms);
        let candidates = [after.checked_sub(1), Some(after)];
        candidates
            .into_iter()
            .flatten()
            .filter_map(|index| self.beat_at(index))
            .min_by(|a, b| (a - time_ms).abs().total_cmp(&(b - time_ms).abs()))
    }

    /// Time of beat `index`, extrapolating past the last detected beat with the
    /// tempo of the final segment.
    pub fn beat_time_extrapolated(&self, index: usize) -> f64 {
        self.grid_time(index as f64)
    }

    /// `index` is a whole, non-negative beat number kept in `f64` so positions
    /// far past the detected grid cannot overflow.
    fn grid_time(&self, index: f64) -> f64 {
        let detected = self.beat_timestamps_ms.len();
        if index < detected as f64 {
            return self.beat_timestamps_ms[index as usize];
        }
        let interval = 60_000.0 / self.segments[self.segments.len() - 1].tempo_bpm;
        match self.beat_timestamps_ms.last() {
            Some(last) => last + (index - (detected - 1) as f64) * interval,
            None => index * interval,
        }
    }

    /// Fractional beat position of `time_ms` on the (extrapolated) beat grid.
    pub fn beat_position(&self, time_ms: f64) -> f64 {
        let Some(first) = self.beat_timestamps_ms.first().copied() else {
            return time_ms / self.beat_interval_ms_at(time_ms);
        };
        if time_ms < first {
            return (time_ms - first) / self.beat_interval_ms_at(time_ms);
        }
        let index = self.beat_index_at_or_before(time_ms).unwrap_or(0) as f64;
        let here = self.grid_time(index);
        let next = self.grid_time(index + 1.0);
        index + (time_ms - here) / (next - here)
    }

    /// Inverse of [`AudioTimeline::beat_position`].
    pub fn time_at_beat_position(&self, position: f64) -> f64 {
        let Some(first) = self.beat_timestamps_ms.first().copied() else {
            return position * self.beat_interval_ms_at(0.0);
        };
        if position < 0.0 {
            return first + position * self.beat_interval_ms_at(0.0);
        }
        let index = position.floor();
        let here = self.grid_time(index);
        let next = self.grid_time(index + 1.0);
        here + (position - index) * (next - here)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Loads a cached timeline, re-checking every invariant.
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }
}

/// Contract shared by every beat/tempo/structure detector.
///
/// Implementations must be deterministic: the same input always yields the same
/// timeline.
pub trait BeatDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn analyze(&self, source: &AudioSource) -> Result<AudioTimeline>;
}

/// Picks the detector selected by `sync.beat_detection`.
pub fn detector_for(config: &AppConfig) -> Box<dyn BeatDetector> {
    if config.sync.beat_detection {
        Box::new(SpectralFluxDetector::new(config.analysis.clone()))
    } else {
        Box::new(FixedTempoDetector::new(
            config.sync.fallback_bpm,
            0.0,
            config.analysis.clone(),
        ))
    }
}

/// Onset detection by spectral flux, tempo by autocorrelation of the onset
/// envelope, and beats by phase-aligning a grid to the strongest onsets.
#[derive(Debug, Clone)]
pub struct SpectralFluxDetector {
    config: AnalysisConfig,
}

impl SpectralFluxDetector {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }
}

impl Default for SpectralFluxDetector {
    fn default() -> Self {
        Self::new(AnalysisConfig::default())
    }
}

impl BeatDetector for SpectralFluxDetector {
    fn name(&self) -> &'static str {
        "spectral-flux"
    }

    fn analyze(&self, source: &AudioSource) -> Result<AudioTimeline> {
        let buffer = source.decode()?;
        let duration_ms = buffer.duration_ms();
        check_signal(&buffer, &self.config)?;

        let frame = self.config.frame_size;
        let hop = self.config.hop_size;
        let envelope = onset_envelope(&buffer.samples, frame, hop);
        let hop_ms = hop as f64 * 1000.0 / buffer.sample_rate as f64;
        // Flux peaks when an onset sits where the Hann slope between two
        // consecutive frames is steepest.
        let offset_samples = 0.75 * frame as f64 - 0.5 * hop as f64;
        let offset_ms = offset_samples * 1000.0 / buffer.sample_rate as f64;

        let min_lag = (60_000.0 / self.config.max_bpm / hop_ms).floor().max(1.0) as usize;
        let max_lag = (60_000.0 / self.config.min_bpm / hop_ms).ceil() as usize;
        let (period, confidence) = estimate_period(&envelope, min_lag, max_lag).ok_or_else(|| {
            DriftError::InsufficientSignal("onset envelope too short for tempo estimation".into())
        })?;
        if confidence < self.config.min_confidence {
            return Err(DriftError::InsufficientSignal(format!(
                "no periodic pulse found (confidence {confidence:.2} < {:.2})",
                self.config.min_confidence
            )));
        }

        let tempo_bpm = 60_000.0 / (period * hop_ms);
        let beats: Vec<f64> = place_beats(&envelope, period)
            .into_iter()
            .map(|position| position * hop_ms + offset_ms)
            .filter(|time| *time <= duration_ms)
            .collect();
        if beats.len() < 2 {
            return Err(DriftError::InsufficientSignal(
                "fewer than two beats could be placed".into(),
            ));
        }

        let segments = segment_track(
            &buffer.samples,
            buffer.sample_rate,
            duration_ms,
            self.config.segment_window_ms,
            &beats,
            tempo_bpm,
        );

        tracing::debug!(
            detector = self.name(),
            tempo_bpm,
            confidence,
            beats = beats.len(),
            segments = segments.len(),
            "analysed track"
        );
        AudioTimeline::new(buffer.sample_rate, duration_ms, tempo_bpm, beats, segments)
    }
}

/// Lays a constant beat grid over the track. Used when beat detection is off
/// and the tempo is known ahead of time.
#[derive(Debug, Clone)]
pub struct FixedTempoDetector {
    bpm: f64,
    offset_ms: f64,
    config: AnalysisConfig,
}

impl FixedTempoDetector {
    pub fn new(bpm: f64, offset_ms: f64, config: AnalysisConfig) -> Self {
        Self {
            bpm,
            offset_ms: offset_ms.max(0.0),
            config,
        }
    }
}

impl BeatDetector for FixedTempoDetector {
    fn name(&self) -> &'static str {
        "fixed-tempo"
    }

    fn analyze(&self, source: &AudioSource) -> Result<AudioTimeline> {
        let buffer = source.decode()?;
        let duration_ms = buffer.duration_ms();
        check_signal(&buffer, &self.config)?;
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(DriftError::InsufficientSignal(format!(
                "fixed tempo must be positive, got {}",
                self.bpm
            )));
        }

        let interval = 60_000.0 / self.bpm;
        let beats: Vec<f64> = (0..)
            .map(|k| self.offset_ms + k as f64 * interval)
            .take_while(|time| *time <= duration_ms)
            .collect();

        let segments = segment_track(
            &buffer.samples,
            buffer.sample_rate,
            duration_ms,
            self.config.segment_window_ms,
            &beats,
            self.bpm,
        );
        AudioTimeline::new(buffer.sample_rate, duration_ms, self.bpm, beats, segments)
    }
}

/// Rejects tracks too short or too quiet to carry a beat, whichever detector runs.
fn check_signal(buffer: &SampleBuffer, config: &AnalysisConfig) -> Result<()> {
    let duration_ms = buffer.duration_ms();
    if buffer.is_empty() || duration_ms < config.min_signal_ms {
        return Err(DriftError::InsufficientSignal(format!(
            "track is {duration_ms:.0} ms long, at least {:.0} ms is required",
            config.min_signal_ms
        )));
    }
    if compute_rms(&buffer.samples) < SILENCE_RMS {
        return Err(DriftError::InsufficientSignal("track is silent".into()));
    }
    Ok(())
}

/// Half-wave rectified spectral flux, one value per hop.
fn onset_envelope(samples: &[f32], frame: usize, hop: usize) -> Vec<f32> {
    let mut planner = RealFftPlanner::<f32>::new();
    let plan = planner.plan_fft_forward(frame);
    let mut input = plan.make_input_vec();
    let mut spectrum = plan.make_output_vec();
    let mut scratch = plan.make_scratch_vec();
    let mut previous: Option<Vec<f32>> = None;
    let mut envelope = Vec::new();

    let frames = if samples.len() <= frame {
        1
    } else {
        (samples.len() - frame) / hop + 1
    };

    for index in 0..frames {
        let start = index * hop;
        for (offset, slot) in input.iter_mut().enumerate() {
            let sample = samples.get(start + offset).copied().unwrap_or(0.0);
            *slot = sample * hann_value(offset, frame);
        }
        if plan
            .process_with_scratch(&mut input, &mut spectrum, &mut scratch)
            .is_err()
        {
            envelope.push(0.0);
            continue;
        }

        let magnitudes: Vec<f32> = spectrum.iter().map(|bin| bin.norm()).collect();
        let flux = match previous.as_ref() {
            Some(prev) => magnitudes
                .iter()
                .zip(prev)
                .map(|(now, before)| (now - before).max(0.0))
                .sum(),
            None => 0.0,
        };
        envelope.push(flux);
        previous = Some(magnitudes);
    }

    envelope
}

/// Returns the beat period in hops (fractional) and its normalised
/// autocorrelation strength.
fn estimate_period(envelope: &[f32], min_lag: usize, max_lag: usize) -> Option<(f64, f32)> {
    let len = envelope.len();
    let max_lag = max_lag.min(len.saturating_sub(2));
    if min_lag >= max_lag {
        return None;
    }

    let mean = envelope.iter().sum::<f32>() / len as f32;
    let centred: Vec<f32> = envelope.iter().map(|value| value - mean).collect();
    let autocorrelation = |lag: usize| -> f32 {
        let sum: f32 = centred
            .iter()
            .zip(&centred[lag..])
            .map(|(a, b)| a * b)
            .sum();
        sum / (len - lag) as f32
    };

    let energy = autocorrelation(0);
    if energy <= f32::EPSILON {
        return None;
    }

    let scores: Vec<f32> = (0..=max_lag + 1)
        .map(|lag| if lag >= min_lag.saturating_sub(1) { autocorrelation(lag) } else { 0.0 })
        .collect();
    let best = (min_lag..=max_lag)
        .map(|lag| scores[lag])
        .fold(f32::MIN, f32::max);
    if best <= 0.0 {
        return Some((min_lag as f64, 0.0));
    }

    let is_peak = |lag: usize| {
        scores[lag] >= scores[lag.saturating_sub(1)] && scores[lag] >= scores[lag + 1]
    };
    // A period between two integer lags splits its peak across both, so peaks
    // are compared by their interpolated height.
    let refine = |lag: usize| -> (f64, f32) {
        let (left, centre, right) = (scores[lag - 1], scores[lag], scores[lag + 1]);
        let offset = parabolic_offset(left, centre, right);
        (lag as f64 + offset, centre - 0.25 * (left - right) * offset as f32)
    };
    let peaks: Vec<(f64, f32)> = (min_lag..=max_lag)
        .filter(|&lag| is_peak(lag))
        .map(refine)
        .collect();
    let best = peaks
        .iter()
        .map(|(_, height)| *height)
        .fold(best, f32::max);
    let (mut period, mut height) = peaks
        .iter()
        .copied()
        .find(|(_, height)| *height >= best * OCTAVE_PREFERENCE)
        .unwrap_or_else(|| refine(min_lag));

    // Half the chosen period is the same pulse counted twice as often.
    loop {
        let half = period / 2.0;
        let candidate = peaks
            .iter()
            .copied()
            .filter(|(lag, _)| (lag - half).abs() <= 1.0 && *lag < period - 0.5)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        match candidate {
            Some((lag, value)) if value >= height * HALF_PERIOD_SUPPORT => {
                period = lag;
                height = value;
            }
            _ => break,
        }
    }

    Some((period, (height / energy).min(1.0)))
}

/// Chooses the grid phase that collects the most onset energy, then nudges every
/// grid point to the strongest nearby onset.
fn place_beats(envelope: &[f32], period: f64) -> Vec<f64> {
    let len = envelope.len();
    let value_at = |position: f64| -> f32 {
        let index = position.round() as usize;
        envelope.get(index).copied().unwrap_or(0.0)
    };

    let phase_steps = period.ceil().max(1.0) as usize;
    let mut best_phase = 0.0;
    let mut best_score = f32::MIN;
    for step in 0..phase_steps {
        let phase = step as f64;
        let mut score = 0.0;
        let mut position = phase;
        while position < len as f64 {
            score += value_at(position);
            position += period;
        }
        if score > best_score {
            best_score = score;
            best_phase = phase;
        }
    }

    let radius = (period / 4.0).floor().max(1.0) as usize;
    let mut beats = Vec::new();
    let mut predicted = best_phase;
    while predicted < len as f64 {
        let centre = predicted.round() as usize;
        let lo = centre.saturating_sub(radius);
        let hi = (centre + radius).min(len - 1);
        let peak = (lo..=hi)
            .max_by(|a, b| envelope[*a].total_cmp(&envelope[*b]).then(b.cmp(a)))
            .unwrap_or(centre.min(len - 1));

        let position = if envelope[peak] > 0.0 && peak > 0 && peak + 1 < len {
            peak as f64 + parabolic_offset(envelope[peak - 1], envelope[peak], envelope[peak + 1])
        } else if envelope[peak] > 0.0 {
            peak as f64
        } else {
            predicted
        };
        if beats.last().map_or(true, |last| position > *last) {
            beats.push(position);
        }
        predicted += period;
    }
    beats
}

fn parabolic_offset(left: f32, centre: f32, right: f32) -> f64 {
    let denominator = left - 2.0 * centre + right;
    if denominator.abs() <= f32::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / denominator).clamp(-0.5, 0.5) as f64
}

/// Labels fixed windows by relative energy and merges runs into segments that
/// cover the whole track.
fn segment_track(
    samples: &[f32],
    sample_rate: u32,
    duration_ms: f64,
    window_ms: f64,
    beats: &[f64],
    fallback_tempo: f64,
) -> Vec<Segment> {
    let window_samples = ((window_ms * sample_rate as f64 / 1000.0).round() as usize).max(1);
    let energies: Vec<f32> = samples.chunks(window_samples).map(compute_rms).collect();
    let peak = energies.iter().copied().fold(0.0f32, f32::max);

    let levels: Vec<f32> = energies
        .iter()
        .map(|energy| if peak > 0.0 { energy / peak } else { 0.0 })
        .collect();
    let first_drop = levels.iter().position(|level| *level >= DROP_ENERGY);
    let last_drop = levels.iter().rposition(|level| *level >= DROP_ENERGY);

    let labels = levels.iter().enumerate().map(|(index, level)| {
        if *level >= DROP_ENERGY {
            SegmentLabel::Drop
        } else if *level >= BUILD_ENERGY {
            SegmentLabel::Build
        } else {
            match (first_drop, last_drop) {
                (Some(first), _) if index < first => SegmentLabel::Intro,
                (_, Some(last)) if index > last => SegmentLabel::Outro,
                (Some(_), Some(_)) => SegmentLabel::Breakdown,
                _ => SegmentLabel::Intro,
            }
        }
    });

    let mut runs: Vec<(SegmentLabel, f64, f64)> = Vec::new();
    for (index, label) in labels.enumerate() {
        let start = index as f64 * window_ms;
        let end = ((index + 1) as f64 * window_ms).min(duration_ms);
        match runs.last_mut() {
            Some((current, _, run_end)) if *current == label => *run_end = end,
            _ => runs.push((label, start, end)),
        }
    }
    if runs.is_empty() {
        runs.push((SegmentLabel::Intro, 0.0, duration_ms));
    }
    runs.retain(|(_, start, end)| end > start);
    if let Some(last) = runs.last_mut() {
        last.2 = duration_ms;
    }

    runs.into_iter()
        .map(|(label, start_ms, end_ms)| Segment {
            label,
            start_ms,
            end_ms,
            tempo_bpm: local_tempo(beats, start_ms, end_ms).unwrap_or(fallback_tempo),
        })
        .collect()
}

/// Median inter-beat interval inside `[start, end)`, as BPM.
fn local_tempo(beats: &[f64], start_ms: f64, end_ms: f64) -> Option<f64> {
    let inside: Vec<f64> = beats
        .iter()
        .copied()
        .filter(|beat| *beat >= start_ms && *beat < end_ms)
        .collect();
    let mut intervals: Vec<f64> = inside.windows(2).map(|w| w[1] - w[0]).collect();
    if intervals.is_empty() {
        return None;
    }
    intervals.sort_by(f64::total_cmp);
    let median = intervals[intervals.len() / 2];
    (median > 0.0).then(|| 60_000.0 / median)
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
