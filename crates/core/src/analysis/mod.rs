use std::{
    collections::VecDeque,
    f32::consts::PI,
    fmt,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{
    host::{AnalyserSettings, AudioGraph, FrequencyAnalyser, MediaStream},
    OrbError, Result,
};

/// Upper bound on buffered capture samples, in analysis windows. Older
/// samples are dropped when the sampling loop falls behind.
const TAP_WINDOWS: usize = 4;

/// Frequency analyser over raw PCM that reports byte magnitudes the way a
/// browser analyser node does: Blackman window, temporal smoothing of bin
/// magnitudes, then a linear map of `[min_decibels, max_decibels]` onto
/// `0..=255`.
pub struct SpectrumAnalyser {
    settings: AnalyserSettings,
    history: Vec<f32>,
    write_pos: usize,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    fft: FftResources,
}

impl SpectrumAnalyser {
    pub fn new(settings: AnalyserSettings) -> Self {
        let size = settings.fft_size.max(2);
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let fft = FftResources {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };

        Self {
            settings,
            history: vec![0.0; size],
            write_pos: 0,
            window: (0..size).map(|i| blackman_value(i, size)).collect(),
            smoothed: vec![0.0; size / 2],
            fft,
        }
    }

    pub fn settings(&self) -> &AnalyserSettings {
        &self.settings
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Appends samples to the analysis window, keeping only the newest
    /// `fft_size` of them.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let capacity = self.history.len();
        for &sample in samples {
            self.history[self.write_pos] = if sample.is_finite() { sample } else { 0.0 };
            self.write_pos = (self.write_pos + 1) % capacity;
        }
    }

    /// Runs one analysis over the current window and writes byte magnitudes.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        if let Err(err) = self.analyse() {
            tracing::warn!(%err, "spectrum analysis failed");
            out.fill(0);
            return;
        }

        let min_db = self.settings.min_decibels;
        let range_db = (self.settings.max_decibels - min_db).max(f32::EPSILON);
        for (slot, magnitude) in out.iter_mut().zip(&self.smoothed) {
            let db = 20.0 * magnitude.max(1e-12).log10();
            let scaled = 255.0 * (db - min_db) / range_db;
            *slot = scaled.clamp(0.0, 255.0) as u8;
        }
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.smoothed.fill(0.0);
        self.write_pos = 0;
    }

    fn analyse(&mut self) -> Result<()> {
        let fft = &mut self.fft;
        let size = fft.size;
        for index in 0..size {
            let sample = self.history[(self.write_pos + index) % size];
            fft.input[index] = sample * self.window[index];
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| OrbError::msg(format!("fft failed: {err}")))?;

        let smoothing = self.settings.smoothing.clamp(0.0, 1.0);
        let norm = 1.0 / size as f32;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&fft.spectrum) {
            let magnitude = bin.norm() * norm;
            *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
        }
        Ok(())
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("settings", &self.settings)
            .field("bins", &self.smoothed.len())
            .finish()
    }
}

fn blackman_value(index: usize, len: usize) -> f32 {
    let phase = 2.0 * PI * index as f32 / len as f32;
    0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
}

/// Bounded sample queue shared between a capture callback (writer) and the
/// sampling tick (reader).
#[derive(Clone)]
pub struct SampleTap {
    shared: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl SampleTap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Sized for the given analysis window.
    pub fn for_window(fft_size: usize) -> Self {
        Self::new(fft_size * TAP_WINDOWS)
    }

    /// Appends samples, dropping the oldest when full. Safe to call from an
    /// audio callback thread.
    pub fn push(&self, samples: &[f32]) {
        let Ok(mut queue) = self.shared.lock() else {
            return;
        };
        for &sample in samples {
            if queue.len() == self.capacity {
                queue.pop_front();
            }
            queue.push_back(sample);
        }
    }

    /// Moves every queued sample into `out` and returns how many moved.
    pub fn drain_into(&self, out: &mut Vec<f32>) -> usize {
        let Ok(mut queue) = self.shared.lock() else {
            return 0;
        };
        let drained = queue.len();
        out.extend(queue.drain(..));
        drained
    }

    pub fn len(&self) -> usize {
        self.shared.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut queue) = self.shared.lock() {
            queue.clear();
        }
    }
}

impl fmt::Debug for SampleTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTap")
            .field("capacity", &self.capacity)
            .field("queued", &self.len())
            .finish()
    }
}

/// A stream that exposes its captured samples through a [`SampleTap`].
pub trait TappedStream: MediaStream {
    fn tap(&self) -> SampleTap;
}

/// Analyser node fed from a [`SampleTap`].
#[derive(Debug)]
pub struct TapAnalyser {
    tap: SampleTap,
    spectrum: SpectrumAnalyser,
    pending: Vec<f32>,
    connected: bool,
}

impl TapAnalyser {
    pub fn new(tap: SampleTap, settings: AnalyserSettings) -> Self {
        Self {
            tap,
            spectrum: SpectrumAnalyser::new(settings),
            pending: Vec::new(),
            connected: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl FrequencyAnalyser for TapAnalyser {
    fn frequency_bin_count(&self) -> usize {
        self.spectrum.frequency_bin_count()
    }

    fn byte_frequency_data(&mut self, out: &mut [u8]) {
        if !self.connected {
            out.fill(0);
            return;
        }
        self.pending.clear();
        self.tap.drain_into(&mut self.pending);
        self.spectrum.push_samples(&self.pending);
        self.spectrum.byte_frequency_data(out);
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.spectrum.reset();
    }
}

/// Audio graph for PCM streams: every analyser reads the stream's tap.
#[derive(Debug)]
pub struct PcmGraph<S> {
    closed: bool,
    _stream: PhantomData<fn() -> S>,
}

impl<S> PcmGraph<S> {
    pub fn new() -> Self {
        Self {
            closed: false,
            _stream: PhantomData,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<S> Default for PcmGraph<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TappedStream> AudioGraph for PcmGraph<S> {
    type Stream = S;
    type Analyser = TapAnalyser;

    fn connect_analyser(&mut self, stream: &S, settings: &AnalyserSettings) -> Result<TapAnalyser> {
        if self.closed {
            return Err(OrbError::msg("audio graph is closed"));
        }
        Ok(TapAnalyser::new(stream.tap(), *settings))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
