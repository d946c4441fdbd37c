use std::{cell::Cell, fmt, rc::Rc};

use crate::{
    config::LevelConfig,
    host::{AnalyserSettings, AudioGraph, AudioHost, FrequencyAnalyser, MediaStream},
    smoothing::ExponentialSmoother,
    OrbError, Result,
};

/// Read-only view of a level slot. Consumers poll it on their own schedule;
/// only the owner ever writes the value behind it.
#[derive(Debug, Clone)]
pub struct LevelReader {
    slot: Rc<Cell<f32>>,
}

impl LevelReader {
    pub fn get(&self) -> f32 {
        self.slot.get()
    }
}

type AnalyserOf<A> = <<A as AudioHost>::Graph as AudioGraph>::Analyser;

/// Everything acquired for one activation: the stream, the processing
/// context, the analyser routed from the stream and its sample buffer.
pub struct AudioSession<A: AudioHost> {
    stream: A::Stream,
    graph: A::Graph,
    analyser: AnalyserOf<A>,
    bins: Vec<u8>,
}

impl<A: AudioHost> AudioSession<A> {
    fn release(mut self) {
        self.analyser.disconnect();
        self.graph.close();
        self.stream.stop_tracks();
    }
}

/// Turns a microphone stream into a smoothed loudness level in [0, 1].
pub struct LevelExtractor<A: AudioHost> {
    host: A,
    config: LevelConfig,
    session: Option<AudioSession<A>>,
    smoother: ExponentialSmoother,
    slot: Rc<Cell<f32>>,
    error: Option<OrbError>,
}

impl<A: AudioHost> LevelExtractor<A> {
    pub fn new(host: A, config: LevelConfig) -> Self {
        let smoother = ExponentialSmoother::new(config.smoothing);
        Self {
            host,
            config,
            session: None,
            smoother,
            slot: Rc::new(Cell::new(0.0)),
            error: None,
        }
    }

    pub fn host(&self) -> &A {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut A {
        &mut self.host
    }

    pub fn reader(&self) -> LevelReader {
        LevelReader {
            slot: Rc::clone(&self.slot),
        }
    }

    pub fn level(&self) -> f32 {
        self.slot.get()
    }

    /// The last microphone failure, if any.
    pub fn error(&self) -> Option<&OrbError> {
        self.error.as_ref()
    }

    /// Removes the last microphone failure and hands it to the caller.
    pub fn take_error(&mut self) -> Option<OrbError> {
        self.error.take()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Starts sampling `stream`, or the host microphone when `None`.
    ///
    /// Any previous session is released first, so repeated starts never hold
    /// two graphs. On failure the extractor stays inactive with the error
    /// recorded, and the call may be retried.
    pub fn start(&mut self, stream: Option<A::Stream>) -> Result<()> {
        self.stop();

        match self.open_session(stream) {
            Ok(session) => {
                tracing::debug!(bins = session.bins.len(), "level extractor started");
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "microphone unavailable");
                self.error = Some(err.replicate());
                Err(err)
            }
        }
    }

    fn open_session(&mut self, stream: Option<A::Stream>) -> Result<AudioSession<A>> {
        let mut stream = match stream {
            Some(stream) => stream,
            None => self.host.request_microphone()?,
        };

        let mut graph = match self.host.open_graph() {
            Ok(graph) => graph,
            Err(err) => {
                stream.stop_tracks();
                return Err(err);
            }
        };

        let settings = AnalyserSettings {
            fft_size: self.config.fft_size,
            smoothing: self.config.analyser_smoothing,
            min_decibels: self.config.min_decibels,
            max_decibels: self.config.max_decibels,
        };
        let analyser = match graph.connect_analyser(&stream, &settings) {
            Ok(analyser) => analyser,
            Err(err) => {
                graph.close();
                stream.stop_tracks();
                return Err(err);
            }
        };

        let bins = vec![0; analyser.frequency_bin_count()];
        Ok(AudioSession {
            stream,
            graph,
            analyser,
            bins,
        })
    }

    /// One sampling step: read the analyser, normalise the mean magnitude and
    /// smooth it into the level. Inactive extractors keep the level at 0.
    pub fn tick(&mut self) -> f32 {
        let Some(session) = self.session.as_mut() else {
            return self.slot.get();
        };

        session.analyser.byte_frequency_data(&mut session.bins);
        let normalized = normalize(
            &session.bins,
            self.config.noise_floor,
            self.config.dynamic_range,
        );
        let level = self.smoother.step(normalized);
        self.slot.set(level);
        tracing::trace!(normalized, level, "sampled microphone level");
        level
    }

    /// Releases the analyser, the processing context and the stream tracks,
    /// then resets the level to 0 and clears the error. Safe to call at any
    /// time, any number of times.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.release();
            tracing::debug!("level extractor stopped");
        }
        self.smoother.reset();
        self.slot.set(0.0);
        self.error = None;
    }
}

impl<A: AudioHost> Drop for LevelExtractor<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<A: AudioHost> fmt::Debug for LevelExtractor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelExtractor")
            .field("active", &self.is_active())
            .field("level", &self.level())
            .field("error", &self.error)
            .finish()
    }
}

/// Maps the mean byte magnitude onto [0, 1]: values at or below
/// `noise_floor` read as silence, `noise_floor + dynamic_range` and above as
/// full level. An empty buffer reads as silence.
pub fn normalize(bins: &[u8], noise_floor: f32, dynamic_range: f32) -> f32 {
    if bins.is_empty() || dynamic_range <= 0.0 {
        return 0.0;
    }
    let mean = bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32;
    ((mean - noise_floor) / dynamic_range).clamp(0.0, 1.0)
}
