use std::fmt;
use std::sync::Arc;

use harmoniq_plugin_host::ChainId;

use crate::source::TrackSource;
use crate::stage::{EffectStage, StageProcessor};

/// What a track (or the master bus) runs its signal through.
#[derive(Debug, Default)]
pub enum TrackEffects {
    #[default]
    None,
    /// A hosted chain; its order is snapshotted when the render starts.
    Chain(ChainId),
    Stages(Vec<EffectStage>),
}

impl TrackEffects {
    pub fn stages(stages: impl IntoIterator<Item = EffectStage>) -> Self {
        TrackEffects::Stages(stages.into_iter().collect())
    }

    /// Whether running these effects needs a plugin host.
    pub fn needs_host(&self) -> bool {
        match self {
            TrackEffects::None => false,
            TrackEffects::Chain(_) => true,
            TrackEffects::Stages(stages) => stages
                .iter()
                .any(|stage| matches!(stage.processor, StageProcessor::Hosted(_))),
        }
    }
}

pub struct Track {
    pub id: String,
    pub source: Arc<dyn TrackSource>,
    pub effects: TrackEffects,
    pub gain_db: f32,
    /// `-1` hard left, `1` hard right.
    pub pan: f32,
    pub mute: bool,
    pub solo: bool,
}

impl Track {
    pub fn new(id: impl Into<String>, source: impl TrackSource + 'static) -> Self {
        Self::from_shared(id, Arc::new(source))
    }

    pub fn from_shared(id: impl Into<String>, source: Arc<dyn TrackSource>) -> Self {
        Self {
            id: id.into(),
            source,
            effects: TrackEffects::None,
            gain_db: 0.0,
            pan: 0.0,
            mute: false,
            solo: false,
        }
    }

    pub fn with_effects(mut self, effects: TrackEffects) -> Self {
        self.effects = effects;
        self
    }

    pub fn with_stage(mut self, stage: EffectStage) -> Self {
        match &mut self.effects {
            TrackEffects::Stages(stages) => stages.push(stage),
            effects => *effects = TrackEffects::Stages(vec![stage]),
        }
        self
    }

    pub fn with_gain_db(mut self, gain_db: f32) -> Self {
        self.gain_db = gain_db;
        self
    }

    pub fn with_pan(mut self, pan: f32) -> Self {
        self.pan = pan;
        self
    }

    pub fn muted(mut self, mute: bool) -> Self {
        self.mute = mute;
        self
    }

    pub fn soloed(mut self, solo: bool) -> Self {
        self.solo = solo;
        self
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("channels", &self.source.channels())
            .field("effects", &self.effects)
            .field("gain_db", &self.gain_db)
            .field("pan", &self.pan)
            .field("mute", &self.mute)
            .field("solo", &self.solo)
            .finish()
    }
}

/// Indices of the tracks that play: the soloed ones if any track is
/// soloed, otherwise every unmuted track.
pub fn active_tracks(tracks: &[Track]) -> Vec<usize> {
    let any_solo = tracks.iter().any(|track| track.solo);
    tracks
        .iter()
        .enumerate()
        .filter(|(_, track)| if any_solo { track.solo } else { !track.mute })
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SineSource;
    use crate::stage::GainStage;

    fn track(id: &str) -> Track {
        Track::new(id, SineSource::new(440.0, 0.5))
    }

    #[test]
    fn solo_overrides_mute() {
        let tracks = vec![
            track("a"),
            track("b").muted(true).soloed(true),
            track("c"),
        ];
        assert_eq!(active_tracks(&tracks), vec![1]);
    }

    #[test]
    fn muted_tracks_drop_out_without_solo() {
        let tracks = vec![track("a").muted(true), track("b"), track("c")];
        assert_eq!(active_tracks(&tracks), vec![1, 2]);
    }

    #[test]
    fn builtin_stages_do_not_need_a_host() {
        let track = track("a").with_stage(EffectStage::builtin(GainStage::from_db(-6.0)));
        assert!(!track.effects.needs_host());
        assert!(TrackEffects::Chain(ChainId::from_raw(1)).needs_host());
    }
}
