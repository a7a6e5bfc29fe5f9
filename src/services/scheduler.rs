//! Scheduler
//!
//! Places rendered segments on the virtual two-deck timeline: deck
//! alternation and crossfades for music, a voice-over lane for commentary,
//! station-ID prepending with a ducking ramp. Time is always an injected
//! `now_sec` (seconds from stream start); the scheduler never reads a clock.

use crate::models::{
    AudioChannel, Deck, DeckTransition, FadeCurve, GainRamp, QueueArbitration, RenderedSegment,
    ScheduledClip, SegmentKind, TimelineSnapshot,
};
use std::path::PathBuf;

/// Station-ID files shorter than this are treated as absent.
const MIN_STATION_ID_SEC: f64 = 0.05;

const VOICE_RAMP: GainRamp = GainRamp {
    from: 0.65,
    to: 1.35,
    ramp_sec: 3.5,
};
const MUSIC_RAMP: GainRamp = GainRamp {
    from: 0.70,
    to: 1.00,
    ramp_sec: 7.0,
};

#[derive(Debug, Clone)]
struct LastScheduled {
    kind: SegmentKind,
    start_sec: f64,
    duration_sec: f64,
}

#[derive(Debug, Clone)]
struct LastMusic {
    segment_id: String,
    deck: Deck,
    end_sec: f64,
    commentary_between: bool,
}

pub struct TimelineScheduler {
    cursor_sec: f64,
    next_deck: Deck,
    last: Option<LastScheduled>,
    last_music: Option<LastMusic>,
    station_id: Option<(PathBuf, f64)>,
    carry_over_offset: bool,
    clips: Vec<ScheduledClip>,
    transitions: Vec<DeckTransition>,
    clip_counter: u64,
}

impl TimelineScheduler {
    pub fn new(station_id: Option<(PathBuf, f64)>) -> Self {
        Self {
            cursor_sec: 0.0,
            next_deck: Deck::A,
            last: None,
            last_music: None,
            station_id: station_id.filter(|(_, d)| *d > MIN_STATION_ID_SEC),
            carry_over_offset: false,
            clips: Vec::new(),
            transitions: Vec::new(),
            clip_counter: 0,
        }
    }

    pub fn set_station_id(&mut self, station_id: Option<(PathBuf, f64)>) {
        self.station_id = station_id.filter(|(_, d)| *d > MIN_STATION_ID_SEC);
    }

    pub fn set_carry_over_offset(&mut self, enabled: bool) {
        self.carry_over_offset = enabled;
    }

    /// Back to an empty timeline at cursor zero. Station-ID and carry-over
    /// settings survive.
    pub fn reset(&mut self) {
        self.cursor_sec = 0.0;
        self.next_deck = Deck::A;
        self.last = None;
        self.last_music = None;
        self.clips.clear();
        self.transitions.clear();
    }

    pub fn cursor_sec(&self) -> f64 {
        self.cursor_sec
    }

    pub fn clips(&self) -> &[ScheduledClip] {
        &self.clips
    }

    pub fn transitions(&self) -> &[DeckTransition] {
        &self.transitions
    }

    /// Place a segment; returns the clips it expanded into.
    pub fn place(&mut self, segment: &RenderedSegment, now_sec: f64) -> Vec<ScheduledClip> {
        let mut base_start = self.cursor_sec.max(now_sec);
        if let Some(scheduled) = segment.scheduled_start_sec {
            base_start = base_start.max(scheduled);
        }

        let mut placed: Vec<ScheduledClip> = Vec::new();

        let segment_start = match segment.kind {
            SegmentKind::Song => {
                let deck = self.next_deck;
                self.next_deck = deck.other();

                // A song begins beneath the latter half of a preceding
                // commentary.
                let start = match &self.last {
                    Some(last) if last.kind == SegmentKind::Commentary => now_sec
                        .max(base_start.min(last.start_sec + 0.5 * last.duration_sec)),
                    _ => base_start,
                };
                // With carry-over enabled the bed-previewed portion is not
                // replayed; the clip picks up where the preview left off.
                let source_offset = if self.carry_over_offset {
                    (base_start - start).max(0.0)
                } else {
                    0.0
                };

                let mut music_clip = self.clip(
                    segment,
                    AudioChannel::Music,
                    segment.file_path.clone(),
                    start,
                    segment.duration_sec,
                    1.0,
                    Some(MUSIC_RAMP),
                    Some(deck),
                    None,
                );
                music_clip.source_offset_sec = source_offset;
                placed.push(music_clip);

                if let Some(prev) = self.last_music.take() {
                    let window = crossfade_window_sec(segment.priority);
                    let curve = crossfade_curve(prev.commentary_between, segment.priority);
                    self.transitions.push(DeckTransition {
                        from_segment_id: prev.segment_id,
                        to_segment_id: segment.id.clone(),
                        from_deck: prev.deck,
                        to_deck: deck,
                        at_sec: prev.end_sec - window,
                        window_sec: window,
                        curve,
                    });
                }
                self.last_music = Some(LastMusic {
                    segment_id: segment.id.clone(),
                    deck,
                    end_sec: start + segment.duration_sec,
                    commentary_between: false,
                });
                start
            }
            SegmentKind::Commentary => {
                let station_id = self.station_id.clone();
                let voice_start = match station_id {
                    Some((path, duration)) => {
                        placed.push(self.clip(
                            segment,
                            AudioChannel::Jingle,
                            path,
                            base_start,
                            duration,
                            1.0,
                            Some(GainRamp {
                                from: 1.0,
                                to: 0.15,
                                ramp_sec: duration,
                            }),
                            None,
                            Some(segment.id.clone()),
                        ));
                        let crossfade = 0.45_f64.min(0.4 * duration);
                        base_start + (duration - crossfade).max(0.0)
                    }
                    None => base_start,
                };

                placed.push(self.clip(
                    segment,
                    AudioChannel::Voice,
                    segment.file_path.clone(),
                    voice_start,
                    segment.duration_sec,
                    1.0,
                    Some(VOICE_RAMP),
                    None,
                    None,
                ));
                if let Some(music) = &mut self.last_music {
                    music.commentary_between = true;
                }
                voice_start
            }
            SegmentKind::Liner => {
                placed.push(self.clip(
                    segment,
                    AudioChannel::Jingle,
                    segment.file_path.clone(),
                    base_start,
                    segment.duration_sec,
                    1.0,
                    None,
                    None,
                    None,
                ));
                base_start
            }
        };

        self.cursor_sec = self.cursor_sec.max(segment_start + segment.duration_sec);
        self.last = Some(LastScheduled {
            kind: segment.kind,
            start_sec: segment_start,
            duration_sec: segment.duration_sec,
        });

        self.clips.extend(placed.iter().cloned());
        placed
    }

    #[allow(clippy::too_many_arguments)]
    fn clip(
        &mut self,
        segment: &RenderedSegment,
        channel: AudioChannel,
        file_path: PathBuf,
        start_at_sec: f64,
        duration_sec: f64,
        gain: f64,
        gain_ramp: Option<GainRamp>,
        deck: Option<Deck>,
        parent_segment_id: Option<String>,
    ) -> ScheduledClip {
        self.clip_counter += 1;
        ScheduledClip {
            id: format!("{}#{}", segment.id, self.clip_counter),
            segment_id: segment.id.clone(),
            parent_segment_id,
            channel,
            file_path,
            start_at_sec,
            source_offset_sec: 0.0,
            duration_sec,
            gain,
            gain_ramp,
            fade_in_sec: None,
            fade_out_sec: None,
            deck,
        }
    }

    /// Drop clips finished more than `grace_sec` ago. Returns what was removed.
    pub fn prune_finished(&mut self, now_sec: f64, grace_sec: f64) -> Vec<ScheduledClip> {
        let (gone, keep): (Vec<_>, Vec<_>) = self
            .clips
            .drain(..)
            .partition(|clip| clip.end_at_sec() + grace_sec < now_sec);
        self.clips = keep;
        self.transitions
            .retain(|t| t.at_sec + t.window_sec + grace_sec >= now_sec);
        gone
    }

    pub fn clips_overlapping(&self, from_sec: f64, to_sec: f64) -> Vec<ScheduledClip> {
        self.clips
            .iter()
            .filter(|clip| clip.start_at_sec < to_sec && clip.end_at_sec() > from_sec)
            .cloned()
            .collect()
    }

    pub fn snapshot(
        &self,
        now_sec: f64,
        lookahead_sec: f64,
        queue: Vec<QueueArbitration>,
    ) -> TimelineSnapshot {
        let horizon = now_sec + lookahead_sec;
        let upcoming = |pred: &dyn Fn(&ScheduledClip) -> bool| {
            self.clips
                .iter()
                .filter(|c| c.end_at_sec() > now_sec && c.start_at_sec < horizon)
                .filter(|c| pred(c))
                .cloned()
                .collect::<Vec<_>>()
        };
        TimelineSnapshot {
            deck_a: upcoming(&|c| c.deck == Some(Deck::A)),
            deck_b: upcoming(&|c| c.deck == Some(Deck::B)),
            voice_lane: upcoming(&|c| c.channel == AudioChannel::Voice),
            jingle_lane: upcoming(&|c| c.channel == AudioChannel::Jingle),
            transitions: self
                .transitions
                .iter()
                .filter(|t| t.at_sec + t.window_sec > now_sec && t.at_sec < horizon)
                .cloned()
                .collect(),
            lookahead_sec,
            queue,
        }
    }

    /// Re-derive the planned transitions from the scheduled music clips.
    pub fn rebuild_transitions(&mut self) {
        let mut music: Vec<&ScheduledClip> = self
            .clips
            .iter()
            .filter(|c| c.channel == AudioChannel::Music)
            .collect();
        music.sort_by(|a, b| a.start_at_sec.total_cmp(&b.start_at_sec));

        self.transitions = music
            .windows(2)
            .filter_map(|pair| {
                let (prev, next) = (pair[0], pair[1]);
                let (from_deck, to_deck) = match (prev.deck, next.deck) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return None,
                };
                // Priority context is gone after placement; replan with the
                // default window.
                let window = crossfade_window_sec(50);
                Some(DeckTransition {
                    from_segment_id: prev.segment_id.clone(),
                    to_segment_id: next.segment_id.clone(),
                    from_deck,
                    to_deck,
                    at_sec: prev.end_at_sec() - window,
                    window_sec: window,
                    curve: FadeCurve::Tri,
                })
            })
            .collect();
    }
}

pub fn crossfade_window_sec(priority: u16) -> f64 {
    if priority >= 120 {
        2.2
    } else if priority >= 80 {
        2.8
    } else {
        3.6
    }
}

pub fn crossfade_curve(commentary_adjacent: bool, priority: u16) -> FadeCurve {
    if commentary_adjacent {
        FadeCurve::Log
    } else if priority >= 100 {
        FadeCurve::Exp
    } else {
        FadeCurve::Tri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SegmentSource;

    fn seg(kind: SegmentKind, duration: f64) -> RenderedSegment {
        RenderedSegment::new(
            kind,
            PathBuf::from("/tmp/seg.wav"),
            duration,
            "test",
            SegmentSource::Auto,
        )
    }

    #[test]
    fn deck_alternation_and_default_crossfades() {
        let mut scheduler = TimelineScheduler::new(None);
        let mut decks = Vec::new();
        for _ in 0..4 {
            let placed = scheduler.place(&seg(SegmentKind::Song, 60.0), 0.0);
            decks.push(placed[0].deck.unwrap());
        }
        assert_eq!(decks, vec![Deck::A, Deck::B, Deck::A, Deck::B]);

        let transitions = scheduler.transitions();
        assert_eq!(transitions.len(), 3);
        for t in transitions {
            assert!((t.window_sec - 3.6).abs() < 1e-9);
            assert_eq!(t.curve, FadeCurve::Tri);
        }
    }

    #[test]
    fn station_id_prepends_jingle_and_offsets_voice() {
        let mut scheduler =
            TimelineScheduler::new(Some((PathBuf::from("/tmp/id.wav"), 0.8)));
        // Push the cursor to 20.0 with a liner.
        scheduler.place(&seg(SegmentKind::Liner, 20.0), 0.0);

        let placed = scheduler.place(&seg(SegmentKind::Commentary, 10.0), 0.0);
        assert_eq!(placed.len(), 2);

        let jingle = &placed[0];
        assert_eq!(jingle.channel, AudioChannel::Jingle);
        assert!((jingle.start_at_sec - 20.0).abs() < 1e-9);
        assert!((jingle.duration_sec - 0.8).abs() < 1e-9);
        let ramp = jingle.gain_ramp.unwrap();
        assert!((ramp.from - 1.0).abs() < 1e-9);
        assert!((ramp.to - 0.15).abs() < 1e-9);
        assert!((ramp.ramp_sec - 0.8).abs() < 1e-9);

        let voice = &placed[1];
        assert_eq!(voice.channel, AudioChannel::Voice);
        assert!((voice.start_at_sec - 20.48).abs() < 1e-9);
        assert!((voice.duration_sec - 10.0).abs() < 1e-9);
    }

    #[test]
    fn tiny_station_id_is_ignored() {
        let mut scheduler =
            TimelineScheduler::new(Some((PathBuf::from("/tmp/id.wav"), 0.01)));
        let placed = scheduler.place(&seg(SegmentKind::Commentary, 5.0), 0.0);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].channel, AudioChannel::Voice);
    }

    #[test]
    fn song_starts_under_latter_half_of_commentary() {
        let mut scheduler = TimelineScheduler::new(None);
        scheduler.place(&seg(SegmentKind::Commentary, 10.0), 0.0);
        // Commentary runs [0, 10); cursor is 10. The song dips back to 5.0.
        let placed = scheduler.place(&seg(SegmentKind::Song, 60.0), 0.0);
        assert!((placed[0].start_at_sec - 5.0).abs() < 1e-9);
        // But never before now.
        let mut scheduler = TimelineScheduler::new(None);
        scheduler.place(&seg(SegmentKind::Commentary, 10.0), 0.0);
        let placed = scheduler.place(&seg(SegmentKind::Song, 60.0), 7.5);
        assert!((placed[0].start_at_sec - 7.5).abs() < 1e-9);
    }

    #[test]
    fn cursor_is_monotone() {
        let mut scheduler = TimelineScheduler::new(None);
        scheduler.place(&seg(SegmentKind::Song, 30.0), 0.0);
        let c1 = scheduler.cursor_sec();
        scheduler.place(&seg(SegmentKind::Commentary, 8.0), 0.0);
        let c2 = scheduler.cursor_sec();
        scheduler.place(&seg(SegmentKind::Song, 30.0), 0.0);
        let c3 = scheduler.cursor_sec();
        assert!(c1 <= c2 && c2 <= c3);
    }

    #[test]
    fn channel_mapping_and_ramps() {
        let mut scheduler = TimelineScheduler::new(None);
        let song = scheduler.place(&seg(SegmentKind::Song, 60.0), 0.0);
        assert_eq!(song[0].channel, AudioChannel::Music);
        assert_eq!(song[0].gain_ramp, Some(MUSIC_RAMP));

        let voice = scheduler.place(&seg(SegmentKind::Commentary, 10.0), 0.0);
        assert_eq!(voice[0].channel, AudioChannel::Voice);
        assert_eq!(voice[0].gain_ramp, Some(VOICE_RAMP));

        let liner = scheduler.place(&seg(SegmentKind::Liner, 3.0), 0.0);
        assert_eq!(liner[0].channel, AudioChannel::Jingle);
        assert_eq!(liner[0].gain_ramp, None);
    }

    #[test]
    fn crossfade_width_scales_with_priority() {
        assert!((crossfade_window_sec(150) - 2.2).abs() < 1e-9);
        assert!((crossfade_window_sec(120) - 2.2).abs() < 1e-9);
        assert!((crossfade_window_sec(90) - 2.8).abs() < 1e-9);
        assert!((crossfade_window_sec(50) - 3.6).abs() < 1e-9);
    }

    #[test]
    fn crossfade_curve_selection() {
        assert_eq!(crossfade_curve(true, 50), FadeCurve::Log);
        assert_eq!(crossfade_curve(false, 110), FadeCurve::Exp);
        assert_eq!(crossfade_curve(false, 50), FadeCurve::Tri);
    }

    #[test]
    fn music_adjacency_survives_voice_overlay() {
        let mut scheduler = TimelineScheduler::new(None);
        scheduler.place(&seg(SegmentKind::Song, 60.0), 0.0);
        scheduler.place(&seg(SegmentKind::Commentary, 10.0), 0.0);
        scheduler.place(&seg(SegmentKind::Song, 60.0), 0.0);
        let transitions = scheduler.transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].curve, FadeCurve::Log);
    }

    #[test]
    fn prune_drops_old_clips_only() {
        let mut scheduler = TimelineScheduler::new(None);
        scheduler.place(&seg(SegmentKind::Liner, 3.0), 0.0); // [0, 3)
        scheduler.place(&seg(SegmentKind::Liner, 3.0), 0.0); // [3, 6)
        let gone = scheduler.prune_finished(8.0, 4.0);
        assert_eq!(gone.len(), 0);
        let gone = scheduler.prune_finished(10.5, 4.0);
        assert_eq!(gone.len(), 1);
        assert_eq!(scheduler.clips().len(), 1);
    }

    #[test]
    fn overlap_query_is_half_open() {
        let mut scheduler = TimelineScheduler::new(None);
        scheduler.place(&seg(SegmentKind::Liner, 3.0), 0.0);
        assert_eq!(scheduler.clips_overlapping(0.0, 2.0).len(), 1);
        assert_eq!(scheduler.clips_overlapping(3.0, 5.0).len(), 0);
        assert_eq!(scheduler.clips_overlapping(2.9, 3.1).len(), 1);
    }
}
