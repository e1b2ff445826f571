//! KeyFrame decision criteria.

use crate::config::{Sensor, Settings};

/// Close points tracked below which a stereo/RGB-D frame asks for a
/// keyframe (together with [`MIN_UNTRACKED_CLOSE`]).
const MAX_TRACKED_CLOSE: usize = 100;
const MIN_UNTRACKED_CLOSE: usize = 70;

/// A keyframe is never created from fewer tracked points than this.
const MIN_TRACKED_FOR_KF: usize = 15;

/// What the tracker knows about the current frame and the local mapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFrameContext {
    /// Map points tracked (inliers) in the current frame.
    pub tracked: usize,
    /// Map points of the reference keyframe seen by enough keyframes.
    pub reference_tracked: usize,
    /// Stereo/RGB-D: close features with a tracked map point.
    pub tracked_close: usize,
    /// Stereo/RGB-D: close features without one.
    pub untracked_close: usize,
    /// Local mapper is idle and accepts keyframes.
    pub mapper_idle: bool,
    /// Local mapper is stopped or about to stop.
    pub mapper_stopped: bool,
    /// Messages waiting in the local mapper queue.
    pub queue_len: usize,
    /// Keyframes currently in the map.
    pub map_keyframes: usize,
}

/// Criteria for deciding whether to create a new KeyFrame.
///
/// - Frames since the last KeyFrame (`min_frames`, `max_frames`)
/// - Tracked points relative to the reference KeyFrame
/// - For stereo/RGB-D, coverage of close points
#[derive(Debug, Clone)]
pub struct KeyFrameDecision {
    /// Minimum frames between KeyFrames.
    min_frames: usize,
    /// Maximum frames between KeyFrames.
    max_frames: usize,
    /// Tracked/reference ratio below which a keyframe is needed.
    ref_ratio: f64,
    max_queue: usize,
    monocular: bool,
    /// Frame counter since last KeyFrame.
    frames_since_kf: usize,
}

impl KeyFrameDecision {
    pub fn new(sensor: Sensor, settings: &Settings) -> Self {
        Self {
            min_frames: settings.tracker.min_frames,
            max_frames: settings.max_frames(),
            ref_ratio: if sensor.is_monocular() {
                settings.tracker.mono_ref_ratio
            } else {
                settings.tracker.ref_ratio
            },
            max_queue: settings.local_mapping.max_queue,
            monocular: sensor.is_monocular(),
            frames_since_kf: 0,
        }
    }

    /// Count one tracked frame.
    pub fn tick(&mut self) {
        self.frames_since_kf += 1;
    }

    pub fn frames_since_keyframe(&self) -> usize {
        self.frames_since_kf
    }

    /// Decide whether the current frame should become a KeyFrame.
    pub fn should_create_keyframe(&self, ctx: &KeyFrameContext) -> bool {
        if ctx.mapper_stopped {
            return false;
        }

        // Few keyframes: be more permissive.
        let ref_ratio = if ctx.map_keyframes < 2 { 0.4 } else { self.ref_ratio };

        let need_close = !self.monocular
            && ctx.tracked_close < MAX_TRACKED_CLOSE
            && ctx.untracked_close > MIN_UNTRACKED_CLOSE;

        // Enough time has passed
        let c1a = self.frames_since_kf >= self.max_frames;
        // Mapper idle and minimum spacing respected
        let c1b = self.frames_since_kf >= self.min_frames && ctx.mapper_idle;
        // Tracking is weak
        let c1c = !self.monocular
            && ((ctx.tracked as f64) < 0.25 * ctx.reference_tracked as f64 || need_close);
        // Fewer points than the reference, but not too few
        let c2 = ((ctx.tracked as f64) < ref_ratio * ctx.reference_tracked as f64 || need_close)
            && ctx.tracked > MIN_TRACKED_FOR_KF;

        if !((c1a || c1b || c1c) && c2) {
            return false;
        }

        if ctx.mapper_idle {
            return true;
        }
        // Busy mapper: stereo/RGB-D still queue a few keyframes
        !self.monocular && ctx.queue_len < self.max_queue
    }

    /// Reset after KeyFrame creation.
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "camera:\n  fx: 400\n  fy: 400\n  cx: 320\n  cy: 240\n  width: 640\n  height: 480\n  bf: 40\n  fps: 10\n";

    fn decision(sensor: Sensor) -> KeyFrameDecision {
        KeyFrameDecision::new(sensor, &Settings::from_yaml(YAML).unwrap())
    }

    fn ctx(tracked: usize, reference: usize) -> KeyFrameContext {
        KeyFrameContext {
            tracked,
            reference_tracked: reference,
            tracked_close: 200,
            untracked_close: 0,
            mapper_idle: true,
            mapper_stopped: false,
            queue_len: 0,
            map_keyframes: 5,
        }
    }

    #[test]
    fn test_no_keyframe_while_tracking_is_strong() {
        let mut d = decision(Sensor::Stereo);
        for _ in 0..20 {
            d.tick();
        }
        assert!(!d.should_create_keyframe(&ctx(190, 200)));
    }

    #[test]
    fn test_keyframe_when_tracking_drops() {
        let mut d = decision(Sensor::Stereo);
        d.tick();
        assert!(d.should_create_keyframe(&ctx(100, 200)));
        // Too few points for a keyframe at all
        assert!(!d.should_create_keyframe(&ctx(10, 200)));
    }

    #[test]
    fn test_stopped_or_busy_mapper_blocks_keyframes() {
        let mut d = decision(Sensor::Monocular);
        d.tick();
        let mut c = ctx(100, 200);
        c.mapper_stopped = true;
        assert!(!d.should_create_keyframe(&c));

        c.mapper_stopped = false;
        c.mapper_idle = false;
        assert!(!d.should_create_keyframe(&c));

        // Weak tracking lets stereo queue a keyframe behind a busy mapper.
        let mut s = decision(Sensor::Stereo);
        s.tick();
        let mut c = ctx(40, 200);
        c.mapper_idle = false;
        c.queue_len = 1;
        assert!(s.should_create_keyframe(&c));
        c.queue_len = 3;
        assert!(!s.should_create_keyframe(&c));
    }

    #[test]
    fn test_close_point_coverage_for_stereo() {
        let mut d = decision(Sensor::Rgbd);
        d.tick();
        let mut c = ctx(190, 200);
        c.tracked_close = 50;
        c.untracked_close = 120;
        assert!(d.should_create_keyframe(&c));
    }
}
