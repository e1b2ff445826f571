//! Local Mapper - Main Local Mapping thread implementation.
//!
//! Processes keyframes received from Tracking:
//! 1. Inserts the keyframe into the map and the place recognition index
//! 2. Culls recently created map points that are not re-observed
//! 3. Triangulates new map points with covisible neighbors
//! 4. Fuses duplicates with neighbors (queue empty only)
//! 5. Local BA with three-phase locking (queue empty, no stop requested)
//! 6. Culls redundant keyframes
//! 7. Forwards the keyframe to Loop Closing

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::{LocalMappingSection, Sensor, Settings};
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::optimizer::{local_bundle_adjustment, LocalBAConfig};
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::{SharedState, WAIT_POLL};
use crate::tracking::frame::CameraModel;
use crate::vocabulary::FEATURE_VECTOR_LEVELS_UP;

use super::culling::{cull_keyframes, cull_recent_map_points};
use super::search_in_neighbors::{search_in_neighbors, SearchInNeighborsConfig};
use super::triangulation::{create_new_map_points, TriangulationConfig};

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Stereo/RGB-D: unmatched close features turned into map points when a
/// keyframe is inserted, even beyond the depth threshold.
const MIN_CLOSE_POINTS: usize = 100;

/// Local Mapping thread state.
pub struct LocalMapper {
    /// Camera model for triangulation and fusion.
    camera: CameraModel,
    sensor: Sensor,
    config: LocalMappingSection,
    th_depth: f64,
    ba_config: LocalBAConfig,

    /// Channel sender to Loop Closing thread.
    lc_sender: Option<Sender<KeyFrameId>>,

    /// Points created by the last few keyframes, checked by culling.
    recent_points: Vec<MapPointId>,
}

impl LocalMapper {
    /// Create a new LocalMapper.
    ///
    /// `lc_sender` forwards processed keyframe ids to Loop Closing when
    /// present.
    pub fn new(settings: &Settings, sensor: Sensor, lc_sender: Option<Sender<KeyFrameId>>) -> Self {
        Self {
            camera: settings.camera_model(),
            sensor,
            config: settings.local_mapping.clone(),
            th_depth: settings.th_depth(),
            ba_config: LocalBAConfig::from_settings(settings),
            lc_sender,
            recent_points: Vec::new(),
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>, shared: Arc<SharedState>) {
        info!("[LocalMapping] Started");
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            if shared.is_mapper_stop_requested() {
                self.wait_while_stopped(&kf_receiver, &shared);
                continue;
            }

            if shared.is_mapper_reset_requested() {
                self.reset(&kf_receiver);
                shared.acknowledge_mapper_reset();
                continue;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    shared.set_accept_keyframes(false);
                    self.process_keyframe(msg, &shared, &kf_receiver);
                    shared.set_accept_keyframes(true);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        shared.set_mapper_finished();
        info!("[LocalMapping] Finished");
    }

    /// Stay parked at the iteration boundary while a stop is requested.
    /// Resets are still honored so a reset never waits on a release.
    fn wait_while_stopped(&mut self, kf_receiver: &Receiver<NewKeyFrameMsg>, shared: &SharedState) {
        debug!("[LocalMapping] Stopped");
        shared.set_mapper_stopped(true);
        while shared.is_mapper_stop_requested() && !shared.is_shutdown_requested() {
            if shared.is_mapper_reset_requested() {
                self.reset(kf_receiver);
                shared.acknowledge_mapper_reset();
            }
            thread::sleep(WAIT_POLL);
        }
        shared.set_mapper_stopped(false);
        debug!("[LocalMapping] Released");
    }

    /// Drop queued keyframes and the recent point list.
    fn reset(&mut self, kf_receiver: &Receiver<NewKeyFrameMsg>) {
        let dropped = kf_receiver.try_iter().count();
        self.recent_points.clear();
        info!("[LocalMapping] Reset ({} queued keyframes dropped)", dropped);
    }

    /// Process a single keyframe message. Returns the id of the processed
    /// keyframe.
    pub fn process_keyframe(
        &mut self,
        msg: NewKeyFrameMsg,
        shared: &SharedState,
        kf_receiver: &Receiver<NewKeyFrameMsg>,
    ) -> Option<KeyFrameId> {
        // Clear abort flag (we're starting fresh)
        shared.clear_abort_ba();

        let kf_id = self.insert_keyframe(msg, shared)?;

        {
            let mut map = shared.map.write();
            cull_recent_map_points(
                &mut map,
                &mut self.recent_points,
                kf_id,
                self.sensor.is_monocular(),
                self.config.recent_found_ratio,
            );

            let neighbors = if self.sensor.is_monocular() {
                self.config.mono_triangulation_neighbors
            } else {
                self.config.triangulation_neighbors
            };
            let config = TriangulationConfig::new(neighbors, self.sensor.is_monocular());
            let triangulated = create_new_map_points(&mut map, kf_id, &self.camera, &config);
            self.recent_points.extend(triangulated.new_points);

            if kf_receiver.is_empty() {
                let config = SearchInNeighborsConfig::new(self.sensor.is_monocular());
                search_in_neighbors(&mut map, kf_id, &self.camera, &config);
            }
        }

        if kf_receiver.is_empty() && !shared.is_mapper_stop_requested() {
            let n_keyframes = shared.map.read().num_keyframes();
            if n_keyframes > 2 {
                local_bundle_adjustment(&shared.map, kf_id, &self.camera, &self.ba_config, shared.abort_ba_flag());
            }

            let mut map = shared.map.write();
            let mut index = shared.index.write();
            cull_keyframes(
                &mut map,
                &mut index,
                kf_id,
                self.sensor.is_monocular(),
                self.th_depth,
                self.config.redundant_keyframe_ratio,
            );
        }

        self.forward(kf_id);
        Some(kf_id)
    }

    /// Insert the keyframe into the map and register it with the index.
    fn insert_keyframe(&mut self, msg: NewKeyFrameMsg, shared: &SharedState) -> Option<KeyFrameId> {
        let mut map = shared.map.write();

        let kf_id = match msg {
            NewKeyFrameMsg::Create { data, matched_map_points } => {
                let kf_id = map.create_keyframe(*data);
                for (idx, mp_id) in matched_map_points.iter().enumerate() {
                    let Some(mp_id) = *mp_id else { continue };
                    if map.associate(kf_id, idx, mp_id) {
                        map.update_map_point_normal_and_depth(mp_id);
                        map.compute_distinctive_descriptor(mp_id);
                    }
                }
                if !self.sensor.is_monocular() {
                    let created = create_close_points(&mut map, kf_id, self.th_depth);
                    self.recent_points.extend(created);
                }
                kf_id
            }
            NewKeyFrameMsg::Inserted(kf_id) => {
                let kf = map.get_keyframe(kf_id)?;
                self.recent_points.extend(kf.get_map_point_indices().map(|(_, mp_id)| mp_id));
                kf_id
            }
        };

        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            if kf.bow_vector.is_empty() {
                let (bow, feat) = shared.vocabulary.transform(&kf.descriptors, FEATURE_VECTOR_LEVELS_UP);
                kf.bow_vector = bow;
                kf.feature_vector = feat;
            }
        }
        map.update_connections(kf_id);

        let bow = map.get_keyframe(kf_id)?.bow_vector.clone();
        shared.index.write().add(kf_id, &bow);
        debug!(
            "[LocalMapping] Inserted {} ({} keyframes, {} map points)",
            kf_id,
            map.num_keyframes(),
            map.num_map_points()
        );
        Some(kf_id)
    }

    fn forward(&self, kf_id: KeyFrameId) {
        let Some(sender) = self.lc_sender.as_ref() else {
            return;
        };
        if sender.send(kf_id).is_err() {
            warn!("[LocalMapping] Loop Closing is gone, {} not forwarded", kf_id);
        }
    }
}

/// Stereo/RGB-D keyframes: unmatched features with depth become map points,
/// closest first, while they are closer than `th_depth` or fewer than
/// [`MIN_CLOSE_POINTS`] features (matched ones included) were taken.
fn create_close_points(map: &mut Map, kf_id: KeyFrameId, th_depth: f64) -> Vec<MapPointId> {
    let Some(kf) = map.get_keyframe(kf_id) else {
        return Vec::new();
    };
    let mut by_depth: Vec<(f64, usize)> = kf
        .points_cam
        .iter()
        .enumerate()
        .filter_map(|(idx, p)| p.filter(|p| p.z > 0.0).map(|p| (p.z, idx)))
        .collect();
    by_depth.sort_by(|a, b| a.0.total_cmp(&b.0));

    let pose_wc = kf.pose.clone();
    let mut taken = 0;
    let mut to_create = Vec::new();
    for (depth, idx) in by_depth {
        if depth > th_depth && taken > MIN_CLOSE_POINTS {
            break;
        }
        taken += 1;
        if kf.get_map_point(idx).is_some() {
            continue;
        }
        if let Some(p_cam) = kf.points_cam[idx] {
            to_create.push((idx, pose_wc.transform_point(&p_cam), kf.descriptors[idx]));
        }
    }

    let mut created = Vec::with_capacity(to_create.len());
    for (idx, position, descriptor) in to_create {
        let mp_id = map.create_map_point(position, descriptor, kf_id);
        map.associate(kf_id, idx, mp_id);
        map.update_map_point_normal_and_depth(mp_id);
        created.push(mp_id);
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::frame::{Descriptor, FeatureSet, KeyPoint};
    use crate::tracking::Frame;
    use crate::vocabulary::OrbVocabulary;
    use crossbeam_channel::{bounded, unbounded};
    use nalgebra::Vector3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const YAML: &str = "camera:\n  fx: 400\n  fy: 400\n  cx: 320\n  cy: 240\n  width: 640\n  height: 480\n  bf: 40\n";

    fn desc(i: usize) -> Descriptor {
        StdRng::seed_from_u64(i as u64).gen()
    }

    fn scene() -> Vec<Vector3<f64>> {
        (0..120)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.37).sin() * 1.5, (f * 0.71).cos(), 3.0 + (f * 0.13).sin().abs())
            })
            .collect()
    }

    fn stereo_frame(x: f64) -> Frame {
        let settings = Settings::from_yaml(YAML).unwrap();
        let cam = settings.camera_model();
        let pose_wc = SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(x, 0.0, 0.0));
        let pose_cw = pose_wc.inverse();
        let mut keypoints = Vec::new();
        let mut points = Vec::new();
        for p in scene() {
            let pc = pose_cw.transform_point(&p);
            let uv = cam.project(&pc).unwrap();
            keypoints.push(KeyPoint::new(uv.x, uv.y, 0));
            points.push(Some(pc));
        }
        let descriptors = (0..keypoints.len()).map(desc).collect();
        let mut frame = Frame::new(x, FeatureSet::new(keypoints, descriptors), points, &cam);
        frame.pose = Some(pose_wc);
        frame
    }

    #[test]
    fn test_create_message_inserts_and_forwards() {
        let settings = Settings::from_yaml(YAML).unwrap();
        let shared = SharedState::new(Arc::new(OrbVocabulary::default()));
        let (lc_tx, lc_rx) = unbounded();
        let (_kf_tx, kf_rx) = bounded::<NewKeyFrameMsg>(4);
        let mut mapper = LocalMapper::new(&settings, Sensor::Stereo, Some(lc_tx));

        let frame = stereo_frame(0.0);
        let msg = NewKeyFrameMsg::create(frame.to_keyframe_data().unwrap(), vec![None; frame.num_features()]);
        let kf_id = mapper.process_keyframe(msg, &shared, &kf_rx).unwrap();

        assert_eq!(lc_rx.try_recv(), Ok(kf_id));
        let map = shared.map.read();
        assert_eq!(map.num_keyframes(), 1);
        // Every feature is close (th_depth is 4 m), so every one is a point.
        assert_eq!(map.num_map_points(), 120);
        assert!(shared.index.read().contains(kf_id));
    }

    #[test]
    fn test_every_keyframe_reaches_loop_closing() {
        let settings = Settings::from_yaml(YAML).unwrap();
        let shared = SharedState::new(Arc::new(OrbVocabulary::default()));
        let (lc_tx, lc_rx) = crate::loop_closing::keyframe_queue();
        let (_kf_tx, kf_rx) = bounded::<NewKeyFrameMsg>(4);
        let mut mapper = LocalMapper::new(&settings, Sensor::Stereo, Some(lc_tx));

        // Nobody drains the queue while the keyframes come in.
        let processed: Vec<KeyFrameId> = (0..24)
            .map(|i| {
                let frame = stereo_frame(0.05 * i as f64);
                let msg = NewKeyFrameMsg::create(frame.to_keyframe_data().unwrap(), vec![None; frame.num_features()]);
                mapper.process_keyframe(msg, &shared, &kf_rx).unwrap()
            })
            .collect();

        let forwarded: Vec<KeyFrameId> = lc_rx.try_iter().collect();
        assert_eq!(forwarded, processed);
    }

    #[test]
    fn test_second_keyframe_gets_connected() {
        let settings = Settings::from_yaml(YAML).unwrap();
        let shared = SharedState::new(Arc::new(OrbVocabulary::default()));
        let (_kf_tx, kf_rx) = bounded::<NewKeyFrameMsg>(4);
        let mut mapper = LocalMapper::new(&settings, Sensor::Stereo, None);

        let first = stereo_frame(0.0);
        let msg = NewKeyFrameMsg::create(first.to_keyframe_data().unwrap(), vec![None; first.num_features()]);
        let kf1 = mapper.process_keyframe(msg, &shared, &kf_rx).unwrap();

        // The second keyframe tracked half of the first one's points.
        let second = stereo_frame(0.3);
        let mut matched = vec![None; second.num_features()];
        {
            let map = shared.map.read();
            let kf = map.get_keyframe(kf1).unwrap();
            for (slot, idx) in matched.iter_mut().zip(0..60) {
                *slot = kf.get_map_point(idx);
            }
        }
        let msg = NewKeyFrameMsg::create(second.to_keyframe_data().unwrap(), matched);
        let kf2 = mapper.process_keyframe(msg, &shared, &kf_rx).unwrap();

        let map = shared.map.read();
        let kf = map.get_keyframe(kf2).unwrap();
        assert!(kf.get_covisibility_weight(kf1) >= 60);
        assert_eq!(kf.parent_id, Some(kf1));
        // Duplicates created for the unmatched half were fused back.
        assert_eq!(map.num_map_points(), 120);
    }
}
