//! Map point and keyframe culling.

use tracing::debug;

use crate::map::{KeyFrameId, Map, MapPointId, PlaceRecognitionIndex};

/// Keyframes a recent point gets before its observation count is checked.
const RECENT_GRACE_KEYFRAMES: u64 = 2;
/// After this many keyframes a point leaves the recent list for good.
const RECENT_WINDOW_KEYFRAMES: u64 = 3;

/// Observers (besides the keyframe itself) that make a point redundant.
const REDUNDANT_OBSERVERS: usize = 3;

/// Cull points created recently that are not being re-observed.
///
/// A point is erased when its found ratio drops below `min_found_ratio`, or
/// when it has fewer than 2 (monocular) / 3 observations once
/// [`RECENT_GRACE_KEYFRAMES`] keyframes have passed since its creation.
/// Observations from keyframe slots with depth count twice
/// ([`Map::weighted_observations`]).
/// Returns the number of erased points; `recent` keeps only points still in
/// their probation window.
pub fn cull_recent_map_points(
    map: &mut Map,
    recent: &mut Vec<MapPointId>,
    current_kf_id: KeyFrameId,
    monocular: bool,
    min_found_ratio: f64,
) -> usize {
    let min_observations = if monocular { 2 } else { 3 };
    let mut erased = 0;

    recent.retain(|&mp_id| {
        let Some(mp) = map.get_map_point(mp_id) else {
            return false;
        };
        let age = current_kf_id.0.saturating_sub(mp.first_kf_id.0);
        let cull = mp.is_bad
            || mp.found_ratio() < min_found_ratio
            || (age >= RECENT_GRACE_KEYFRAMES && map.weighted_observations(mp_id) < min_observations);
        if cull {
            map.erase_map_point(mp_id);
            erased += 1;
            return false;
        }
        age < RECENT_WINDOW_KEYFRAMES
    });

    if erased > 0 {
        debug!(
            "[MapCulling] Removed {} recent map points ({} still on probation)",
            erased,
            recent.len()
        );
    }
    erased
}

/// Erase covisible keyframes of `current_kf_id` whose points are mostly seen
/// elsewhere.
///
/// A keyframe is redundant when at least `redundant_ratio` of its points are
/// observed by [`REDUNDANT_OBSERVERS`] other keyframes at the same or a
/// finer scale. For stereo/RGB-D only close points (`depth <= th_depth`)
/// take part. The origin keyframe is never erased. The keyframe leaves the
/// map and the index in the same step, so callers must hold both locks.
pub fn cull_keyframes(
    map: &mut Map,
    index: &mut PlaceRecognitionIndex,
    current_kf_id: KeyFrameId,
    monocular: bool,
    th_depth: f64,
    redundant_ratio: f64,
) -> Vec<KeyFrameId> {
    let Some(current) = map.get_keyframe(current_kf_id) else {
        return Vec::new();
    };
    let origin = map.origin_keyframe_id();
    let mut local: Vec<KeyFrameId> = current.ordered_covisibles().collect();
    local.sort_unstable();

    // Erase as we go: every removal lowers the observer counts seen by the
    // next candidate.
    let mut erased = Vec::new();
    for kf_id in local {
        if kf_id == current_kf_id || Some(kf_id) == origin {
            continue;
        }
        if is_redundant(map, kf_id, monocular, th_depth, redundant_ratio) && map.erase_keyframe(kf_id) {
            index.erase(kf_id);
            erased.push(kf_id);
        }
    }
    if !erased.is_empty() {
        debug!(
            "[KFCulling] Removed {} redundant keyframes (remaining: {})",
            erased.len(),
            map.num_keyframes()
        );
    }
    erased
}

fn is_redundant(map: &Map, kf_id: KeyFrameId, monocular: bool, th_depth: f64, redundant_ratio: f64) -> bool {
    let Some(kf) = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
        return false;
    };

    let mut total = 0usize;
    let mut redundant = 0usize;
    for (idx, mp_id) in kf.get_map_point_indices() {
        let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        if !monocular {
            match kf.points_cam.get(idx).copied().flatten() {
                Some(p) if p.z > 0.0 && p.z <= th_depth => {}
                _ => continue,
            }
        }
        total += 1;
        if mp.num_observations() <= REDUNDANT_OBSERVERS {
            continue;
        }

        let level = kf.keypoints[idx].octave;
        let finer_observers = mp
            .observations()
            .iter()
            .filter(|(&other, &other_idx)| {
                other != kf_id
                    && map
                        .get_keyframe(other)
                        .and_then(|o| o.keypoints.get(other_idx))
                        .is_some_and(|kp| kp.octave <= level + 1)
            })
            .count();
        if finer_observers >= REDUNDANT_OBSERVERS {
            redundant += 1;
        }
    }

    total > 0 && redundant as f64 >= redundant_ratio * total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::KeyPoint;
    use crate::tracking::FeatureGrid;
    use crate::vocabulary::{BowVector, FeatureVector};
    use nalgebra::Vector3;

    fn data(n: usize, x: f64) -> KeyFrameData {
        let keypoints: Vec<KeyPoint> = (0..n).map(|i| KeyPoint::new(10.0 + i as f64, 20.0, 0)).collect();
        let grid = FeatureGrid::new(&keypoints, 640.0, 480.0);
        let mut bow = BowVector::new();
        bow.insert(1, 1.0);
        KeyFrameData {
            timestamp: x,
            pose: SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(x, 0.0, 0.0)),
            keypoints,
            descriptors: vec![[0u8; 32]; n],
            points_cam: vec![],
            bow_vector: bow,
            feature_vector: FeatureVector::new(),
            grid,
        }
    }

    #[test]
    fn test_recent_points_culled_by_observations() {
        let mut map = Map::new();
        let kfs: Vec<KeyFrameId> = (0..4).map(|i| map.create_keyframe(data(10, i as f64))).collect();
        let weak = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        map.associate(kfs[0], 0, weak);
        let strong = map.create_map_point(Vector3::new(1.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        for &kf in &kfs[..3] {
            map.associate(kf, 1, strong);
        }
        let mut recent = vec![weak, strong];

        // Still within the grace window: nothing happens.
        assert_eq!(cull_recent_map_points(&mut map, &mut recent, kfs[1], true, 0.25), 0);
        assert_eq!(recent.len(), 2);

        assert_eq!(cull_recent_map_points(&mut map, &mut recent, kfs[2], true, 0.25), 1);
        assert!(!map.contains_map_point(weak));
        assert_eq!(recent, vec![strong]);

        // Old enough to leave the list, but kept in the map.
        cull_recent_map_points(&mut map, &mut recent, kfs[3], true, 0.25);
        assert!(recent.is_empty());
        assert!(map.contains_map_point(strong));
    }

    #[test]
    fn test_stereo_observations_count_twice() {
        let mut map = Map::new();
        let kfs: Vec<KeyFrameId> = (0..3)
            .map(|i| {
                let mut kf = data(10, i as f64);
                kf.points_cam = vec![Some(Vector3::new(0.0, 0.0, 5.0)); 10];
                map.create_keyframe(kf)
            })
            .collect();
        let single = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        map.associate(kfs[0], 0, single);
        let pair = map.create_map_point(Vector3::new(1.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        map.associate(kfs[0], 1, pair);
        map.associate(kfs[1], 1, pair);
        let mut recent = vec![single, pair];

        // Two stereo views of `pair` weigh 4, one of `single` only 2.
        assert_eq!(cull_recent_map_points(&mut map, &mut recent, kfs[2], false, 0.25), 1);
        assert!(!map.contains_map_point(single));
        assert!(map.contains_map_point(pair));
    }

    #[test]
    fn test_low_found_ratio_culled() {
        let mut map = Map::new();
        let kf = map.create_keyframe(data(4, 0.0));
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kf);
        map.associate(kf, 0, mp);
        map.get_map_point_mut(mp).unwrap().increase_visible(9);
        let mut recent = vec![mp];

        assert_eq!(cull_recent_map_points(&mut map, &mut recent, kf, false, 0.25), 1);
        assert!(recent.is_empty());
    }

    #[test]
    fn test_redundant_keyframe_culled_but_not_origin() {
        let mut map = Map::new();
        let mut index = PlaceRecognitionIndex::new();
        let kfs: Vec<KeyFrameId> = (0..5).map(|i| map.create_keyframe(data(20, i as f64))).collect();
        for &kf in &kfs {
            index.add(kf, &map.get_keyframe(kf).unwrap().bow_vector.clone());
        }
        for i in 0..20 {
            let mp = map.create_map_point(Vector3::new(i as f64, 0.0, 5.0), [0u8; 32], kfs[0]);
            for &kf in &kfs {
                map.associate(kf, i, mp);
            }
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }

        let erased = cull_keyframes(&mut map, &mut index, kfs[4], true, 0.0, 0.9);

        // Five observers per point: KF1 and KF2 go, after which the points
        // are down to three observers and KF3 is no longer redundant.
        assert_eq!(erased, vec![kfs[1], kfs[2]]);
        for kf in &erased {
            assert!(!map.contains_keyframe(*kf));
            assert!(!index.references(*kf));
        }
        assert!(map.contains_keyframe(kfs[0]));
    }
}
