//! Loop verification and correction.
//!
//! Verification estimates the similarity between the current keyframe and a
//! loop candidate and grows the match set by guided search. Correction then
//! runs in two stages:
//! 1. Under the write lock: move the connected window with the loop
//!    similarity, fuse duplicated points and record the new loop links
//! 2. Three-phase essential graph optimization over the whole map:
//!    COLLECT (read lock), SOLVE (no lock), APPLY (write lock)

use std::collections::{HashMap, HashSet};

use nalgebra::Vector2;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::config::{LoopClosingSection, Sensor};
use crate::geometry::Sim3;
use crate::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::optimizer::{apply_pose_graph, collect_essential_graph, solve_pose_graph, PoseGraphConfig};
use crate::tracking::frame::{level_sigma2, CameraModel};
use crate::tracking::matching::{
    fuse_candidates, search_by_bow_keyframes, search_by_projection_sim3, search_by_sim3, CameraPose, FuseAction,
};

use super::sim3_solver::{refine_sim3, solve_sim3_ransac, Sim3Correspondence, Sim3SolverConfig};

/// Ratio test for the initial BoW matching.
const BOW_NN_RATIO: f64 = 0.75;
/// Search radius of the guided match with the estimated similarity.
const SIM3_SEARCH_RADIUS: f64 = 7.5;
/// Search radius when projecting the loop neighborhood.
const LOOP_PROJECTION_RADIUS: f64 = 10.0;
/// Search radius when fusing the loop neighborhood into the window.
const LOOP_FUSE_RADIUS: f64 = 4.0;
/// Inliers required after refining the similarity on the guided matches.
const MIN_REFINED_INLIERS: usize = 20;

/// Configuration for loop verification.
#[derive(Debug, Clone)]
pub struct LoopVerificationConfig {
    /// BoW matches needed before running RANSAC.
    pub min_bow_matches: usize,
    /// Matched points needed after projecting the loop neighborhood.
    pub min_loop_matches: usize,
    pub solver: Sim3SolverConfig,
}

impl LoopVerificationConfig {
    pub fn from_settings(section: &LoopClosingSection, sensor: Sensor) -> Self {
        Self {
            min_bow_matches: section.min_bow_matches,
            min_loop_matches: section.min_loop_matches,
            solver: Sim3SolverConfig::new(!sensor.is_monocular()),
        }
    }
}

/// A verified loop closure ready for correction.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    pub current_kf_id: KeyFrameId,
    pub loop_kf_id: KeyFrameId,
    /// Corrected world-to-camera similarity of the current keyframe.
    pub scw: Sim3,
    /// Loop-side point matched to each feature of the current keyframe.
    pub current_matches: Vec<Option<MapPointId>>,
    /// Points of the loop keyframe and its covisibles.
    pub loop_map_points: Vec<MapPointId>,
}

impl VerifiedLoop {
    pub fn num_matches(&self) -> usize {
        self.current_matches.iter().flatten().count()
    }
}

/// Outcome of a loop correction.
#[derive(Debug, Clone, Default)]
pub struct LoopCorrection {
    /// Keyframes moved by the similarity propagation.
    pub corrected_keyframes: usize,
    /// Points merged across the loop.
    pub fused_points: usize,
    /// New keyframe links created by the fusion.
    pub loop_connections: usize,
    /// Keyframes updated by the essential graph optimization.
    pub optimized_keyframes: usize,
}

/// Verify a loop candidate geometrically.
///
/// Returns `None` when the candidate does not hold up; that is a normal
/// outcome and not an error.
pub fn verify_loop_candidate(
    map: &Map,
    current_kf_id: KeyFrameId,
    loop_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &LoopVerificationConfig,
    rng: &mut StdRng,
) -> Option<VerifiedLoop> {
    let current = map.get_keyframe(current_kf_id).filter(|kf| !kf.is_bad)?;
    let candidate = map.get_keyframe(loop_kf_id).filter(|kf| !kf.is_bad)?;

    let bow_matches = search_by_bow_keyframes(current, candidate, map, BOW_NN_RATIO);
    if bow_matches.len() < config.min_bow_matches {
        debug!(
            "[LoopVerify] {} -> {}: {} BoW matches, rejected",
            current_kf_id,
            loop_kf_id,
            bow_matches.len()
        );
        return None;
    }

    let correspondences = build_correspondences(map, current, candidate, &bow_matches);
    let ransac = solve_sim3_ransac(&correspondences.items, camera, &config.solver, rng)?;

    let mut matches12: Vec<Option<MapPointId>> = vec![None; current.num_features()];
    for (k, inlier) in ransac.inlier_mask.iter().enumerate() {
        if *inlier {
            let (i1, mp2) = correspondences.pairs[k];
            matches12[i1] = Some(mp2);
        }
    }

    search_by_sim3(current, candidate, &mut matches12, &ransac.s12, map, camera, SIM3_SEARCH_RADIUS);

    // Refit on the grown match set and keep its inliers only.
    let grown: Vec<(usize, MapPointId)> = matches12
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.map(|mp| (i, mp)))
        .collect();
    let grown_corr = build_correspondences(map, current, candidate, &grown);
    let all = vec![true; grown_corr.items.len()];
    let refined = refine_sim3(&grown_corr.items, &all, camera, config.solver.fix_scale)
        .filter(|r| r.num_inliers >= MIN_REFINED_INLIERS)?;

    let mut current_matches: Vec<Option<MapPointId>> = vec![None; current.num_features()];
    for (k, inlier) in refined.inlier_mask.iter().enumerate() {
        if *inlier {
            let (i1, mp2) = grown_corr.pairs[k];
            current_matches[i1] = Some(mp2);
        }
    }

    let scw = refined.s12.compose(&Sim3::from_se3(&candidate.pose_cw()));

    let mut group: Vec<KeyFrameId> = candidate.ordered_covisibles().collect();
    group.push(loop_kf_id);
    let mut loop_map_points: Vec<MapPointId> = map.get_map_points_from_keyframes(&group).into_iter().collect();
    loop_map_points.sort_unstable();

    search_by_projection_sim3(
        current,
        &scw,
        &loop_map_points,
        &mut current_matches,
        map,
        camera,
        LOOP_PROJECTION_RADIUS,
    );

    let verified = VerifiedLoop {
        current_kf_id,
        loop_kf_id,
        scw,
        current_matches,
        loop_map_points,
    };
    let n_matches = verified.num_matches();
    if n_matches < config.min_loop_matches {
        debug!(
            "[LoopVerify] {} -> {}: {} matches after projection, rejected",
            current_kf_id, loop_kf_id, n_matches
        );
        return None;
    }
    debug!(
        "[LoopVerify] {} -> {}: accepted with {} matches (scale {:.3})",
        current_kf_id, loop_kf_id, n_matches, verified.scw.scale
    );
    Some(verified)
}

struct Correspondences {
    items: Vec<Sim3Correspondence>,
    /// `(current feature, loop point)` behind each item.
    pairs: Vec<(usize, MapPointId)>,
}

fn build_correspondences(
    map: &Map,
    current: &KeyFrame,
    candidate: &KeyFrame,
    pairs: &[(usize, MapPointId)],
) -> Correspondences {
    let t1w = current.pose_cw();
    let t2w = candidate.pose_cw();
    let mut out = Correspondences {
        items: Vec::with_capacity(pairs.len()),
        pairs: Vec::with_capacity(pairs.len()),
    };

    for &(i1, mp2_id) in pairs {
        let Some(mp1) = current.get_map_point(i1).and_then(|id| map.get_map_point(id)) else {
            continue;
        };
        let Some(mp2) = map.get_map_point(mp2_id) else {
            continue;
        };
        let Some(i2) = candidate.feature_of(mp2_id) else {
            continue;
        };
        if mp1.is_bad || mp2.is_bad {
            continue;
        }
        let kp1 = &current.keypoints[i1];
        let kp2 = &candidate.keypoints[i2];
        out.items.push(Sim3Correspondence {
            p1: t1w.transform_point(&mp1.position),
            p2: t2w.transform_point(&mp2.position),
            uv1: Vector2::new(kp1.x, kp1.y),
            uv2: Vector2::new(kp2.x, kp2.y),
            sigma2_1: level_sigma2(kp1.octave),
            sigma2_2: level_sigma2(kp2.octave),
        });
        out.pairs.push((i1, mp2_id));
    }
    out
}

/// Correct the map for a verified loop.
///
/// Local Mapping must be stopped by the caller. `should_stop` is polled by
/// the pose graph solver.
pub fn correct_loop(
    map_lock: &RwLock<Map>,
    verified: &VerifiedLoop,
    camera: &CameraModel,
    pose_graph_config: &PoseGraphConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<LoopCorrection> {
    let mut correction = LoopCorrection::default();

    let (loop_connections, non_corrected, corrected_by) = {
        let mut map = map_lock.write();
        propagate_and_fuse(&mut map, verified, camera, &mut correction)?
    };

    // PHASE 1: COLLECT
    let graph = {
        let map = map_lock.read();
        collect_essential_graph(
            &map,
            verified.loop_kf_id,
            &loop_connections,
            &non_corrected,
            pose_graph_config,
        )
    };

    if let Some(graph) = graph {
        // PHASE 2: SOLVE
        let result = solve_pose_graph(&graph, pose_graph_config, should_stop);
        debug!(
            "[PoseGraph] {} keyframes, {} edges, error {:.4} -> {:.4} in {} iterations",
            graph.kf_ids.len(),
            graph.edges.len(),
            result.initial_error,
            result.final_error,
            result.iterations
        );

        // PHASE 3: APPLY
        let mut map = map_lock.write();
        correction.optimized_keyframes = apply_pose_graph(&mut map, &graph, &result, &corrected_by);
    }

    info!(
        "[LoopClosing] Loop {} -> {} corrected: {} keyframes moved, {} points fused, {} new links",
        verified.current_kf_id,
        verified.loop_kf_id,
        correction.corrected_keyframes,
        correction.fused_points,
        correction.loop_connections
    );
    Some(correction)
}

type LoopConnections = HashMap<KeyFrameId, HashSet<KeyFrameId>>;

/// Move the current keyframe's connected window onto the loop, fuse the
/// loop neighborhood into it and add the loop edge. Returns the new loop
/// links, the pre-correction `S_wc` of every moved keyframe and the keyframe
/// whose correction moved each point.
fn propagate_and_fuse(
    map: &mut Map,
    verified: &VerifiedLoop,
    camera: &CameraModel,
    correction: &mut LoopCorrection,
) -> Option<(LoopConnections, HashMap<KeyFrameId, Sim3>, HashMap<MapPointId, KeyFrameId>)> {
    let current_id = verified.current_kf_id;
    if !map.contains_keyframe(verified.loop_kf_id) {
        return None;
    }
    map.update_connections(current_id);

    let current = map.get_keyframe(current_id)?;
    let mut connected: Vec<KeyFrameId> = current.ordered_covisibles().collect();
    connected.push(current_id);
    let t_wc_current = current.pose.clone();

    // Corrected and uncorrected S_iw for the window.
    let mut corrected_siw: HashMap<KeyFrameId, Sim3> = HashMap::new();
    let mut non_corrected_siw: HashMap<KeyFrameId, Sim3> = HashMap::new();
    for &id in &connected {
        let Some(kf) = map.get_keyframe(id) else { continue };
        let t_iw = kf.pose_cw();
        let corrected = if id == current_id {
            verified.scw.clone()
        } else {
            Sim3::from_se3(&t_iw.compose(&t_wc_current)).compose(&verified.scw)
        };
        corrected_siw.insert(id, corrected);
        non_corrected_siw.insert(id, Sim3::from_se3(&t_iw));
    }

    // Points first: each one moves with the first window keyframe seeing it.
    let mut corrected_by: HashMap<MapPointId, KeyFrameId> = HashMap::new();
    for &id in &connected {
        let (Some(s_corr), Some(s_old)) = (corrected_siw.get(&id), non_corrected_siw.get(&id)) else {
            continue;
        };
        let s_corr_inv = s_corr.inverse();
        let points: Vec<MapPointId> = match map.get_keyframe(id) {
            Some(kf) => kf.get_map_point_indices().map(|(_, mp)| mp).collect(),
            None => continue,
        };
        for mp_id in points {
            if corrected_by.contains_key(&mp_id) {
                continue;
            }
            if let Some(mp) = map.get_map_point_mut(mp_id) {
                mp.position = s_corr_inv.transform_point(&s_old.transform_point(&mp.position));
                corrected_by.insert(mp_id, id);
            }
        }
    }

    for (&id, s_iw) in &corrected_siw {
        if let Some(kf) = map.get_keyframe_mut(id) {
            kf.pose = s_iw.inverse().to_se3();
            correction.corrected_keyframes += 1;
        }
    }
    for &mp_id in corrected_by.keys() {
        map.update_map_point_normal_and_depth(mp_id);
    }
    for &id in &connected {
        map.update_connections(id);
    }

    // Matched loop points replace the current keyframe's own.
    for (idx, loop_mp) in verified.current_matches.iter().enumerate() {
        let Some(loop_mp) = *loop_mp else { continue };
        if !map.contains_map_point(loop_mp) {
            continue;
        }
        match map.get_keyframe(current_id).and_then(|kf| kf.get_map_point(idx)) {
            Some(existing) if existing == loop_mp => {}
            Some(existing) => {
                if map.replace(existing, loop_mp) {
                    correction.fused_points += 1;
                }
            }
            None => {
                if map.associate(current_id, idx, loop_mp) {
                    map.compute_distinctive_descriptor(loop_mp);
                }
            }
        }
    }

    // Loop neighborhood into every window keyframe.
    for &id in &connected {
        let Some(s_iw) = corrected_siw.get(&id) else { continue };
        let actions = match map.get_keyframe(id) {
            Some(kf) => fuse_candidates(
                kf,
                &CameraPose::from_scw(s_iw),
                &verified.loop_map_points,
                map,
                camera,
                LOOP_FUSE_RADIUS,
            ),
            None => continue,
        };
        for action in actions {
            match action {
                FuseAction::Merge { existing, candidate } => {
                    if map.contains_map_point(candidate) && map.replace(existing, candidate) {
                        correction.fused_points += 1;
                    }
                }
                FuseAction::Associate { feature_idx, candidate } => {
                    let free = map
                        .get_keyframe(id)
                        .is_some_and(|kf| kf.get_map_point(feature_idx).is_none());
                    if free {
                        map.associate(id, feature_idx, candidate);
                    }
                }
            }
        }
    }

    // Links that exist only because of the fusion.
    let window: HashSet<KeyFrameId> = connected.iter().copied().collect();
    let mut loop_connections: LoopConnections = HashMap::new();
    for &id in &connected {
        let previous: HashSet<KeyFrameId> = match map.get_keyframe(id) {
            Some(kf) => kf.ordered_covisibles().collect(),
            None => continue,
        };
        map.update_connections(id);
        let Some(kf) = map.get_keyframe(id) else { continue };
        let links: HashSet<KeyFrameId> = kf
            .ordered_covisibles()
            .filter(|other| !previous.contains(other) && !window.contains(other))
            .collect();
        if !links.is_empty() {
            correction.loop_connections += links.len();
            loop_connections.insert(id, links);
        }
    }

    map.add_loop_edge(verified.loop_kf_id, current_id);

    let non_corrected: HashMap<KeyFrameId, Sim3> = non_corrected_siw
        .into_iter()
        .map(|(id, s_iw)| (id, s_iw.inverse()))
        .collect();
    Some((loop_connections, non_corrected, corrected_by))
}
