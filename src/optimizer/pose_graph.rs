//! Pose Graph Optimization for Loop Closing.
//!
//! Optimizes the Essential Graph (spanning tree + loop edges + strong
//! covisibility) using Sim3 constraints. For stereo and RGB-D the scale is
//! fixed to 1.0; monocular maps let it float.
//!
//! Vertices are camera-to-world similarities `S_wc`. An edge `i → j`
//! measures `S_ij = S_wi⁻¹ S_wj`; its residual is `log(S_ij⁻¹ S_wi⁻¹ S_wj)`.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Extract poses and edges from the map
//! 2. SOLVE: Run LM optimization without locks
//! 3. APPLY: Write back optimized poses and move map points with their
//!    reference keyframe

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::config::{Sensor, Settings};
use crate::geometry::Sim3;
use crate::map::{KeyFrameId, Map, MapPointId};

/// Configuration for pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,

    /// Minimum covisibility weight to include as edge.
    pub min_covisibility_weight: usize,

    /// Whether to fix scale (true for stereo and RGB-D).
    pub fix_scale: bool,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            min_covisibility_weight: 100,
            fix_scale: true,
        }
    }
}

impl PoseGraphConfig {
    pub fn from_settings(settings: &Settings, sensor: Sensor) -> Self {
        Self {
            max_iterations: settings.loop_closing.pose_graph_iterations,
            min_covisibility_weight: settings.loop_closing.essential_graph_weight,
            fix_scale: !sensor.is_monocular(),
        }
    }
}

/// Type of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    SpanningTree,
    LoopClosure,
    Covisibility,
}

/// A pose graph edge between two vertex indices.
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub i: usize,
    pub j: usize,
    /// Relative similarity `S_wi⁻¹ S_wj`.
    pub measurement: Sim3,
    pub edge_type: EdgeType,
}

/// Data extracted for pose graph optimization.
#[derive(Debug, Clone)]
pub struct EssentialGraph {
    pub kf_ids: Vec<KeyFrameId>,
    /// Initial `S_wc` per vertex.
    pub initial_poses: Vec<Sim3>,
    pub fixed: Vec<bool>,
    pub edges: Vec<PoseGraphEdge>,
    pub fix_scale: bool,
}

impl EssentialGraph {
    pub fn count_edges(&self, edge_type: EdgeType) -> usize {
        self.edges.iter().filter(|e| e.edge_type == edge_type).count()
    }
}

/// Result of pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    /// Optimized `S_wc` per vertex, same order as [`EssentialGraph::kf_ids`].
    pub optimized_poses: Vec<Sim3>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// PHASE 1: Collect the essential graph of the whole map.
///
/// - `loop_kf_id` is held fixed.
/// - `loop_connections` are the links created by the loop fusion; they are
///   measured with the current (corrected) poses.
/// - `non_corrected` holds the pre-correction `S_wc` of keyframes moved by
///   the loop correction; every other edge is measured with these when
///   available so the old relative motion is preserved.
pub fn collect_essential_graph(
    map: &Map,
    loop_kf_id: KeyFrameId,
    loop_connections: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    non_corrected: &HashMap<KeyFrameId, Sim3>,
    config: &PoseGraphConfig,
) -> Option<EssentialGraph> {
    let kf_ids: Vec<KeyFrameId> = map
        .keyframe_ids()
        .into_iter()
        .filter(|id| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad))
        .collect();
    if kf_ids.len() < 2 {
        return None;
    }
    let index: HashMap<KeyFrameId, usize> =
        kf_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut initial_poses = Vec::with_capacity(kf_ids.len());
    let mut fixed = Vec::with_capacity(kf_ids.len());
    for id in &kf_ids {
        let kf = map.get_keyframe(*id)?;
        initial_poses.push(Sim3::from_se3(&kf.pose));
        fixed.push(*id == loop_kf_id);
    }
    if !fixed.iter().any(|f| *f) {
        fixed[0] = true;
    }

    let measured_pose = |id: KeyFrameId| -> Sim3 {
        non_corrected
            .get(&id)
            .cloned()
            .unwrap_or_else(|| initial_poses[index[&id]].clone())
    };

    let mut edges = Vec::new();
    let mut inserted: HashSet<(usize, usize)> = HashSet::new();
    let mut push_edge = |edges: &mut Vec<PoseGraphEdge>, i: usize, j: usize, measurement: Sim3, edge_type| {
        let key = (i.min(j), i.max(j));
        if i != j && inserted.insert(key) {
            edges.push(PoseGraphEdge {
                i,
                j,
                measurement,
                edge_type,
            });
        }
    };

    // New loop links, measured with corrected poses.
    let mut sources: Vec<&KeyFrameId> = loop_connections.keys().collect();
    sources.sort();
    for a in sources {
        let mut targets: Vec<&KeyFrameId> = loop_connections[a].iter().collect();
        targets.sort();
        for b in targets {
            let (Some(&i), Some(&j)) = (index.get(a), index.get(b)) else {
                continue;
            };
            let m = initial_poses[i].inverse().compose(&initial_poses[j]);
            push_edge(&mut edges, i, j, m, EdgeType::LoopClosure);
        }
    }

    for (j, &id) in kf_ids.iter().enumerate() {
        let Some(kf) = map.get_keyframe(id) else {
            continue;
        };
        let pose_j = measured_pose(id);

        if let Some(&i) = kf.parent_id.as_ref().and_then(|p| index.get(p)) {
            let m = measured_pose(kf_ids[i]).inverse().compose(&pose_j);
            push_edge(&mut edges, i, j, m, EdgeType::SpanningTree);
        }

        let mut loops: Vec<KeyFrameId> = kf.loop_edges.iter().copied().filter(|l| *l < id).collect();
        loops.sort();
        for l in loops {
            if let Some(&i) = index.get(&l) {
                let m = measured_pose(l).inverse().compose(&pose_j);
                push_edge(&mut edges, i, j, m, EdgeType::LoopClosure);
            }
        }

        for other in kf.get_covisibles_above_weight(config.min_covisibility_weight) {
            if other >= id || kf.parent_id == Some(other) || kf.children_ids.contains(&other) {
                continue;
            }
            if let Some(&i) = index.get(&other) {
                let m = measured_pose(other).inverse().compose(&pose_j);
                push_edge(&mut edges, i, j, m, EdgeType::Covisibility);
            }
        }
    }

    Some(EssentialGraph {
        kf_ids,
        initial_poses,
        fixed,
        edges,
        fix_scale: config.fix_scale,
    })
}

/// Edge residual, truncated to the optimized dimensions.
fn edge_error(edge: &PoseGraphEdge, poses: &[Sim3], dim: usize) -> DVector<f64> {
    let predicted = poses[edge.i].inverse().compose(&poses[edge.j]);
    let err = edge.measurement.inverse().compose(&predicted).log();
    DVector::from_iterator(dim, err.into_iter().take(dim))
}

fn total_error(edges: &[PoseGraphEdge], poses: &[Sim3], dim: usize) -> f64 {
    edges.iter().map(|e| edge_error(e, poses, dim).norm_squared()).sum()
}

fn retract(pose: &Sim3, delta: &[f64], dim: usize) -> Sim3 {
    let mut tangent = [0.0; 7];
    tangent[..dim].copy_from_slice(&delta[..dim]);
    pose.retract(&tangent)
}

/// PHASE 2: Solve pose graph optimization.
pub fn solve_pose_graph(
    graph: &EssentialGraph,
    config: &PoseGraphConfig,
    should_stop: &dyn Fn() -> bool,
) -> PoseGraphResult {
    let dim = if graph.fix_scale { 6 } else { 7 };
    let mut poses = graph.initial_poses.clone();

    let mut col: Vec<Option<usize>> = vec![None; poses.len()];
    let mut n_free = 0;
    for (i, f) in graph.fixed.iter().enumerate() {
        if !f {
            col[i] = Some(n_free);
            n_free += 1;
        }
    }

    let initial_error = total_error(&graph.edges, &poses, dim);
    let mut current_error = initial_error;
    let mut lambda = 1e-3;
    let mut iterations = 0;
    let eps = 1e-6;

    for iter in 0..config.max_iterations {
        if should_stop() || n_free == 0 {
            break;
        }
        iterations = iter + 1;

        let n = n_free * dim;
        let mut h = DMatrix::<f64>::zeros(n, n);
        let mut b = DVector::<f64>::zeros(n);

        for edge in &graph.edges {
            let r0 = edge_error(edge, &poses, dim);
            // Numeric Jacobians through the retraction of each endpoint
            let mut blocks: Vec<(usize, DMatrix<f64>)> = Vec::with_capacity(2);
            for vertex in [edge.i, edge.j] {
                let Some(c) = col[vertex] else { continue };
                let mut jac = DMatrix::<f64>::zeros(dim, dim);
                for k in 0..dim {
                    let mut delta = [0.0; 7];
                    delta[k] = eps;
                    let mut perturbed = poses.clone();
                    perturbed[vertex] = retract(&poses[vertex], &delta, dim);
                    let r1 = edge_error(edge, &perturbed, dim);
                    jac.set_column(k, &((r1 - &r0) / eps));
                }
                blocks.push((c, jac));
            }

            for (ca, ja) in &blocks {
                let mut bv = b.rows_mut(ca * dim, dim);
                bv -= ja.transpose() * &r0;
                for (cb, jb) in &blocks {
                    let mut hv = h.view_mut((ca * dim, cb * dim), (dim, dim));
                    hv += ja.transpose() * jb;
                }
            }
        }

        for i in 0..n {
            h[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }
        let delta = match h.clone().cholesky() {
            Some(chol) => chol.solve(&b),
            None => match h.lu().solve(&b) {
                Some(d) => d,
                None => break,
            },
        };

        let mut trial = poses.clone();
        for (v, c) in col.iter().enumerate() {
            if let Some(c) = c {
                let d: Vec<f64> = delta.rows(c * dim, dim).iter().copied().collect();
                trial[v] = retract(&poses[v], &d, dim);
            }
        }
        let trial_error = total_error(&graph.edges, &trial, dim);

        if trial_error < current_error {
            let relative = (current_error - trial_error) / current_error.max(1e-12);
            poses = trial;
            current_error = trial_error;
            lambda = (lambda * 0.1).max(1e-10);
            if relative < 1e-8 {
                break;
            }
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    PoseGraphResult {
        optimized_poses: poses,
        iterations,
        initial_error,
        final_error: current_error,
    }
}

/// PHASE 3: Write optimized poses back and move each map point with the
/// keyframe that anchors it.
///
/// Points listed in `corrected_by` were already moved by the loop correction
/// and follow that keyframe instead of their reference keyframe. Keyframes
/// and points created after collection are left as they are.
pub fn apply_pose_graph(
    map: &mut Map,
    graph: &EssentialGraph,
    result: &PoseGraphResult,
    corrected_by: &HashMap<MapPointId, KeyFrameId>,
) -> usize {
    let index: HashMap<KeyFrameId, usize> =
        graph.kf_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut updated = 0;
    for mp_id in map.map_point_ids() {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        if mp.is_bad {
            continue;
        }
        let anchor = corrected_by.get(&mp_id).copied().unwrap_or(mp.ref_kf_id);
        let Some(&i) = index.get(&anchor) else {
            continue;
        };
        // S_wc(opt) * S_cw(before)
        let correction = result.optimized_poses[i].compose(&graph.initial_poses[i].inverse());
        let corrected = correction.transform_point(&mp.position);
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = corrected;
        }
        map.update_map_point_normal_and_depth(mp_id);
    }

    for (i, kf_id) in graph.kf_ids.iter().enumerate() {
        match map.get_keyframe_mut(*kf_id) {
            Some(kf) if !kf.is_bad => {
                kf.pose = result.optimized_poses[i].to_se3();
                updated += 1;
            }
            _ => debug!("[PoseGraph] {} vanished during optimization", kf_id),
        }
    }

    updated
}
