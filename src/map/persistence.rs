//! Map persistence: a versioned binary snapshot of the whole graph.
//!
//! Layout: 8-byte magic, little-endian `u32` version, then the bincode body.
//! Loading validates referential integrity before handing back a [`Map`],
//! so a corrupt file never yields a partially reconstructed map.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SlamError};

use super::keyframe::KeyFrame;
use super::map::ErasedKeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};
use super::Map;

pub const MAP_MAGIC: &[u8; 8] = b"VSLAMMAP";
pub const MAP_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MapSnapshot {
    next_kf_id: u64,
    next_mp_id: u64,
    last_keyframe_id: Option<KeyFrameId>,
    origin_kf_id: Option<KeyFrameId>,
    keyframes: Vec<KeyFrame>,
    map_points: Vec<MapPoint>,
    erased_keyframes: Vec<(KeyFrameId, ErasedKeyFrame)>,
}

impl MapSnapshot {
    fn capture(map: &Map) -> Self {
        let mut keyframes: Vec<KeyFrame> = map.keyframes.values().cloned().collect();
        keyframes.sort_by_key(|kf| kf.id);
        let mut map_points: Vec<MapPoint> = map.map_points.values().cloned().collect();
        map_points.sort_by_key(|mp| mp.id);
        let mut erased_keyframes: Vec<(KeyFrameId, ErasedKeyFrame)> = map
            .erased_keyframes
            .iter()
            .map(|(id, rec)| (*id, rec.clone()))
            .collect();
        erased_keyframes.sort_by_key(|(id, _)| *id);

        Self {
            next_kf_id: map.next_kf_id,
            next_mp_id: map.next_mp_id,
            last_keyframe_id: map.last_keyframe_id,
            origin_kf_id: map.origin_kf_id,
            keyframes,
            map_points,
            erased_keyframes,
        }
    }

    fn into_map(self) -> Map {
        let mut map = Map::new();
        map.next_kf_id = self.next_kf_id;
        map.next_mp_id = self.next_mp_id;
        map.last_keyframe_id = self.last_keyframe_id;
        map.origin_kf_id = self.origin_kf_id;
        map.keyframes = self.keyframes.into_iter().map(|kf| (kf.id, kf)).collect();
        map.map_points = self.map_points.into_iter().map(|mp| (mp.id, mp)).collect();
        map.erased_keyframes = self.erased_keyframes.into_iter().collect();
        map
    }
}

/// Write `map` to `writer`.
pub fn write_map<W: Write>(map: &Map, mut writer: W) -> Result<()> {
    writer.write_all(MAP_MAGIC)?;
    writer.write_all(&MAP_FORMAT_VERSION.to_le_bytes())?;
    bincode::serialize_into(&mut writer, &MapSnapshot::capture(map))?;
    writer.flush()?;
    Ok(())
}

/// Read and validate a map written by [`write_map`].
pub fn read_map<R: Read>(mut reader: R) -> Result<Map> {
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|e| SlamError::MapFormat(format!("missing header: {}", e)))?;
    if &magic != MAP_MAGIC {
        return Err(SlamError::MapFormat("bad magic number".into()));
    }

    let mut version = [0u8; 4];
    reader
        .read_exact(&mut version)
        .map_err(|e| SlamError::MapFormat(format!("missing version: {}", e)))?;
    let version = u32::from_le_bytes(version);
    if version != MAP_FORMAT_VERSION {
        return Err(SlamError::MapFormat(format!(
            "unsupported version {} (expected {})",
            version, MAP_FORMAT_VERSION
        )));
    }

    let snapshot: MapSnapshot = bincode::deserialize_from(&mut reader)
        .map_err(|e| SlamError::MapFormat(format!("corrupt body: {}", e)))?;
    let map = snapshot.into_map();
    validate(&map)?;
    Ok(map)
}

pub fn save_map(map: &Map, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    write_map(map, BufWriter::new(file))?;
    info!(
        "[Map] Saved {} keyframes, {} map points to {}",
        map.num_keyframes(),
        map.num_map_points(),
        path.display()
    );
    Ok(())
}

pub fn load_map(path: &Path) -> Result<Map> {
    let file = File::open(path)?;
    let map = read_map(BufReader::new(file))?;
    info!(
        "[Map] Loaded {} keyframes, {} map points from {}",
        map.num_keyframes(),
        map.num_map_points(),
        path.display()
    );
    Ok(map)
}

fn format_error(msg: String) -> SlamError {
    SlamError::MapFormat(msg)
}

/// Every id referenced by the graph must exist and the KF ↔ MP slots must
/// agree in both directions.
fn validate(map: &Map) -> Result<()> {
    let kf_exists = |id: &KeyFrameId| map.keyframes.contains_key(id);

    for id in [map.last_keyframe_id, map.origin_kf_id].into_iter().flatten() {
        if !kf_exists(&id) {
            return Err(format_error(format!("dangling keyframe reference {}", id)));
        }
    }

    for (id, kf) in &map.keyframes {
        if *id != kf.id || kf.id.0 >= map.next_kf_id {
            return Err(format_error(format!("inconsistent keyframe id {}", kf.id)));
        }
        if kf.descriptors.len() != kf.num_features()
            || kf.map_point_slots().len() != kf.num_features()
        {
            return Err(format_error(format!("{} has mismatched feature arrays", kf.id)));
        }
        let linked = kf
            .prev_kf
            .iter()
            .chain(kf.next_kf.iter())
            .chain(kf.parent_id.iter())
            .chain(kf.children_ids.iter())
            .chain(kf.loop_edges.iter())
            .chain(kf.covisibility_weights().keys());
        for other in linked {
            if !kf_exists(other) {
                return Err(format_error(format!("{} references missing {}", kf.id, other)));
            }
        }
        for (idx, mp_id) in kf.get_map_point_indices() {
            let observed = map
                .map_points
                .get(&mp_id)
                .and_then(|mp| mp.observations.get(id))
                .is_some_and(|&slot| slot == idx);
            if !observed {
                return Err(format_error(format!(
                    "{} slot {} points to {} without a matching observation",
                    kf.id, idx, mp_id
                )));
            }
        }
    }

    for (id, mp) in &map.map_points {
        if *id != mp.id || mp.id.0 >= map.next_mp_id {
            return Err(format_error(format!("inconsistent map point id {}", mp.id)));
        }
        for (kf_id, &idx) in &mp.observations {
            let slot: Option<MapPointId> = map
                .keyframes
                .get(kf_id)
                .and_then(|kf| kf.get_map_point(idx));
            if slot != Some(*id) {
                return Err(format_error(format!(
                    "{} observation in {} is not mirrored",
                    mp.id, kf_id
                )));
            }
        }
    }

    for (id, rec) in &map.erased_keyframes {
        if kf_exists(id) {
            return Err(format_error(format!("{} is both live and erased", id)));
        }
        if !kf_exists(&rec.parent) && !map.erased_keyframes.contains_key(&rec.parent) {
            return Err(format_error(format!("erased {} has unknown parent", id)));
        }
    }

    Ok(())
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

    fn sample_map() -> Map {
        let mut map = Map::new();
        let mut kfs = Vec::new();
        for i in 0..3 {
            let keypoints: Vec<KeyPoint> =
                (0..30).map(|j| KeyPoint::new(j as f64 * 5.0, 40.0, 0)).collect();
            let grid = FeatureGrid::new(&keypoints, 640.0, 480.0);
            let mut bow = BowVector::new();
            bow.insert(i as u32, 1.0);
            kfs.push(map.create_keyframe(KeyFrameData {
                timestamp: i as f64,
                pose: SE3::identity(),
                keypoints,
                descriptors: vec![[i as u8; 32]; 30],
                points_cam: vec![],
                bow_vector: bow,
                feature_vector: FeatureVector::new(),
                grid,
            }));
        }
        for j in 0..20 {
            let mp = map.create_map_point(Vector3::new(j as f64, 0.0, 4.0), [0u8; 32], kfs[0]);
            for &kf in &kfs {
                map.associate(kf, j, mp);
            }
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }
        map
    }

    #[test]
    fn test_roundtrip_preserves_graph() {
        let map = sample_map();
        let mut bytes = Vec::new();
        write_map(&map, &mut bytes).unwrap();

        let loaded = read_map(bytes.as_slice()).unwrap();
        assert_eq!(loaded.num_keyframes(), map.num_keyframes());
        assert_eq!(loaded.num_map_points(), map.num_map_points());
        assert_eq!(loaded.num_covisibility_edges(), map.num_covisibility_edges());
        assert_eq!(loaded.origin_keyframe_id(), map.origin_keyframe_id());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = Vec::new();
        write_map(&sample_map(), &mut bytes).unwrap();
        bytes[0] = b'X';
        assert!(matches!(read_map(bytes.as_slice()), Err(SlamError::MapFormat(_))));
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let mut bytes = Vec::new();
        write_map(&sample_map(), &mut bytes).unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(read_map(bytes.as_slice()), Err(SlamError::MapFormat(_))));
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let mut bytes = Vec::new();
        write_map(&sample_map(), &mut bytes).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(read_map(bytes.as_slice()), Err(SlamError::MapFormat(_))));
    }

    #[test]
    fn test_dangling_observation_is_rejected() {
        let mut map = sample_map();
        let mp_id = map.map_point_ids()[0];
        map.map_points
            .get_mut(&mp_id)
            .unwrap()
            .observations
            .insert(KeyFrameId::new(77), 0);

        let mut bytes = Vec::new();
        write_map(&map, &mut bytes).unwrap();
        assert!(matches!(read_map(bytes.as_slice()), Err(SlamError::MapFormat(_))));
    }
}
