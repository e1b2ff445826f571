//! Trajectory export in TUM and KITTI text formats.
//!
//! Frame poses are stored relative to a reference keyframe, so they are
//! resolved against the current map at export time and pick up every
//! correction applied since the frame was tracked.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use csv::{ReaderBuilder, WriterBuilder};
use nalgebra::Vector3;
use tracing::{debug, info};

use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::map::Map;
use crate::tracking::FrameRecord;

/// One exported pose (`T_wc`).
#[derive(Debug, Clone)]
pub struct PoseEntry {
    pub timestamp: f64,
    pub pose_wc: SE3,
}

/// Absolute poses of every tracked frame, in processing order.
///
/// Lost frames are skipped. A reference keyframe that was culled is
/// resolved through its spanning-tree parent.
pub fn frame_trajectory(map: &Map, history: &[FrameRecord]) -> Vec<PoseEntry> {
    let mut entries = Vec::with_capacity(history.len());
    for record in history.iter().filter(|r| !r.lost) {
        match map.resolve_keyframe_pose(record.reference_kf) {
            Some(t_wr) => entries.push(PoseEntry {
                timestamp: record.timestamp,
                pose_wc: t_wr.compose(&record.relative_pose),
            }),
            None => debug!(
                "[Trajectory] Frame {:.6}: reference {} no longer resolvable",
                record.timestamp, record.reference_kf
            ),
        }
    }
    entries
}

/// Poses of the live keyframes, in insertion order.
pub fn keyframe_trajectory(map: &Map) -> Vec<PoseEntry> {
    map.keyframes_temporal_order()
        .into_iter()
        .filter(|kf| !kf.is_bad)
        .map(|kf| PoseEntry {
            timestamp: kf.timestamp,
            pose_wc: kf.pose.clone(),
        })
        .collect()
}

/// `timestamp tx ty tz qx qy qz qw`, one line per entry.
pub fn write_tum<W: Write>(entries: &[PoseEntry], writer: W) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_writer(writer);

    for entry in entries {
        let t = &entry.pose_wc.translation;
        let q = entry.pose_wc.rotation.quaternion();
        wtr.write_record(&[
            format!("{:.6}", entry.timestamp),
            format!("{:.9}", t.x),
            format!("{:.9}", t.y),
            format!("{:.9}", t.z),
            format!("{:.9}", q.i),
            format!("{:.9}", q.j),
            format!("{:.9}", q.k),
            format!("{:.9}", q.w),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Row-major 3x4 `T_wc`, twelve values per line.
pub fn write_kitti<W: Write>(entries: &[PoseEntry], writer: W) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_writer(writer);

    for entry in entries {
        let m = entry.pose_wc.to_matrix();
        let mut record = Vec::with_capacity(12);
        for row in 0..3 {
            for col in 0..4 {
                record.push(format!("{:.9}", m[(row, col)]));
            }
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Read a TUM trajectory. `#` lines are comments.
pub fn read_tum(path: &Path) -> Result<Vec<PoseEntry>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let values: Vec<f64> = rec
            .iter()
            .filter(|field| !field.is_empty())
            .map(|field| field.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SlamError::Serialization(format!("{}: {}", path.display(), e)))?;
        if values.len() < 8 {
            continue;
        }
        entries.push(PoseEntry {
            timestamp: values[0],
            pose_wc: SE3::from_quaternion(
                values[7],
                values[4],
                values[5],
                values[6],
                Vector3::new(values[1], values[2], values[3]),
            ),
        });
    }
    Ok(entries)
}

pub fn save_tum(entries: &[PoseEntry], path: &Path) -> Result<()> {
    write_tum(entries, BufWriter::new(File::create(path)?))?;
    info!("[Trajectory] {} poses written to {}", entries.len(), path.display());
    Ok(())
}

pub fn save_kitti(entries: &[PoseEntry], path: &Path) -> Result<()> {
    write_kitti(entries, BufWriter::new(File::create(path)?))?;
    info!("[Trajectory] {} poses written to {}", entries.len(), path.display());
    Ok(())
}
