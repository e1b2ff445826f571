use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use vslam_pipeline::config::Sensor;
use vslam_pipeline::synthetic::{SyntheticSequence, SETTINGS_YAML};
use vslam_pipeline::system::SlamSystem;

const DEFAULT_FRAMES: usize = 200;
const STEP: f64 = 0.02;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // vslam-pipeline [output_dir] [num_frames] [mono|stereo|rgbd]
    let args: Vec<String> = std::env::args().collect();
    let out_dir = PathBuf::from(args.get(1).map(String::as_str).unwrap_or("vslam_out"));
    let num_frames = match args.get(2) {
        Some(n) => n.parse().with_context(|| format!("Invalid frame count {}", n))?,
        None => DEFAULT_FRAMES,
    };
    let sensor = match args.get(3).map(String::as_str).unwrap_or("stereo") {
        "mono" | "monocular" => Sensor::Monocular,
        "stereo" => Sensor::Stereo,
        "rgbd" => Sensor::Rgbd,
        other => bail!("Unknown sensor {} (expected mono, stereo or rgbd)", other),
    };

    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let sequence = SyntheticSequence::sideways(num_frames, STEP, 42);
    let vocabulary_path = out_dir.join("vocabulary.txt");
    let settings_path = out_dir.join("settings.yaml");
    fs::write(&vocabulary_path, sequence.scene.vocabulary_text())?;
    fs::write(&settings_path, SETTINGS_YAML)?;
    info!(
        "Synthetic sequence: {} frames, {} landmarks, {} sensor",
        sequence.len(),
        sequence.scene.len(),
        sensor
    );

    let mut system = SlamSystem::new(&vocabulary_path, &settings_path, sensor)
        .context("Failed to start the SLAM system")?;
    let depth_map_factor = system.settings().camera.depth_map_factor;

    let mut tracked = 0usize;
    let mut squared_error = 0.0;
    for i in 0..sequence.len() {
        let timestamp = sequence.timestamp(i);
        let pose_cw = match sensor {
            Sensor::Monocular => system.track_monocular(sequence.monocular(i), timestamp)?,
            Sensor::Stereo => {
                let (left, right) = sequence.stereo(i);
                system.track_stereo(left, &right, timestamp)?
            }
            Sensor::Rgbd => {
                let (features, depths) = sequence.rgbd(i, depth_map_factor);
                system.track_rgbd(features, &depths, timestamp)?
            }
        };

        let Some(pose_cw) = pose_cw else {
            continue;
        };
        tracked += 1;
        // Camera center: -R^T t
        let rotation = pose_cw.fixed_view::<3, 3>(0, 0);
        let center = -(rotation.transpose() * pose_cw.fixed_view::<3, 1>(0, 3));
        squared_error += (center - sequence.poses[i].translation).norm_squared();

        if i % 50 == 0 {
            info!(
                "Frame {}: {:?}, {} keyframes, {} map points",
                i,
                system.tracking_state(),
                system.num_keyframes(),
                system.num_map_points()
            );
        }
    }

    if tracked > 0 {
        // Monocular runs are up to scale, so the error is only meaningful
        // with depth.
        info!(
            "Tracked {}/{} frames, translation RMSE {:.4} m",
            tracked,
            sequence.len(),
            (squared_error / tracked as f64).sqrt()
        );
    } else {
        warn!("No frame was tracked");
    }

    system.shutdown();

    system.save_keyframe_trajectory_tum(&out_dir.join("keyframes_tum.txt"))?;
    if sensor != Sensor::Monocular {
        system.save_trajectory_tum(&out_dir.join("trajectory_tum.txt"))?;
        system.save_trajectory_kitti(&out_dir.join("trajectory_kitti.txt"))?;
    }
    system.save_map(&out_dir.join("map.bin"))?;

    info!("Results written to {}", out_dir.display());
    Ok(())
}
