use anyhow::{bail, Result};
use clap::Parser;
use log::{info, warn};
use rayon::prelude::*;
use simple_lio::{
    config::Config,
    io,
    odom_pipeline::{FrameResult, StampedPose},
    point3d::{Point3d, Scan},
    runtime::OdometryNode,
    viz,
};
use std::collections::HashMap;
use unbag_rs::ros1::msg::{Msg, PointCloud2};
use unbag_rs::ros1::Ros1Bag;

fn read_f32(data: &[u8], idx: usize) -> f32 {
    data.get(idx..idx + 4)
        .and_then(|b| b.try_into().ok())
        .map(f32::from_le_bytes)
        .unwrap_or(f32::NAN)
}

fn pointcloud_to_vec_point3d(pcd: &PointCloud2) -> Vec<Point3d> {
    let name_to_offset: HashMap<String, usize> = pcd
        .fields
        .iter()
        .map(|f| (f.name.to_owned(), f.offset as usize))
        .collect();
    let (Some(&ox), Some(&oy), Some(&oz)) = (
        name_to_offset.get("x"),
        name_to_offset.get("y"),
        name_to_offset.get("z"),
    ) else {
        return Vec::new();
    };
    let oi = name_to_offset.get("intensity").copied();

    (0..pcd.width)
        .into_par_iter()
        .map(|i| {
            let idx = (i * pcd.point_step) as usize;
            Point3d {
                x: read_f32(&pcd.data, idx + ox),
                y: read_f32(&pcd.data, idx + oy),
                z: read_f32(&pcd.data, idx + oz),
                intensity: oi.map_or(0.0, |o| read_f32(&pcd.data, idx + o)),
            }
        })
        .collect()
}

/// The bag reader only decodes point clouds, so nothing could feed the imu.
fn check_config(config: &Config) -> Result<()> {
    if config.imu_use {
        bail!("imu_use is set but this replayer only reads sensor_msgs/PointCloud2, disable it");
    }
    Ok(())
}

#[derive(Parser)]
#[command(version, about = "Runs the odometry on the lidar topic of a ROS1 bag", long_about = None)]
struct LioBagCli {
    /// path to the bag
    path: String,

    #[arg(long, default_value_t = 0)]
    start: usize,

    #[arg(long)]
    topic: Option<String>,

    /// json config, defaults are used for missing keys
    #[arg(long)]
    config: Option<String>,

    /// write the trajectory here in TUM format
    #[arg(long)]
    save: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = LioBagCli::parse();
    let bag = Ros1Bag::new(&cli.path);
    let lidar_topics = bag
        .topic_to_type
        .values()
        .filter(|k| k.contains("sensor_msgs/PointCloud2"))
        .count();
    if lidar_topics > 1 && cli.topic.is_none() {
        for (topic, ty) in bag.topic_to_type.iter() {
            println!("{}: {}", topic, ty);
        }
        bail!("more than one point cloud topic in the bag, use --topic to pick one");
    }
    let topics: Vec<String> = cli.topic.iter().cloned().collect();

    let mut config = match &cli.config {
        Some(path) => io::json_to_config(path)?,
        None => Config::default_values(),
    };
    if cli.save.is_some() {
        config.trajectory_path = cli.save.clone();
    }
    check_config(&config)?;

    let recording = rerun::RecordingStreamBuilder::new("simple lio bag").spawn()?;
    let sink = {
        let mut trajectory = Vec::new();
        move |r: &FrameResult| {
            trajectory.push(StampedPose {
                timestamp: r.timestamp,
                pose: r.pose,
            });
            if let Err(e) = viz::log_frame(&recording, r, &r.points, &trajectory, (0.0, 255.0)) {
                warn!("rerun: {}", e);
            }
        }
    };
    let node = OdometryNode::spawn(config, sink)?;

    for msg in bag.read_messages(&topics).skip(cli.start) {
        if let Msg::PointCloud2(pointcloud) = msg {
            let timestamp = pointcloud.header.sec as f64 + (pointcloud.header.nsec as f64 / 1e9);
            let points = pointcloud_to_vec_point3d(&pointcloud);
            if !node.submit_scan(Scan::new(timestamp, points)) {
                break;
            }
        }
    }

    let trajectory = node.shutdown()?;
    info!("processed {} scans", trajectory.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use unbag_rs::ros1::msg::{Header, PointField};

    #[test]
    fn imu_config_is_refused() {
        let mut config = Config::default_values();
        assert!(check_config(&config).is_ok());
        config.imu_use = true;
        assert!(check_config(&config).is_err());
    }

    #[test]
    fn missing_intensity_field_reads_zero() {
        let mut data = Vec::new();
        for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let pcd = PointCloud2 {
            header: Header {
                sequence_id: 0,
                sec: 0,
                nsec: 0,
                frame_id: "lidar".to_owned(),
            },
            height: 1,
            width: 2,
            fields: ["x", "y", "z"]
                .iter()
                .enumerate()
                .map(|(i, name)| PointField {
                    name: name.to_string(),
                    offset: 4 * i as u32,
                    datatype: 7,
                    count: 1,
                })
                .collect(),
            is_bigendian: 0,
            point_step: 12,
            row_step: 24,
            data,
            is_dense: 1,
        };
        let points = pointcloud_to_vec_point3d(&pcd);
        assert_eq!(points.len(), 2);
        assert_eq!((points[1].x, points[1].z, points[1].intensity), (4.0, 6.0, 0.0));
    }
}
