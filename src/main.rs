use anyhow::{Context, Result};
use clap::Parser;
use glob::glob;
use log::{info, warn};
use simple_lio::{
    config::Config,
    io,
    odom_pipeline::{FrameResult, StampedPose},
    point3d::{self, Scan},
    runtime::OdometryNode,
    viz,
};

#[derive(Parser)]
#[command(version, about = "Replays a directory of <timestamp_ns>.pcd scans", long_about = None)]
struct Cli {
    /// directory holding the pcd files
    #[arg(default_value = "./pcd")]
    dir: String,

    /// json config, defaults are used for missing keys
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value_t = 0)]
    start: usize,

    /// write the trajectory here in TUM format
    #[arg(long)]
    save: Option<String>,

    /// save the recording to an .rrd file instead of spawning the viewer
    #[arg(long)]
    rrd: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => io::json_to_config(path).with_context(|| format!("loading {}", path))?,
        None => Config::default_values(),
    };
    if cli.save.is_some() {
        config.trajectory_path = cli.save.clone();
    }

    let builder = rerun::RecordingStreamBuilder::new("simple lio");
    let recording = match &cli.rrd {
        Some(path) => builder.save(path)?,
        None => builder.spawn()?,
    };

    let sink = {
        let recording = recording.clone();
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

    let pattern = format!("{}/*.pcd", cli.dir);
    for entry in glob(&pattern)?.skip(cli.start) {
        let path = entry?;
        let timestamp_ns: u64 = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .with_context(|| format!("{} is not named by its timestamp", path.display()))?;
        let points = point3d::read_pcd_to_points(&path.to_string_lossy())?;
        if !node.submit_scan(Scan::new(timestamp_ns as f64 / 1e9, points)) {
            break;
        }
    }

    let trajectory = node.shutdown()?;
    info!("processed {} scans", trajectory.len());
    Ok(())
}
