use crate::{config, error::Result, odom_pipeline::StampedPose};
use std::{
    fs,
    io::{BufReader, BufWriter, Write},
};

pub fn json_to_config(path: &str) -> Result<config::Config> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let config: config::Config = serde_json::from_reader(reader)?;
    config.validate()?;
    Ok(config)
}

pub fn write_config_json(path: &str, config: &config::Config) -> Result<()> {
    let j = serde_json::to_string_pretty(&config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(j.as_bytes())?;
    Ok(())
}

/// Writes one `t x y z qx qy qz qw` line per pose (TUM format).
pub fn save_trajectory(path: &str, trajectory: &[StampedPose]) -> Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for sp in trajectory {
        let t = sp.pose.translation.vector;
        let q = sp.pose.rotation;
        writeln!(
            writer,
            "{:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
            sp.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
    }
    writer.flush()?;
    Ok(())
}
