//! Error types.
//!
//! Only setup and I/O can fail. Everything that goes wrong inside a single
//! frame is reported through [`FrameFlag`] and the run continues.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pcd error: {0}")]
    Pcd(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Working resources (threads, buffers) could not be set up.
    #[error("failed to set up {0}")]
    Resource(String),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

/// Non-fatal condition raised while processing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFlag {
    /// A registration stage had too few source or target points and was skipped.
    InsufficientPoints,
    /// A registration stage hit its iteration cap or ended above the fitness threshold.
    RegistrationNonConvergence,
    /// Too few ground candidates, the previous ground correction was kept.
    GroundFitInsufficientPoints,
    /// No IMU sample covered the frame interval, identity rotation was used.
    StaleImuData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameFlags(Vec<FrameFlag>);

impl FrameFlags {
    pub fn raise(&mut self, flag: FrameFlag) {
        if !self.0.contains(&flag) {
            self.0.push(flag);
        }
    }

    pub fn contains(&self, flag: FrameFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A frame is degraded when registration did not run cleanly.
    pub fn is_degraded(&self) -> bool {
        self.contains(FrameFlag::InsufficientPoints)
            || self.contains(FrameFlag::RegistrationNonConvergence)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameFlag> {
        self.0.iter()
    }
}
