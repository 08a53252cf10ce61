mod background;
mod monitor;
mod motion;

pub use background::BackgroundModel;
pub use monitor::{HeadlessMonitor, MonitorSummary};
pub use motion::{
    summarize_regions, CameraStats, MotionDetector, MotionEvent, RegionSummary,
    MAX_EVENTS_PER_CAMERA,
};
