mod control;
mod model;

pub use control::{edge_map, ControlType, CANNY_HIGH_THRESHOLD, CANNY_LOW_THRESHOLD};
pub use model::{ControlNet, ControlNetConfig};
