//! Capture scheduling and frame distribution.

pub mod capture_loop;
pub mod hub;
pub mod registry;
pub mod throttle;

pub use hub::{request_frame, CaptureHub, FrameRequest, HubSettings};
pub use registry::{
    config_handle, ConfigHandle, Eviction, StreamConfig, StreamItem, SubscriberId, Ticket,
};
