mod client;
mod config;
mod diff;
mod error;
mod frame;
mod http;
mod listener;
mod logger;
mod protocol;
mod state;
mod types;

pub use client::{GatewayClient, GatewayClientBuilder};
pub use config::GatewayConfig;
pub use error::{Error, FrameError, Result};
pub use frame::{
    DecodedFrame, FRAME_LEN, HEADER, StatusFrameCodec, decode_frame, encode_frame, modbus_crc16,
};
pub use listener::{ListenerConfig, ListenerHandle, StatusListener};
pub use logger::MessageLogMode;
pub use protocol::{ControlCommand, brand_name, build_control_query};
pub use state::DeviceTable;
pub use types::*;
