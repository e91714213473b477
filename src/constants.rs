use std::time::Duration;

pub const WEBSOCKET_URL: &str = "ws://127.0.0.1:2325";

// The wire format packs each coordinate into 10 bits, so neither dimension
// can exceed 1024.
pub const CANVAS_WIDTH: usize = 1024;
pub const CANVAS_HEIGHT: usize = 1024;

pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

pub const INITIAL_SCALE: f32 = 0.75;
pub const MIN_SCALE: f32 = 0.5;
pub const MAX_SCALE: f32 = 10.0;

/// 24-bit RGB lives in the low bits of a u32 slot; the top byte stays zero.
pub const RGB_MASK: u32 = 0x00FF_FFFF;
