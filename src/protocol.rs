use thiserror::Error;

use crate::constants::RGB_MASK;

/// Tags for client→server request frames. The response space starts at 10 so
/// the two never overlap, which helps when eyeballing captures; decode still
/// has to know which direction a frame travelled.
pub mod request_tags {
    pub const SET_PIXEL: u8 = 1;
    pub const GET_PIXEL: u8 = 2;
    pub const GET_ALL_PIXELS: u8 = 3;
    pub const GET_STATS: u8 = 4;
}

/// Tags for server→client response frames. Pixel broadcasts reuse the
/// SET_PIXEL request tag.
pub mod response_tags {
    pub const PIXEL_COLOR: u8 = 10;
    pub const ERROR: u8 = 11;
    pub const ALL_PIXELS: u8 = 12;
    pub const STATS: u8 = 13;
}

/// Each coordinate occupies 10 bits of the packed field.
pub const COORD_MASK: u16 = 0x3FF;

// Bit 20 of the packed coordinate field, as seen in its first wire byte.
// The authority reads it as "do not echo this update back to the sender".
const ECHO_SUPPRESS_BIT: u8 = 0x10;

/// Pack two 10-bit coordinates into 20 bits, emitted as the 3 bytes of the
/// 24-bit container, most significant byte first.
///
/// Inputs are truncated to their 10-bit range; callers validate against the
/// canvas bounds before encoding.
pub fn pack_coordinates(x: u16, y: u16) -> [u8; 3] {
    let packed = (u32::from(x & COORD_MASK) << 10) | u32::from(y & COORD_MASK);
    [(packed >> 16) as u8, (packed >> 8) as u8, packed as u8]
}

/// Exact inverse of [`pack_coordinates`] for all in-range inputs. Bits above
/// the 20-bit coordinate field (including the echo-suppression flag) are
/// ignored.
pub fn unpack_coordinates(bytes: &[u8; 3]) -> (u16, u16) {
    let packed =
        (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
    let x = ((packed >> 10) & u32::from(COORD_MASK)) as u16;
    let y = (packed & u32::from(COORD_MASK)) as u16;
    (x, y)
}

/// 24-bit RGB, most significant byte (red) first. Bits above bit 23 are
/// masked off.
pub fn pack_rgb(color: u32) -> [u8; 3] {
    let color = color & RGB_MASK;
    [(color >> 16) as u8, (color >> 8) as u8, color as u8]
}

pub fn unpack_rgb(bytes: &[u8; 3]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

/// A received frame the codec refuses to interpret. The frame is dropped and
/// the connection stays up; this never tears down a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame too short for tag {tag}: got {len} bytes, need {need}")]
    Truncated { tag: u8, len: usize, need: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("pixel snapshot of {0} bytes is not a whole number of pixels")]
    RaggedSnapshot(usize),
}

/// Error codes carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidMessageType,
    OutOfBounds,
    Other(u8),
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        match code {
            1 => ErrorCode::InvalidMessageType,
            2 => ErrorCode::OutOfBounds,
            other => ErrorCode::Other(other),
        }
    }
}

/// A client→server request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequest {
    SetPixel {
        x: u16,
        y: u16,
        color: u32,
        /// Ask the authority not to broadcast this update back to us.
        skip_echo: bool,
    },
    GetPixel {
        x: u16,
        y: u16,
    },
    GetAllPixels,
    GetStats,
}

impl ClientRequest {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            ClientRequest::SetPixel {
                x,
                y,
                color,
                skip_echo,
            } => {
                // [tag:1][coords:3][rgb:3] = 7 bytes
                let mut frame = Vec::with_capacity(7);
                frame.push(request_tags::SET_PIXEL);
                let mut coords = pack_coordinates(x, y);
                if skip_echo {
                    coords[0] |= ECHO_SUPPRESS_BIT;
                }
                frame.extend_from_slice(&coords);
                frame.extend_from_slice(&pack_rgb(color));
                frame
            }
            ClientRequest::GetPixel { x, y } => {
                // [tag:1][coords:3] = 4 bytes
                let mut frame = Vec::with_capacity(4);
                frame.push(request_tags::GET_PIXEL);
                frame.extend_from_slice(&pack_coordinates(x, y));
                frame
            }
            ClientRequest::GetAllPixels => vec![request_tags::GET_ALL_PIXELS],
            ClientRequest::GetStats => vec![request_tags::GET_STATS],
        }
    }
}

/// A decoded server→client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Pixel broadcast (shares the SET_PIXEL tag with the request space).
    PixelUpdate { x: u16, y: u16, color: u32 },
    /// Reply to GetPixel.
    PixelColor { x: u16, y: u16, color: u32 },
    Error { code: ErrorCode },
    /// Full canvas snapshot, row-major.
    AllPixels(Vec<u32>),
    Stats {
        connected_clients: u32,
        requests_per_second: f32,
    },
}

impl ServerMessage {
    pub fn decode(frame: &[u8]) -> Result<ServerMessage, DecodeError> {
        let (&tag, payload) = frame.split_first().ok_or(DecodeError::EmptyFrame)?;
        match tag {
            request_tags::SET_PIXEL | response_tags::PIXEL_COLOR => {
                // [tag:1][coords:3][rgb:3] = 7 bytes
                if payload.len() < 6 {
                    return Err(DecodeError::Truncated {
                        tag,
                        len: frame.len(),
                        need: 7,
                    });
                }
                let (x, y) = unpack_coordinates(&[payload[0], payload[1], payload[2]]);
                let color = unpack_rgb(&[payload[3], payload[4], payload[5]]);
                if tag == request_tags::SET_PIXEL {
                    Ok(ServerMessage::PixelUpdate { x, y, color })
                } else {
                    Ok(ServerMessage::PixelColor { x, y, color })
                }
            }
            response_tags::ERROR => {
                // [tag:1][code:1] = 2 bytes
                let &code = payload.first().ok_or(DecodeError::Truncated {
                    tag,
                    len: frame.len(),
                    need: 2,
                })?;
                Ok(ServerMessage::Error { code: code.into() })
            }
            response_tags::ALL_PIXELS => {
                // [tag:1][rgb:3 x width*height]
                if payload.len() % 3 != 0 {
                    return Err(DecodeError::RaggedSnapshot(payload.len()));
                }
                let pixels = payload
                    .chunks_exact(3)
                    .map(|rgb| unpack_rgb(&[rgb[0], rgb[1], rgb[2]]))
                    .collect();
                Ok(ServerMessage::AllPixels(pixels))
            }
            response_tags::STATS => {
                // [tag:1][clients:u32 BE][rps:f32 BE] = 9 bytes
                if payload.len() < 8 {
                    return Err(DecodeError::Truncated {
                        tag,
                        len: frame.len(),
                        need: 9,
                    });
                }
                let connected_clients =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let requests_per_second =
                    f32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Ok(ServerMessage::Stats {
                    connected_clients,
                    requests_per_second,
                })
            }
            unknown => Err(DecodeError::UnknownTag(unknown)),
        }
    }
}
