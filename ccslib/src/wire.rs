//! Wire framing for the CCS protocol
//!
//! Messages are JSON documents framed with a 4-byte big-endian length
//! prefix over a TCP stream. The framing is identical in both roles; the
//! payload type differs (Command inbound, ServerMessage outbound).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

use crate::error::{CcsError, CcsResult};

/// Maximum framed message size in bytes
pub const MAX_FRAME_SIZE: usize = 65535;

/// Write one length-prefixed JSON frame
pub fn write_frame<S, T>(stream: &mut S, message: &T) -> CcsResult<()>
where
    S: Write,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(CcsError::FrameTooLarge(data.len()));
    }
    let len_bytes = (data.len() as u32).to_be_bytes();
    stream.write_all(&len_bytes)?;
    stream.write_all(&data)?;
    stream.flush()?;
    Ok(())
}

/// Read one length-prefixed JSON frame
pub fn read_frame<S, T>(stream: &mut S) -> CcsResult<T>
where
    S: Read,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(CcsError::FrameTooLarge(len));
    }

    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer)?;
    let message = serde_json::from_slice(&buffer)?;
    Ok(message)
}
