//! Line-delimited JSON framing for point-to-point connections

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SimulatorError};
use crate::protocol::{Envelope, SimulatorAddress};

/// Upper bound on one frame; anything larger is treated as a corrupt stream
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum WireFrame {
    /// First frame on every connection, in both directions
    Hello { address: SimulatorAddress },
    Envelope(Envelope),
}

pub fn encode(frame: &WireFrame) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<WireFrame> {
    Ok(serde_json::from_str(line.trim_end())?)
}

pub async fn write_frame<W>(writer: &mut W, frame: &WireFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(frame)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream.
///
/// A line that does not parse is a [`SimulatorError::MalformedFrame`] and the
/// stream stays usable; a line longer than [`MAX_FRAME_BYTES`] is not.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireFrame>>
where
    R: AsyncBufRead + Unpin,
{
    read_frame_limited(reader, MAX_FRAME_BYTES).await
}

async fn read_frame_limited<R>(reader: &mut R, limit: usize) -> Result<Option<WireFrame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.len() > limit && !line.ends_with(b"\n") {
        return Err(SimulatorError::Protocol(format!(
            "frame exceeds {limit} bytes"
        )));
    }
    let text = std::str::from_utf8(&line)
        .map_err(|e| SimulatorError::MalformedFrame(format!("invalid UTF-8: {e}")))?;
    decode(text)
        .map(Some)
        .map_err(|e| SimulatorError::MalformedFrame(e.to_string()))
}
