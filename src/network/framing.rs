//! Length-prefixed framing for peer connections
//!
//! Message format: `[u32 BE length][UTF-8 JSON payload]`.

use super::protocol::Message;
use crate::error::KioskError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame (16 MiB). A sync chunk of ten full blocks fits.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub async fn send_framed<S>(stream: &mut S, data: &[u8]) -> Result<(), KioskError>
where
    S: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(KioskError::Network(format!(
            "Frame too large: {} > {}",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    let io = |e: std::io::Error| KioskError::Network(format!("Write failed: {}", e));
    stream.write_u32(data.len() as u32).await.map_err(io)?;
    stream.write_all(data).await.map_err(io)?;
    stream.flush().await.map_err(io)?;
    Ok(())
}

pub async fn recv_framed<S>(stream: &mut S) -> Result<Vec<u8>, KioskError>
where
    S: AsyncRead + Unpin,
{
    let io = |e: std::io::Error| KioskError::Network(format!("Read failed: {}", e));
    let len = stream.read_u32().await.map_err(io)? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(KioskError::Network(format!(
            "Frame too large: {} > {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.map_err(io)?;
    Ok(data)
}

pub async fn write_message<S>(stream: &mut S, message: &Message) -> Result<(), KioskError>
where
    S: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(message)?;
    send_framed(stream, &json).await
}

/// Read one frame and decode it, validating the message at the boundary.
pub async fn read_message<S>(stream: &mut S) -> Result<Message, KioskError>
where
    S: AsyncRead + Unpin,
{
    let data = recv_framed(stream).await?;
    let text = std::str::from_utf8(&data)
        .map_err(|e| KioskError::Network(format!("Frame is not UTF-8: {}", e)))?;
    let message: Message = serde_json::from_str(text)
        .map_err(|e| KioskError::Network(format!("Malformed message: {}", e)))?;
    message.validate()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frame_has_big_endian_length_prefix() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut buffer = Vec::new();
            write_message(&mut Cursor::new(&mut buffer), &Message::Ping { timestamp: 7 })
                .await
                .unwrap();

            let payload = br#"{"timestamp":7,"type":"ping"}"#;
            let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
            assert_eq!(declared, buffer.len() - 4);
            let decoded: serde_json::Value = serde_json::from_slice(&buffer[4..]).unwrap();
            assert_eq!(decoded, serde_json::from_slice::<serde_json::Value>(payload).unwrap());

            let message = read_message(&mut Cursor::new(buffer)).await.unwrap();
            assert_eq!(message, Message::Ping { timestamp: 7 });
        })
        .await
        .expect("framing test timed out");
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let mut buffer = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        buffer.extend_from_slice(b"{}");
        let err = recv_framed(&mut Cursor::new(buffer)).await.unwrap_err();
        assert!(matches!(err, KioskError::Network(_)));
    }

    #[tokio::test]
    async fn test_truncated_and_malformed_frames() {
        let mut truncated = 10u32.to_be_bytes().to_vec();
        truncated.extend_from_slice(b"{\"ty");
        assert!(read_message(&mut Cursor::new(truncated)).await.is_err());

        let body = br#"{"type":"warp_drive"}"#;
        let mut unknown = (body.len() as u32).to_be_bytes().to_vec();
        unknown.extend_from_slice(body);
        assert!(matches!(
            read_message(&mut Cursor::new(unknown)).await,
            Err(KioskError::Network(_))
        ));
    }
}
