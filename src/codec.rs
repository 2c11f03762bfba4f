//! Framed message codec
//!
//! Wire format: one tag byte, a big-endian u64 payload length, then exactly
//! that many JSON bytes. A mismatched or oversize length aborts the session.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::msg::Message;

/// Frames larger than this are rejected before allocation
pub const MAX_FRAME_SIZE: u64 = 10 * 1024 * 1024;

/// Read one framed message.
///
/// EOF on the tag byte surfaces as `Error::Io` so callers can treat a clean
/// close differently from a truncated frame, which is a `CodecError`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await.map_err(Error::Io)?;

    let mut len_buf = [0u8; 8];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Codec(format!("truncated frame header: {}", e)))?;
    let len = u64::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Codec(format!("truncated frame payload: {}", e)))?;

    Message::decode(tag[0], &payload)
}

/// Write one framed message and flush.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = msg.encode_payload()?;
    let mut frame = BytesMut::with_capacity(1 + 8 + payload.len());
    frame.put_u8(msg.tag());
    frame.put_u64(payload.len() as u64);
    frame.put_slice(&payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Login, Ping, UdpPacket};

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::Login(Login {
            user: "alice".into(),
            run_id: "alice-0123456789abcdef".into(),
            ..Default::default()
        });
        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_multiple_messages_in_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let first = Message::Ping(Ping {});
        let second = Message::UdpPacket(UdpPacket {
            content: vec![1, 2, 3],
            local_addr: None,
            remote_addr: None,
        });
        write_message(&mut a, &first).await.unwrap();
        write_message(&mut a, &second).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), first);
        assert_eq!(read_message(&mut b).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = vec![b'h'];
        header.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut a, &header)
            .await
            .unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Codec(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_codec_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut frame = vec![b'h'];
        frame.extend_from_slice(&100u64.to_be_bytes());
        frame.extend_from_slice(b"{}"); // far fewer than 100 bytes
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame)
            .await
            .unwrap();
        drop(a);
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[tokio::test]
    async fn test_eof_on_tag_is_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_unknown_tag_aborts() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut frame = vec![b'?'];
        frame.extend_from_slice(&2u64.to_be_bytes());
        frame.extend_from_slice(b"{}");
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame)
            .await
            .unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
