//! Length-prefixed framing on peer connections: every message travels as a u32 big-endian
//!  length followed by that many bytes of serialized [Message].

use anyhow::bail;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;
use crate::util::safe_converter::SafeCast;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16*1024*1024;


/// Reads a single frame's payload. Returns `None` if the peer closed the connection cleanly at
///  a frame boundary, and an error for EOF in the middle of a frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut num_read = 0;
    while num_read < len_buf.len() {
        let n = reader.read(&mut len_buf[num_read..]).await?;
        if n == 0 {
            if num_read == 0 {
                return Ok(None);
            }
            bail!("connection closed inside a frame's length prefix");
        }
        num_read += n;
    }

    let msg_len: usize = u32::from_be_bytes(len_buf).safe_cast();
    if msg_len > max_len {
        bail!("received a frame that was longer than the configured maximum ({} > {}) - closing connection", msg_len, max_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf).await?;
    Ok(Some(msg_buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    let len: u32 = match payload.len().try_into() {
        Ok(len) => len,
        Err(_) => bail!("payload of {} bytes does not fit into a frame", payload.len()),
    };
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

pub fn encode_message(msg: &Message) -> BytesMut {
    let mut buf = BytesMut::new();
    msg.ser(&mut buf);
    buf
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> anyhow::Result<()> {
    write_frame(writer, &encode_message(msg)).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{AdminCommand, DataMessage};

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let data = Message::Data(DataMessage::new("123", "700", "hi"));
        write_message(&mut client, &data).await.unwrap();
        write_message(&mut client, &Message::admin(AdminCommand::Shutdown)).await.unwrap();
        drop(client);

        let frame = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
        assert_eq!(Message::deser(&frame).unwrap(), data);
        let frame = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
        assert_eq!(Message::deser(&frame).unwrap(), Message::admin(AdminCommand::Shutdown));

        assert!(read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[]).await.unwrap();
        assert_eq!(read_frame(&mut server, 10).await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[1, 2, 3, 4, 5]).await.unwrap();
        assert!(read_frame(&mut server, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        assert!(read_frame(&mut server, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);
        assert!(read_frame(&mut server, 100).await.is_err());
    }
}
