//! Length-prefixed frame codec.
//!
//! Each message on a peer stream is a 4-byte big-endian length prefix
//! followed by the bincode-encoded [`MessageData`] envelope.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::MessageData;
use crate::NetworkError;

/// Maximum message body size.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024; // 8 MiB

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(NetworkError::OversizedFrame(body_len));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let len_bytes = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len_bytes).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one envelope.
pub async fn read_envelope<R>(reader: &mut R) -> Result<MessageData, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader).await?;
    bincode::deserialize(&frame).map_err(|e| NetworkError::Serialization(e.to_string()))
}

/// Encode and write one envelope.
pub async fn write_envelope<W>(writer: &mut W, env: &MessageData) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let bytes =
        bincode::serialize(env).map_err(|e| NetworkError::Serialization(e.to_string()))?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::wire::ProtocolId;
    use skald_crypto::generate_keypair;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello skald").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame, b"hello skald");
    }

    #[tokio::test]
    async fn empty_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_body() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let huge = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &huge)
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, NetworkError::OversizedFrame(_)));
    }

    #[tokio::test]
    async fn truncated_stream_surfaces_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut client, &8u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &[1, 2, 3])
            .await
            .unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, NetworkError::Io(_)));
    }

    #[tokio::test]
    async fn envelope_roundtrip_over_stream() {
        let identity = NodeIdentity::new(generate_keypair());
        let env = MessageData::new_signed(&identity, ProtocolId::PingRequest, vec![9, 9, 9])
            .unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);
        write_envelope(&mut client, &env).await.unwrap();

        let decoded = read_envelope(&mut server).await.unwrap();
        assert_eq!(decoded.body, vec![9, 9, 9]);
        decoded.verify().expect("verifies");
    }

    #[tokio::test]
    async fn garbage_frame_is_a_serialization_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[0xFF; 3]).await.unwrap();

        let err = read_envelope(&mut server).await.unwrap_err();
        assert!(matches!(err, NetworkError::Serialization(_)));
    }
}
