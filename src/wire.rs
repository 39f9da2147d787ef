use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a relayed frame. IPX payloads top out around 1500 bytes on
/// Ethernet; anything above this is a framing error, not traffic.
pub const MAX_FRAME: usize = 2000;

/// Upper bound on the handshake network key.
pub const MAX_KEY_LEN: usize = 256;

/// Grace period a keyless node waits for a key-bearing peer to identify
/// itself before assuming the link is unauthenticated.
pub const HANDSHAKE_GRACE: Duration = Duration::from_millis(500);

/// Default port peers listen on when an address omits one.
pub const DEFAULT_PEER_PORT: u16 = 8787;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length {0} exceeds {MAX_FRAME} bytes")]
    FrameTooLarge(u32),
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("peer key length {0} exceeds {MAX_KEY_LEN} bytes")]
    KeyTooLong(u32),
    #[error("network key mismatch")]
    KeyMismatch,
}

impl WireError {
    /// EOF is the peer hanging up, not a protocol violation; callers use this
    /// to decide whether to count an error against the link.
    pub fn is_eof(&self) -> bool {
        matches!(self, WireError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Reads one `u32 BE length || payload` frame off the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes, WireError> {
    let len = r.read_u32().await?;
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if len as usize > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> Result<(), WireError> {
    w.write_u32(frame.len() as u32).await?;
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

/// Runs the symmetric network-key handshake. Both the accepting and the
/// dialing side call this with the same local key.
///
/// With a key configured, each side sends `u32 BE len || key` and expects the
/// identical bytes back. Without one, the node still waits briefly for a
/// key-bearing peer: an offered key is read and discarded and a zero-length
/// key is sent in reply, which keeps keyed and keyless deployments
/// interoperable without authenticating anything.
pub async fn handshake<S>(stream: &mut S, local_key: &str) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if local_key.len() > MAX_KEY_LEN {
        return Err(WireError::KeyTooLong(local_key.len() as u32));
    }

    if !local_key.is_empty() {
        stream.write_u32(local_key.len() as u32).await?;
        stream.write_all(local_key.as_bytes()).await?;
        stream.flush().await?;

        let remote_len = stream.read_u32().await?;
        if remote_len as usize > MAX_KEY_LEN {
            return Err(WireError::KeyTooLong(remote_len));
        }
        let mut remote = vec![0u8; remote_len as usize];
        stream.read_exact(&mut remote).await?;
        if remote != local_key.as_bytes() {
            return Err(WireError::KeyMismatch);
        }
        return Ok(());
    }

    match tokio::time::timeout(HANDSHAKE_GRACE, stream.read_u32()).await {
        Ok(Ok(remote_len)) => {
            if remote_len as usize > MAX_KEY_LEN {
                return Err(WireError::KeyTooLong(remote_len));
            }
            let mut remote = vec![0u8; remote_len as usize];
            stream.read_exact(&mut remote).await?;
            stream.write_u32(0).await?;
            stream.flush().await?;
            Ok(())
        }
        Ok(Err(e)) => Err(WireError::Io(e)),
        // Nothing offered within the grace period: unauthenticated link.
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, &[0x01, 0x02]).await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(&frame[..], &[0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        a.write_u32(3000).await.unwrap();
        match read_frame(&mut b).await {
            Err(WireError::FrameTooLarge(3000)) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        a.write_u32(0).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(WireError::EmptyFrame)));
    }

    #[tokio::test]
    async fn test_handshake_matching_keys() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let left = tokio::spawn(async move { handshake(&mut a, "alpha").await.map(|_| a) });
        let right = tokio::spawn(async move { handshake(&mut b, "alpha").await.map(|_| b) });

        let mut a = left.await.unwrap().unwrap();
        let mut b = right.await.unwrap().unwrap();

        // The link is usable for data frames afterwards.
        write_frame(&mut a, &[0xAA]).await.unwrap();
        assert_eq!(&read_frame(&mut b).await.unwrap()[..], &[0xAA]);
    }

    #[tokio::test]
    async fn test_handshake_mismatched_keys() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let left = tokio::spawn(async move { handshake(&mut a, "alpha").await });
        let right = tokio::spawn(async move { handshake(&mut b, "beta").await });

        assert!(matches!(left.await.unwrap(), Err(WireError::KeyMismatch)));
        assert!(matches!(right.await.unwrap(), Err(WireError::KeyMismatch)));
    }

    #[tokio::test]
    async fn test_handshake_keyless_accepts_keyed_peer() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        // b has a key; a does not. a discards the key and answers with a
        // zero-length one, so b sees a mismatch: a keyless node admits
        // anyone, a keyed node insists on its key.
        let keyless = tokio::spawn(async move { handshake(&mut a, "").await });
        let keyed = tokio::spawn(async move { handshake(&mut b, "alpha").await });

        assert!(keyless.await.unwrap().is_ok());
        assert!(matches!(keyed.await.unwrap(), Err(WireError::KeyMismatch)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_keyless_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let left = tokio::spawn(async move { handshake(&mut a, "").await });
        let right = tokio::spawn(async move { handshake(&mut b, "").await });

        // Neither side sends anything; both time out of the grace period and
        // proceed. start_paused auto-advances the clock so this is instant.
        assert!(left.await.unwrap().is_ok());
        assert!(right.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_oversized_key_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        a.write_u32(512).await.unwrap();
        let res = handshake(&mut b, "alpha").await;
        drop(a);
        assert!(matches!(res, Err(WireError::KeyTooLong(512))));
    }
}
