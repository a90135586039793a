//! Cannelloni TCP hello exchange.
//!
//! Both sides send the 12-byte magic token and must read the same token from
//! the peer. Writer and reader halves run concurrently under one timeout; a
//! mismatch or short read fails the connection before it is admitted.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::HandshakeError;

/// The magic token exchanged in both directions, no terminator.
pub const HELLO: &[u8; 12] = b"CANNELLONIv1";

/// Run the hello exchange on a fresh connection.
pub async fn handshake<S>(stream: &mut S, timeout: Duration) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let write = async {
            wr.write_all(HELLO).await.map_err(HandshakeError::Io)?;
            wr.flush().await.map_err(HandshakeError::Io)
        };
        let read = async {
            let mut buf = [0u8; 12];
            rd.read_exact(&mut buf).await.map_err(HandshakeError::Io)?;
            if &buf != HELLO {
                return Err(HandshakeError::BadHello);
            }
            Ok(())
        };
        tokio::try_join!(write, read).map(|_| ())
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(res) => res,
        Err(_) => Err(HandshakeError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut server, mut client) = tokio::io::duplex(64);

        let server_side =
            tokio::spawn(
                async move { handshake(&mut server, Duration::from_secs(1)).await },
            );
        let client_side =
            tokio::spawn(
                async move { handshake(&mut client, Duration::from_secs(1)).await },
            );

        server_side.await.unwrap().unwrap();
        client_side.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_bad_hello() {
        let (mut server, mut client) = tokio::io::duplex(64);

        let server_side =
            tokio::spawn(
                async move { handshake(&mut server, Duration::from_secs(1)).await },
            );
        client.write_all(b"NOTCANNELLON").await.unwrap();
        // Drain the server's hello so its write half completes.
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();

        let err = server_side.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::BadHello));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (mut server, _client) = tokio::io::duplex(64);

        // Peer never says hello.
        let err = handshake(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
    }
}
