//! Byte relay between a client CONNECT tunnel and a pooled local listener

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::{PoolError, Result};

/// Split `host:port` from a CONNECT authority; the port defaults to 443
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| PoolError::InvalidRequest(format!("Invalid port in {}", authority)))?;
            (host, port)
        }
        _ => (authority, 443),
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(PoolError::InvalidRequest(format!(
            "Missing host in {}",
            authority
        )));
    }
    Ok((host.to_string(), port))
}

/// Copy data both ways until each side has shut down
#[instrument(skip(client, server))]
pub async fn relay<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_server, server_to_client);

    let bytes_sent = sent.unwrap_or_else(|e| {
        debug!("Client to server copy ended: {}", e);
        0
    });
    let bytes_received = received.unwrap_or_else(|e| {
        debug!("Server to client copy ended: {}", e);
        0
    });

    debug!(bytes_sent, bytes_received, "Relay closed");
    (bytes_sent, bytes_received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:443").unwrap(),
            ("::1".to_string(), 443)
        );
        assert_eq!(parse_authority("[::1]").unwrap(), ("::1".to_string(), 443));
        assert!(parse_authority("example.com:http").is_err());
        assert!(parse_authority(":443").is_err());
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut server_peer, server) = tokio::io::duplex(1024);

        let relay = tokio::spawn(relay(client, server));

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.shutdown().await.unwrap();
        server_peer.write_all(b"hello from server").await.unwrap();
        server_peer.shutdown().await.unwrap();

        let mut buf = Vec::new();
        server_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello from client");

        let mut buf = Vec::new();
        client_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello from server");

        let (sent, received) = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!((sent, received), (17, 17));
    }
}
