use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_CHUNK: usize = 16 * 1024;

/// Which side's read direction finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Reading from `a` hit EOF or failed
    A,
    /// Reading from `b` hit EOF or failed
    B,
}

/// Byte counts for one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub ended_by: RelayEnd,
}

/// Copy bytes both ways between `a` and `b` until either direction ends.
///
/// The first direction to reach EOF or an error stops the relay. Both write
/// halves are then shut down and both streams dropped, so the peer on each
/// side observes a close. Bytes are forwarded unmodified and in order.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let ended_by = {
        let forward = pump(&mut a_read, &mut b_write, &mut a_to_b);
        let backward = pump(&mut b_read, &mut a_write, &mut b_to_a);
        tokio::select! {
            result = forward => {
                if let Err(e) = result {
                    tracing::debug!("Relay a->b ended with error: {}", e);
                }
                RelayEnd::A
            }
            result = backward => {
                if let Err(e) = result {
                    tracing::debug!("Relay b->a ended with error: {}", e);
                }
                RelayEnd::B
            }
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    RelayStats {
        a_to_b,
        b_to_a,
        ended_by,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_flow_both_ways_unmodified() {
        let (a_user, a_relay) = duplex(1024);
        let (b_user, b_relay) = duplex(1024);
        let relay_task = tokio::spawn(relay(a_relay, b_relay));

        let (mut a_read, mut a_write) = tokio::io::split(a_user);
        let (mut b_read, mut b_write) = tokio::io::split(b_user);

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            a_write.write_all(&payload).await.unwrap();
            a_write
        });

        let mut received = vec![0u8; expected.len()];
        b_read.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        let _a_write = writer.await.unwrap();

        b_write.write_all(b"PONG").await.unwrap();
        let mut reply = [0u8; 4];
        a_read.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG");

        drop(b_write);
        drop(b_read);
        let stats = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, 50_000);
        assert_eq!(stats.b_to_a, 4);
    }

    #[tokio::test]
    async fn test_close_on_one_side_closes_the_other() {
        let (a_user, a_relay) = duplex(1024);
        let (mut b_user, b_relay) = duplex(1024);
        let relay_task = tokio::spawn(relay(a_relay, b_relay));

        drop(a_user);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), b_user.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let stats = relay_task.await.unwrap();
        assert_eq!(stats.ended_by, RelayEnd::A);
    }

    #[tokio::test]
    async fn test_idle_relay_stays_open() {
        let (_a_user, a_relay) = duplex(1024);
        let (_b_user, b_relay) = duplex(1024);
        let relay_task = tokio::spawn(relay(a_relay, b_relay));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!relay_task.is_finished());
        relay_task.abort();
    }
}
