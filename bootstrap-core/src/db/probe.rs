use crate::readiness::{ReadinessProbe, ReadinessTarget};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tokio::net::TcpStream;

/// Opens one authenticated Postgres connection and runs `SELECT 1`.
///
/// Connects with its own options rather than the target's fields so that a
/// `DATABASE_URL` configuration is probed exactly as the steps will use it.
pub struct PgReadinessProbe {
    options: PgConnectOptions,
}

impl PgReadinessProbe {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ReadinessProbe for PgReadinessProbe {
    async fn probe(&self, _target: &ReadinessTarget) -> anyhow::Result<()> {
        let mut conn = PgConnection::connect_with(&self.options)
            .await
            .context("connecting to database")?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .context("running liveness query")?;
        conn.close().await.ok();
        Ok(())
    }
}

/// Socket-level check: the target's host and port accept a TCP connection.
pub struct TcpReadinessProbe;

#[async_trait]
impl ReadinessProbe for TcpReadinessProbe {
    async fn probe(&self, target: &ReadinessTarget) -> anyhow::Result<()> {
        TcpStream::connect((target.host.as_str(), target.port))
            .await
            .with_context(|| format!("connecting to {}:{}", target.host, target.port))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn target(port: u16) -> ReadinessTarget {
        ReadinessTarget {
            host: "127.0.0.1".to_string(),
            port,
            principal: "postgres".to_string(),
            database: "hospital_db".to_string(),
            poll_interval: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(1),
            max_wait: None,
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpReadinessProbe.probe(&target(port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(TcpReadinessProbe.probe(&target(port)).await.is_err());
    }
}
