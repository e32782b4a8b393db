use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::lines::write_line;
use crate::transport::message::END;
use crate::utils::error::{BrokerError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Talks to a directory service at a fixed address.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    address: String,
}

impl DirectoryClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn register_broker(&self, broker: &str) -> Result<()> {
        self.notify(&format!("register {broker}")).await
    }

    pub async fn deregister_broker(&self, broker: &str) -> Result<()> {
        self.notify(&format!("deregister {broker}")).await
    }

    /// Every broker address currently registered, this node's own included.
    pub async fn get_active_brokers(&self) -> Result<Vec<String>> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.fetch_brokers())
            .await
            .map_err(|_| BrokerError::Directory(format!("{} did not answer", self.address)))?
    }

    async fn fetch_brokers(&self) -> Result<Vec<String>> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        write_line(&mut write_half, "get_brokers").await?;

        let mut lines = BufReader::new(read_half).lines();
        let mut brokers = Vec::new();
        loop {
            match lines.next_line().await? {
                Some(line) if line.trim() == END => break,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => brokers.push(line.trim().to_string()),
                None => {
                    return Err(BrokerError::Directory(
                        "broker list ended without END".to_string(),
                    ));
                }
            }
        }
        debug!(directory = %self.address, count = brokers.len(), "fetched broker list");
        Ok(brokers)
    }

    async fn notify(&self, line: &str) -> Result<()> {
        let mut stream = self.connect().await?;
        write_line(&mut stream, line).await?;
        stream.shutdown().await?;
        // the directory closes its side once the request is applied
        let mut rest = Vec::new();
        tokio::time::timeout(REQUEST_TIMEOUT, stream.read_to_end(&mut rest))
            .await
            .map_err(|_| BrokerError::Directory(format!("{} did not answer", self.address)))??;
        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream> {
        tokio::time::timeout(REQUEST_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| BrokerError::Directory(format!("connect to {} timed out", self.address)))?
            .map_err(|e| BrokerError::Directory(format!("{}: {e}", self.address)))
    }
}
