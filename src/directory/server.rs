use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::transport::lines::write_line;
use crate::transport::message::END;

/// In-memory set of live broker addresses.
#[derive(Debug, Default)]
pub struct DirectoryService {
    brokers: Mutex<BTreeSet<String>>,
}

impl DirectoryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: &str) {
        if self.entries().insert(address.to_string()) {
            info!(broker = address, "broker registered");
        }
    }

    pub fn deregister(&self, address: &str) {
        if self.entries().remove(address) {
            info!(broker = address, "broker deregistered");
        } else {
            debug!(broker = address, "deregister for unknown broker");
        }
    }

    /// Registered addresses in sorted order.
    pub fn brokers(&self) -> Vec<String> {
        self.entries().iter().cloned().collect()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.brokers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "directory listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let service = Arc::clone(&self);
                    tokio::spawn(async move { service.handle(stream).await });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    async fn handle(&self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "directory connection dropped");
                    break;
                }
            };
            if let Err(e) = self.apply(line.trim(), &mut write_half).await {
                warn!(error = %e, "failed to answer directory request");
                break;
            }
        }
    }

    async fn apply<W>(&self, line: &str, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("register"), Some(address), None) => self.register(address),
            (Some("deregister"), Some(address), None) => self.deregister(address),
            (Some("get_brokers"), None, None) => {
                for broker in self.brokers() {
                    write_line(out, &broker).await?;
                }
                write_line(out, END).await?;
            }
            (None, _, _) => {}
            _ => warn!(request = line, "unknown directory request"),
        }
        Ok(())
    }
}
