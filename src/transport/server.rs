use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::mesh::BrokerNode;
use crate::transport::connection::handle_connection;

/// Accepts connections until the listener fails, one task per socket.
pub async fn serve(listener: TcpListener, node: Arc<BrokerNode>) {
    info!(address = %node.address(), "broker listening");
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                info!(%remote, "connection accepted");
                tokio::spawn(handle_connection(stream, Arc::clone(&node)));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}
