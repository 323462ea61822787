//! HTTP/JSON transport
//!
//! Each dispatch posts an [`Envelope`] to `POST /peer/message` on the
//! destination from a spawned task, so callers never wait on the network.

use super::{DispatchStatus, Envelope, PeerMessage, Transport};
use crate::cluster::node::NodeAddr;
use crate::common::{Result, METRICS};
use reqwest::Client;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

/// Path peers accept messages on
pub const PEER_MESSAGE_PATH: &str = "/peer/message";

#[derive(Clone)]
pub struct HttpTransport {
    local: NodeAddr,
    client: Client,
}

impl HttpTransport {
    pub fn new(local: NodeAddr, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { local, client })
    }

    pub fn url_for(destination: NodeAddr) -> String {
        format!("http://{}{}", destination, PEER_MESSAGE_PATH)
    }
}

impl Transport for HttpTransport {
    fn local(&self) -> NodeAddr {
        self.local
    }

    fn dispatch(&self, destination: NodeAddr, message: PeerMessage) -> DispatchStatus {
        let Ok(runtime) = Handle::try_current() else {
            return DispatchStatus::Closed;
        };
        let client = self.client.clone();
        let envelope = Envelope {
            from: self.local,
            message,
        };
        runtime.spawn(async move {
            let name = envelope.message.name();
            let result = client
                .post(Self::url_for(destination))
                .json(&envelope)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                // lost sends surface through missing acks and contact timeouts
                debug!("Send of {} to {} failed: {}", name, destination, e);
                METRICS.dispatch_failures.inc();
            }
        });
        DispatchStatus::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for() {
        let dest: NodeAddr = "10.1.2.3:7401".parse().unwrap();
        assert_eq!(HttpTransport::url_for(dest), "http://10.1.2.3:7401/peer/message");
    }

    #[test]
    fn test_dispatch_without_runtime_is_closed() {
        let local: NodeAddr = "127.0.0.1:7400".parse().unwrap();
        let transport = HttpTransport::new(local, Duration::from_millis(100)).unwrap();
        let status = transport.dispatch(local, PeerMessage::HeartbeatRequest);
        assert_eq!(status, DispatchStatus::Closed);
    }
}
