use crate::control::codec;
use crate::control::protocol::{FromProxy, ToProxy};
use crate::control::transport::{ControlError, ProxyConnector, ProxyLink};
use crate::proto;
use crate::proto::fleet_control_client::FleetControlClient;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;

const LINK_BUFFER: usize = 64;

/// GrpcConnector talks to the proxy over the `FleetControl.ControlSession` bidirectional stream.
pub struct GrpcConnector {
    logger: slog::Logger,
    endpoint: String,
    connect_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(logger: slog::Logger, endpoint: String, connect_timeout: Duration) -> Self {
        GrpcConnector {
            logger,
            endpoint,
            connect_timeout,
        }
    }
}

#[async_trait::async_trait]
impl ProxyConnector for GrpcConnector {
    async fn connect(&self) -> Result<ProxyLink, ControlError> {
        let endpoint = Endpoint::from_shared(self.endpoint.clone()).map_err(|e| ControlError::Connect(e.to_string()))?;
        let channel = match tokio::time::timeout(self.connect_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(ControlError::Connect(e.to_string())),
            Err(_) => {
                return Err(ControlError::Connect(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };
        let mut client = FleetControlClient::new(channel);

        let (to_proxy_tx, mut to_proxy_rx) = mpsc::channel::<ToProxy>(LINK_BUFFER);
        let (wire_tx, wire_rx) = mpsc::channel::<proto::ServerMessage>(LINK_BUFFER);
        let (from_proxy_tx, from_proxy_rx) = mpsc::channel::<Result<FromProxy, ControlError>>(LINK_BUFFER);

        // Outbound pump. Ends when the session drops its sender, which half-closes the stream.
        let logger = self.logger.clone();
        tokio::spawn(async move {
            while let Some(message) = to_proxy_rx.recv().await {
                slog::debug!(logger, "ClientWire - {:?}", message);
                if wire_tx.send(codec::encode_server_message(message)).await.is_err() {
                    break;
                }
            }
        });

        // The response headers may only arrive after the proxy has read our registration, so the call
        // itself runs in the inbound pump rather than inside connect().
        let logger = self.logger.clone();
        tokio::spawn(async move {
            let response = client.control_session(ReceiverStream::new(wire_rx)).await;
            let mut stream = match response {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    let _ = from_proxy_tx.send(Err(ControlError::Transport(status.to_string()))).await;
                    return;
                }
            };

            loop {
                let next = tokio::select! {
                    _ = from_proxy_tx.closed() => return,
                    next = stream.message() => next,
                };
                let item = match next {
                    Ok(Some(message)) => {
                        slog::debug!(logger, "ClientWire - {:?}", message);
                        codec::decode_proxy_message(message).map_err(ControlError::from)
                    }
                    Ok(None) => return,
                    Err(status) => Err(ControlError::Transport(status.to_string())),
                };
                let failed = item.is_err();
                if from_proxy_tx.send(item).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(ProxyLink {
            outbound: to_proxy_tx,
            inbound: from_proxy_rx,
        })
    }
}
