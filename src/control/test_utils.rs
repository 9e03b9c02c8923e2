use crate::control::protocol::{FromProxy, Registration, ToProxy};
use crate::control::transport::{ControlError, ProxyConnector, ProxyLink};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Hands every new link to the test as a `FakeProxySide`.
pub(crate) struct FakeConnector {
    link_buffer: usize,
    links_tx: mpsc::Sender<FakeProxySide>,
    links_rx: Mutex<mpsc::Receiver<FakeProxySide>>,
}

impl FakeConnector {
    pub(crate) fn new(link_buffer: usize) -> Self {
        let (links_tx, links_rx) = mpsc::channel(16);
        FakeConnector {
            link_buffer,
            links_tx,
            links_rx: Mutex::new(links_rx),
        }
    }

    pub(crate) async fn next_link(&self) -> FakeProxySide {
        let mut links = self.links_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), links.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Connector dropped")
    }
}

#[async_trait::async_trait]
impl ProxyConnector for FakeConnector {
    async fn connect(&self) -> Result<ProxyLink, ControlError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.link_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.link_buffer);
        self.links_tx
            .send(FakeProxySide {
                from_server: outbound_rx,
                to_server: inbound_tx,
            })
            .await
            .map_err(|_| ControlError::Connect("fake proxy is gone".into()))?;

        Ok(ProxyLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

pub(crate) struct FakeProxySide {
    from_server: mpsc::Receiver<ToProxy>,
    to_server: mpsc::Sender<Result<FromProxy, ControlError>>,
}

impl FakeProxySide {
    pub(crate) async fn recv(&mut self) -> ToProxy {
        tokio::time::timeout(Duration::from_secs(5), self.from_server.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Expected value")
    }

    pub(crate) async fn expect_register(&mut self) -> Registration {
        match self.recv().await {
            ToProxy::Register(registration) => registration,
            other => panic!("Expected Register, got {:?}", other),
        }
    }

    pub(crate) async fn accept_registration(&self) {
        self.send(FromProxy::RegisterAck {
            accepted: true,
            reason: String::new(),
        })
        .await;
    }

    pub(crate) async fn send(&self, message: FromProxy) {
        // The session may already be gone; tests assert on its effects instead.
        let _ = self.to_server.send(Ok(message)).await;
    }
}
