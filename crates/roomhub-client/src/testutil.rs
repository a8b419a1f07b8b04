//! In-process hub for unit tests.
//!
//! Clients reach the hub through a loopback proxy so a test can cut every
//! live link at once, the way a crashed network path would.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};

use roomhub_server::{HubServer, RoomRegistry, ServerConfig};

use crate::session::HubClient;

pub(crate) const TOKEN: &str = "test-token";

pub(crate) struct TestHub {
    pub url: String,
    pub registry: Arc<RoomRegistry>,
    links: Arc<Mutex<Vec<AbortHandle>>>,
    proxy: Mutex<Option<JoinHandle<()>>>,
}

impl TestHub {
    pub fn client(&self) -> HubClient {
        HubClient::new(self.url.clone(), TOKEN)
    }

    /// Drop every proxied connection without a closing handshake.
    pub fn cut_links(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    /// Refuse new connections, then cut the live ones.
    pub async fn stop(&self) {
        let accept = self.proxy.lock().unwrap().take();
        if let Some(accept) = accept {
            accept.abort();
            let _ = accept.await;
        }
        self.cut_links();
    }

    pub async fn wait_room_gone(&self, room: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.registry.contains(room).await {
            assert!(tokio::time::Instant::now() < deadline, "room {room} still present");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub(crate) async fn start_hub() -> TestHub {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), TOKEN);
    let server = HubServer::bind(config, None).await.unwrap();
    let hub_addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(server.run());

    let links = Arc::new(Mutex::new(Vec::new()));
    let (proxy_addr, proxy) = start_proxy(hub_addr, links.clone()).await;

    TestHub {
        url: format!("ws://{proxy_addr}/hub"),
        registry,
        links,
        proxy: Mutex::new(Some(proxy)),
    }
}

async fn start_proxy(
    target: SocketAddr,
    links: Arc<Mutex<Vec<AbortHandle>>>,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            let task = tokio::spawn(async move {
                let mut outbound = TcpStream::connect(target).await?;
                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
            });
            links.lock().unwrap().push(task.abort_handle());
        }
    });
    (addr, accept)
}
