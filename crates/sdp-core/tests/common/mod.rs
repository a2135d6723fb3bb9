#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sdp_core::{SdpConfig, SdpListener, SdpSocket, SdpStack};
use sdp_verbs::{DeviceCaps, LoopbackDevice, LoopbackNetwork};

/// Two hosts on one loopback network, each with its own stack.
pub struct Harness {
    pub net: LoopbackNetwork,
    pub server_dev: Arc<LoopbackDevice>,
    pub client_dev: Arc<LoopbackDevice>,
    pub server: SdpStack,
    pub client: SdpStack,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            DeviceCaps::default(),
            DeviceCaps::default(),
            SdpConfig::default(),
            SdpConfig::default(),
        )
    }

    pub fn with_configs(server_cfg: SdpConfig, client_cfg: SdpConfig) -> Self {
        Self::with(
            DeviceCaps::default(),
            DeviceCaps::default(),
            server_cfg,
            client_cfg,
        )
    }

    pub fn with(
        server_caps: DeviceCaps,
        client_caps: DeviceCaps,
        server_cfg: SdpConfig,
        client_cfg: SdpConfig,
    ) -> Self {
        let net = LoopbackNetwork::new();
        let server_dev = net.add_device("srv0", [10, 0, 0, 1].into(), server_caps);
        let client_dev = net.add_device("cli0", [10, 0, 0, 2].into(), client_caps);
        let server = SdpStack::new(server_dev.clone(), server_cfg).unwrap();
        let client = SdpStack::new(client_dev.clone(), client_cfg).unwrap();
        Self {
            net,
            server_dev,
            client_dev,
            server,
            client,
        }
    }

    pub fn listen(&self, backlog: usize) -> SdpListener {
        let addr: SocketAddr = "10.0.0.1:7471".parse().unwrap();
        self.server.listen(addr, backlog).unwrap()
    }

    /// Listen, connect and accept. Returns (listener, client, server).
    pub async fn pair(&self) -> (SdpListener, SdpSocket, SdpSocket) {
        let listener = self.listen(16);
        let (client, server) =
            tokio::join!(self.client.connect(listener.local_addr()), listener.accept());
        (listener, client.unwrap(), server.unwrap())
    }
}

pub async fn eventually<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

pub fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill(&mut data[..]);
    data
}
