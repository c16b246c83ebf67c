//! Shared fixtures for integration tests: an in-process broker served over
//! a real listener, plus worker config/client builders pointed at it.

#![allow(dead_code)]

use skvil_piertotum::broker::rest_api;
use skvil_piertotum::broker::state::BrokerState;
use skvil_piertotum::config::WorkerConfig;
use skvil_piertotum::domain_types::{AgentId, AgentName, PollIntervalMs};
use skvil_piertotum::time_provider::system_time_provider;
use skvil_piertotum::worker::client::BrokerClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct TestBroker {
    pub state: Arc<BrokerState>,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
}

/// Serves a fresh broker on an ephemeral localhost port.
pub async fn spawn_broker() -> TestBroker {
    let state = Arc::new(BrokerState::new(system_time_provider()));
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let app = rest_api::create_app(state.clone());
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = rest_api::serve(listener, app, serve_shutdown).await;
    });

    TestBroker {
        state,
        addr,
        shutdown,
    }
}

pub fn aid(raw: &str) -> AgentId {
    AgentId::try_new(raw.to_string()).unwrap()
}

pub fn client_for(addr: SocketAddr) -> BrokerClient {
    BrokerClient::new(
        reqwest::Url::parse(&format!("http://{addr}")).unwrap(),
        Duration::from_secs(2),
    )
}

/// Worker config pointed at the test broker, with timings shrunk so tests
/// observe ticker behavior quickly.
pub fn worker_config(addr: SocketAddr, id: &str) -> WorkerConfig {
    WorkerConfig {
        broker_url: reqwest::Url::parse(&format!("http://{addr}")).unwrap(),
        agent_id: aid(id),
        agent_name: AgentName::try_new(format!("SP-{id}")).unwrap(),
        project: "proj".to_string(),
        path: "/tmp".to_string(),
        auto_process: false,
        poll_interval: PollIntervalMs::default(),
        heartbeat_period: Duration::from_millis(50),
        fetch_timeout: Duration::from_secs(2),
        deregister_timeout: Duration::from_secs(1),
        shutdown_drain: Duration::from_secs(2),
    }
}
