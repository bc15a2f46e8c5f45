//! Whole-overlay tests: a registry, several routers and a local web server
//!
//! Every router listens on ephemeral ports and registers with a registry
//! started by the test. HTTP requests go in through a router's proxy port,
//! cross a two-hop circuit and leave through an exit towards the local web
//! server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tor61_core::core_directory::RegistryServer;
use tor61_core::core_router::CircuitState;
use tor61_core::{Config, RegistryClient, RouterNode};

const BODY: &str = "hello from the other side";

/// Minimal HTTP origin that records each request head it receives.
struct WebServer {
    addr: SocketAddr,
    heads: Arc<Mutex<Vec<String>>>,
}

impl WebServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let heads = Arc::new(Mutex::new(Vec::new()));
        let recorded = heads.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                        if head.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    recorded
                        .lock()
                        .await
                        .push(String::from_utf8_lossy(&head).into_owned());
                    let response = format!(
                        "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                        BODY.len(),
                        BODY
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        Self { addr, heads }
    }
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_registry() -> String {
    let server = RegistryServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    server.spawn();
    addr
}

fn node_config(instance: u16, web: &WebServer, bogus_port: u16) -> Config {
    let mut config = Config::default();
    config.node.group = 7;
    config.node.instance = instance;
    config.node.peer_port = 0;
    config.node.proxy_port = 0;
    config.circuit.hops = 2;
    config.circuit.known_host = web.addr.to_string();
    config.circuit.bogus_host = format!("127.0.0.1:{}", bogus_port);
    config.circuit.probe_interval = Duration::from_millis(500);
    config
}

async fn start_overlay(count: u16, registry: &str, web: &WebServer) -> Vec<RouterNode> {
    let bogus_port = closed_port().await;
    let mut nodes = Vec::new();
    for instance in 1..=count {
        let directory = Arc::new(RegistryClient::new(registry.to_string()));
        let node = RouterNode::start(&node_config(instance, web, bogus_port), directory)
            .await
            .unwrap();
        nodes.push(node);
    }
    nodes
}

async fn wait_established(node: &RouterNode) {
    let mut state = node.circuit_state();
    tokio::time::timeout(
        Duration::from_secs(20),
        state.wait_for(|s| matches!(s, CircuitState::Established(_))),
    )
    .await
    .expect("entry circuit was not established in time")
    .unwrap();
}

/// Send one proxied GET and read the reply until the proxy closes.
async fn fetch(proxy_port: u16, target: SocketAddr) -> std::io::Result<String> {
    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await?;
    let request = format!(
        "GET http://{target}/index.html HTTP/1.1\r\nHost: {target}\r\nConnection: keep-alive\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await?;

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut reply))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "proxy reply timed out"))??;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

async fn fetch_eventually(proxy_port: u16, target: SocketAddr) -> String {
    let mut last = String::new();
    for _ in 0..20 {
        match fetch(proxy_port, target).await {
            Ok(reply) if reply.ends_with(BODY) => return reply,
            Ok(reply) => last = reply,
            Err(e) => last = e.to_string(),
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("no successful reply, last attempt: {last:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_crosses_overlay() {
    let web = WebServer::start().await;
    let registry = start_registry().await;
    let nodes = start_overlay(3, &registry, &web).await;

    for node in &nodes {
        wait_established(node).await;
    }

    for node in &nodes {
        let reply = fetch(node.proxy_port(), web.addr).await.unwrap();
        assert!(reply.starts_with("HTTP/1.0 200 OK"), "unexpected reply {reply:?}");
        assert!(reply.ends_with(BODY));
    }

    // The exit saw the rewritten request, not the client's original head.
    let heads = web.heads.lock().await.clone();
    let proxied: Vec<_> = heads.iter().filter(|h| h.contains("/index.html")).collect();
    assert_eq!(proxied.len(), nodes.len());
    for head in proxied {
        assert!(head.starts_with("GET http://"), "head {head:?}");
        assert!(head.contains("HTTP/1.0\r\n"));
        assert!(head.contains("Connection: close"));
        assert!(!head.contains("keep-alive"));
    }

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_circuit_survives_probes() {
    let web = WebServer::start().await;
    let registry = start_registry().await;
    let nodes = start_overlay(2, &registry, &web).await;

    wait_established(&nodes[0]).await;
    let before = nodes[0].routing().entry_forward().await;
    assert!(before.is_some());

    // Several probe intervals pass without a rebuild.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(nodes[0].routing().entry_forward().await, before);

    let reply = fetch(nodes[0].proxy_port(), web.addr).await.unwrap();
    assert!(reply.ends_with(BODY));

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlay_recovers_after_routers_leave() {
    let web = WebServer::start().await;
    let registry = start_registry().await;
    let mut nodes = start_overlay(3, &registry, &web).await;

    wait_established(&nodes[0]).await;
    fetch_eventually(nodes[0].proxy_port(), web.addr).await;

    // Only the first router remains; its next circuit runs through itself.
    for node in nodes.drain(1..) {
        node.shutdown().await;
    }

    let reply = fetch_eventually(nodes[0].proxy_port(), web.addr).await;
    assert!(reply.starts_with("HTTP/1.0 200 OK"));

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_missing_host_gets_bad_request() {
    let web = WebServer::start().await;
    let registry = start_registry().await;
    let nodes = start_overlay(1, &registry, &web).await;

    let mut client = TcpStream::connect(("127.0.0.1", nodes[0].proxy_port()))
        .await
        .unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.0 400"));

    for node in nodes {
        node.shutdown().await;
    }
}
