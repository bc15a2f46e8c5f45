//! In-memory registration server
//!
//! Every client connection may hold one registration; it disappears when the
//! client sends `unreg` or disconnects.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core_cell::AgentId;

#[derive(Debug, Clone)]
struct Entry {
    port: u16,
    name: String,
    agent: AgentId,
}

type Registrations = Arc<Mutex<BTreeMap<u64, Entry>>>;

pub struct RegistryServer {
    listener: TcpListener,
    registrations: Registrations,
}

impl RegistryServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registrations: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the task is dropped or aborted.
    pub async fn run(self) {
        info!(addr = ?self.listener.local_addr().ok(), "registry listening");
        let mut next_client = 0u64;
        loop {
            match self.listener.accept().await {
                Ok((socket, remote)) => {
                    next_client += 1;
                    let client = next_client;
                    let registrations = self.registrations.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(client, socket, registrations.clone()).await {
                            debug!(client, %remote, error = %e, "registry client failed");
                        }
                        if registrations.lock().await.remove(&client).is_some() {
                            info!(client, %remote, "registration dropped on disconnect");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "registry accept failed"),
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn serve(client: u64, socket: TcpStream, registrations: Registrations) -> io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = handle(client, line.trim(), &registrations).await;
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

async fn handle(client: u64, line: &str, registrations: &Registrations) -> String {
    if let Some(args) = line.strip_prefix("reg:") {
        return match parse_registration(args) {
            Some(entry) => {
                info!(client, port = entry.port, name = %entry.name, agent = entry.agent, "registered");
                registrations.lock().await.insert(client, entry);
                "ok".to_string()
            }
            None => format!("error bad registration `{}`", args),
        };
    }

    match line {
        "list" => registrations
            .lock()
            .await
            .values()
            .map(|e| format!("{} {} {}", e.port, e.name, e.agent))
            .collect::<Vec<_>>()
            .join(";"),
        "unreg" => {
            registrations.lock().await.remove(&client);
            "ok".to_string()
        }
        other => format!("error unknown command `{}`", other),
    }
}

fn parse_registration(args: &str) -> Option<Entry> {
    let mut fields = args.split_whitespace();
    let port = fields.next()?.parse().ok()?;
    let name = fields.next()?.to_string();
    let agent = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Entry { port, name, agent })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registration() {
        let entry = parse_registration("4000 Tor61Router-0001-0002 65538").unwrap();
        assert_eq!(entry.port, 4000);
        assert_eq!(entry.name, "Tor61Router-0001-0002");
        assert_eq!(entry.agent, 65538);

        assert!(parse_registration("4000 name").is_none());
        assert!(parse_registration("port name 1").is_none());
        assert!(parse_registration("1 name 1 extra").is_none());
    }

    #[tokio::test]
    async fn test_handle_commands() {
        let registrations: Registrations = Arc::new(Mutex::new(BTreeMap::new()));

        assert_eq!(handle(1, "reg:4000 a 1", &registrations).await, "ok");
        assert_eq!(handle(2, "reg:4001 b 2", &registrations).await, "ok");
        assert_eq!(handle(3, "list", &registrations).await, "4000 a 1;4001 b 2");

        assert_eq!(handle(1, "unreg", &registrations).await, "ok");
        assert_eq!(handle(3, "list", &registrations).await, "4001 b 2");
        assert!(handle(3, "bogus", &registrations).await.starts_with("error"));
    }
}
