//! Registration client
//!
//! Speaks the newline-terminated registry protocol over one long-lived TCP
//! connection. Registrations live as long as that connection, so a dropped
//! connection is re-established and the last registration replayed before
//! the next request.
//!
//! ```text
//! reg:<port> <name> <agent>   -> ok
//! list                        -> <port> <name> <agent>;<port> <name> <agent>...
//! unreg                       -> ok
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Directory, DirectoryError, RouterDescriptor};
use crate::core_cell::AgentId;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

#[derive(Debug, Clone)]
struct Registration {
    port: u16,
    name: String,
    agent: AgentId,
}

impl Registration {
    fn line(&self) -> String {
        format!("reg:{} {} {}", self.port, self.name, self.agent)
    }
}

pub struct RegistryClient {
    addr: String,
    router_host: String,
    timeout: Duration,
    session: Mutex<Option<Session>>,
    registration: Mutex<Option<Registration>>,
}

impl RegistryClient {
    /// # Arguments
    /// * `addr` - `host:port` of the registry
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            router_host: "127.0.0.1".to_string(),
            timeout: DEFAULT_TIMEOUT,
            session: Mutex::new(None),
            registration: Mutex::new(None),
        }
    }

    /// Host recorded for every router in fetched lists.
    pub fn with_router_host(mut self, host: impl Into<String>) -> Self {
        self.router_host = host.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<Session, DirectoryError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| DirectoryError::Unreachable(format!("{}: connect timed out", self.addr)))?
            .map_err(|e| DirectoryError::Unreachable(format!("{}: {}", self.addr, e)))?;
        let (reader, writer) = stream.into_split();
        debug!(registry = %self.addr, "connected to registry");
        Ok(Session {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn exchange(&self, session: &mut Session, line: &str) -> Result<String, DirectoryError> {
        let io = async {
            session.writer.write_all(line.as_bytes()).await?;
            session.writer.write_all(b"\n").await?;
            let mut reply = String::new();
            let read = session.reader.read_line(&mut reply).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "registry closed the connection",
                ));
            }
            Ok::<_, std::io::Error>(reply.trim_end_matches(['\r', '\n']).to_string())
        };

        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| DirectoryError::Unreachable(format!("{}: request timed out", self.addr)))?
            .map_err(|e| DirectoryError::Unreachable(format!("{}: {}", self.addr, e)))
    }

    /// Send one request line, reconnecting (and re-registering) if needed.
    async fn request(&self, line: &str) -> Result<String, DirectoryError> {
        let mut guard = self.session.lock().await;

        if guard.is_none() {
            let mut session = self.connect().await?;
            let replay = self.registration.lock().await.clone();
            if let Some(registration) = replay {
                if !line.starts_with("reg:") {
                    let reply = self.exchange(&mut session, &registration.line()).await?;
                    expect_ok(&reply).map_err(DirectoryError::Registration)?;
                    info!(registry = %self.addr, "restored registration after reconnect");
                }
            }
            *guard = Some(session);
        }

        let Some(session) = guard.as_mut() else {
            return Err(DirectoryError::Unreachable(self.addr.clone()));
        };
        match self.exchange(session, line).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    async fn list(&self) -> Result<Vec<RouterDescriptor>, DirectoryError> {
        let reply = self.request("list").await?;
        parse_list(&reply, &self.router_host)
    }
}

fn expect_ok(reply: &str) -> Result<(), String> {
    if reply == "ok" {
        Ok(())
    } else {
        Err(reply.to_string())
    }
}

fn parse_list(reply: &str, host: &str) -> Result<Vec<RouterDescriptor>, DirectoryError> {
    reply
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let fields: Vec<&str> = entry.split_whitespace().collect();
            let [port, _name, agent] = fields.as_slice() else {
                return Err(DirectoryError::Protocol(format!("bad entry `{}`", entry)));
            };
            let port = port
                .parse()
                .map_err(|_| DirectoryError::Protocol(format!("bad port in `{}`", entry)))?;
            let agent = agent
                .parse()
                .map_err(|_| DirectoryError::Protocol(format!("bad agent id in `{}`", entry)))?;
            Ok(RouterDescriptor::new(host, port, agent))
        })
        .collect()
}

#[async_trait]
impl Directory for RegistryClient {
    async fn register(&self, port: u16, name: &str, agent: AgentId) -> Result<(), DirectoryError> {
        let registration = Registration {
            port,
            name: name.to_string(),
            agent,
        };
        let reply = self
            .request(&registration.line())
            .await
            .map_err(|e| DirectoryError::Registration(e.to_string()))?;
        expect_ok(&reply).map_err(DirectoryError::Registration)?;

        info!(registry = %self.addr, port, name, agent, "registered");
        *self.registration.lock().await = Some(registration);
        Ok(())
    }

    async fn fetch_router_list(&self) -> Result<Vec<RouterDescriptor>, DirectoryError> {
        let routers = self.list().await?;
        if !routers.is_empty() {
            return Ok(routers);
        }

        // An empty list usually means the registry forgot us; register again
        // and give it one more try.
        let registration = self.registration.lock().await.clone();
        if let Some(registration) = registration {
            warn!(registry = %self.addr, "router list empty, re-registering");
            self.register(registration.port, &registration.name, registration.agent)
                .await?;
            return self.list().await;
        }
        Ok(routers)
    }

    async fn unregister(&self) -> Result<(), DirectoryError> {
        if self.registration.lock().await.take().is_none() {
            return Err(DirectoryError::NotRegistered);
        }
        let reply = self.request("unreg").await?;
        expect_ok(&reply).map_err(DirectoryError::Protocol)?;
        debug!(registry = %self.addr, "unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let routers = parse_list("4000 Tor61Router-0001-0001 65537;4001 Tor61Router-0001-0002 65538", "127.0.0.1").unwrap();
        assert_eq!(
            routers,
            vec![
                RouterDescriptor::new("127.0.0.1", 4000, 65537),
                RouterDescriptor::new("127.0.0.1", 4001, 65538),
            ]
        );
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(parse_list("", "127.0.0.1").unwrap().is_empty());
        assert!(parse_list(" ; ", "127.0.0.1").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_list("4000 onlytwo", "h"),
            Err(DirectoryError::Protocol(_))
        ));
        assert!(matches!(
            parse_list("notaport name 1", "h"),
            Err(DirectoryError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = RegistryClient::new(format!("127.0.0.1:{}", port));
        assert!(matches!(
            client.fetch_router_list().await,
            Err(DirectoryError::Unreachable(_))
        ));
        assert!(matches!(
            client.register(1, "x", 1).await,
            Err(DirectoryError::Registration(_))
        ));
    }
}
