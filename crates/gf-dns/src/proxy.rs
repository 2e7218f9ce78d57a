use crate::upstream::Forwarder;
use crate::wire::{extract_resolved, negative_reply, normalize_name};
use anyhow::{Context, Result};
use gf_core::{Action, Policy, ResolvedIp};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

/// Callback invoked with the addresses of every allowed answer, awaited
/// before the client sees the reply so the filter learns the IPs first.
pub type ResolvedHook =
    Arc<dyn Fn(Vec<ResolvedIp>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

const MAX_UDP_QUERY: usize = 4096;

/// Transparent DNS proxy. Serves UDP and TCP on the loopback listen
/// address the NAT redirect points at, one task per query.
pub struct DnsProxy {
    policy: RwLock<Arc<Policy>>,
    forwarder: Forwarder,
    on_resolved: RwLock<Option<ResolvedHook>>,
}

impl DnsProxy {
    pub fn new(upstream: SocketAddr, initial_policy: Policy) -> Arc<Self> {
        Arc::new(Self {
            policy: RwLock::new(Arc::new(initial_policy)),
            forwarder: Forwarder::new(upstream),
            on_resolved: RwLock::new(None),
        })
    }

    /// Inject the resolved-IP callback after construction; the filter
    /// controller does not exist yet when the proxy is built.
    pub fn set_on_resolved(&self, hook: ResolvedHook) {
        *self
            .on_resolved
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Swap the active policy snapshot. Queries in flight finish under the
    /// snapshot they loaded. `None` resets to deny-all.
    pub fn update_policy(&self, policy: Option<Policy>) {
        let next = Arc::new(policy.unwrap_or_else(Policy::deny_all));
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn current_policy(&self) -> Arc<Policy> {
        self.policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bind the UDP and TCP listeners and serve until the process exits.
    pub async fn run(self: Arc<Self>, listen: SocketAddr) -> Result<()> {
        let udp = Arc::new(
            UdpSocket::bind(listen)
                .await
                .with_context(|| format!("failed to bind DNS proxy UDP socket on {}", listen))?,
        );
        let tcp = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind DNS proxy TCP listener on {}", listen))?;

        info!(
            addr = %listen,
            upstream = %self.forwarder.upstream(),
            "DNS proxy listening"
        );

        let mut buf = vec![0u8; MAX_UDP_QUERY];
        loop {
            tokio::select! {
                received = udp.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            debug!("UDP recv error: {}", e);
                            continue;
                        }
                    };
                    let wire = buf[..len].to_vec();
                    let proxy = self.clone();
                    let udp = udp.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = proxy.handle_query(&wire).await {
                            if let Err(e) = udp.send_to(&reply, peer).await {
                                debug!("UDP reply to {} failed: {}", peer, e);
                            }
                        }
                    });
                }
                accepted = tcp.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            debug!("TCP accept error: {}", e);
                            continue;
                        }
                    };
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = proxy.serve_tcp(stream).await {
                            debug!("TCP session with {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }
    }

    async fn serve_tcp(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            // EOF between messages is a normal close.
            let len = match stream.read_u16().await {
                Ok(len) => len as usize,
                Err(_) => return Ok(()),
            };
            let mut wire = vec![0u8; len];
            stream.read_exact(&mut wire).await?;

            if let Some(reply) = self.handle_query(&wire).await {
                stream.write_u16(reply.len() as u16).await?;
                stream.write_all(&reply).await?;
            }
        }
    }

    /// Decide one query. Returns the wire-format reply, or `None` when the
    /// input is not worth answering.
    async fn handle_query(&self, wire: &[u8]) -> Option<Vec<u8>> {
        let req = match Message::from_bytes(wire) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping unparseable query: {}", e);
                return None;
            }
        };

        let Some(question) = req.queries().first() else {
            return encode(&negative_reply(&req, ResponseCode::FormErr));
        };
        let name = normalize_name(&question.name().to_utf8());

        match self.current_policy().evaluate(&name) {
            Action::Deny => {
                debug!(name = %name, "query denied");
                encode(&negative_reply(&req, ResponseCode::NXDomain))
            }
            Action::Allow => match self.forwarder.forward(wire).await {
                Ok(reply) => {
                    // Filter learns the answer IPs no later than the client.
                    self.notify_resolved(&reply).await;
                    Some(reply)
                }
                Err(e) => {
                    warn!(name = %name, "upstream query failed: {}", e);
                    encode(&negative_reply(&req, ResponseCode::ServFail))
                }
            },
        }
    }

    async fn notify_resolved(&self, reply_wire: &[u8]) {
        let Ok(reply) = Message::from_bytes(reply_wire) else {
            return;
        };
        let resolved = extract_resolved(&reply);
        if resolved.is_empty() {
            return;
        }

        let hook = self
            .on_resolved
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(resolved).await;
        }
    }
}

fn encode(msg: &Message) -> Option<Vec<u8>> {
    match msg.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("failed to encode DNS reply: {}", e);
            None
        }
    }
}
