use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::DnsConfig;
use crate::dns::blocklist;
use crate::dns::message::{DnsMessage, Rcode};
use crate::dns::resolver::Resolver;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

const RECV_BUFFER_SIZE: usize = 1500;
const CHANNEL_CAPACITY: usize = 100;

/// The listener polls with this deadline so shutdown is observed between
/// reads.
const POLL_TIMEOUT: Duration = Duration::from_secs(2);

struct WorkItem {
    message: DnsMessage,
    source: SocketAddr,
    received_at: Instant,
}

pub struct DnsServer {
    config: DnsConfig,
    resolver: Arc<Resolver>,
    socket: Arc<UdpSocket>,
    metrics: Arc<Metrics>,
    shutdown: watch::Sender<bool>,
}

impl DnsServer {
    pub async fn new(config: DnsConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let resolver = Arc::new(Resolver::new(
            config.upstream_servers.clone(),
            config.local_domains.clone(),
            Arc::clone(&metrics),
        ));

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(|bind_error| {
                Error::Socket(format!(
                    "failed to bind DNS socket on port {}: {}",
                    config.port, bind_error
                ))
            })?;

        info!("DNS server starting on port {}", config.port);

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            resolver,
            socket: Arc::new(socket),
            metrics,
            shutdown,
        })
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.resolver)
    }

    /// Loads the statically blocked domains and every configured blocklist
    /// source into the resolver.
    pub async fn load_blocklists(&self) {
        if !self.config.blocked_domains.is_empty() {
            self.resolver
                .add_blocklist_entries(self.config.blocked_domains.clone())
                .await;
        }
        if !self.config.block_lists.is_empty() {
            let hosts = blocklist::load_sources(&self.config.block_lists).await;
            self.resolver.add_blocklist_entries(hosts).await;
        }
        info!("blocklist holds {} domains", self.resolver.blocklist_len().await);
    }

    /// Runs listener, receiver and responder until [`DnsServer::stop`].
    pub async fn run(&self) -> Result<()> {
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel::<WorkItem>(CHANNEL_CAPACITY);

        // Receiver worker: resolve the question, translate the outcome to
        // an RCODE, hand the message on for serialization.
        let resolver = Arc::clone(&self.resolver);
        let receiver_response_tx = response_tx.clone();
        tokio::spawn(async move {
            let mut work_rx = work_rx;
            while let Some(mut item) = work_rx.recv().await {
                let question = &item.message.questions[0];
                debug!(
                    "received query {} {} from {}",
                    question.parsed_name, question.qtype, item.source
                );

                match resolver
                    .resolve(&question.parsed_name, question.qtype)
                    .await
                {
                    Ok((answers, authorities)) => {
                        item.message.header.set_rcode(Rcode::Success);
                        item.message.answers = answers;
                        item.message.authorities = authorities;
                    }
                    Err(Error::NxDomain) => {
                        item.message.header.set_rcode(Rcode::NameFailure);
                    }
                    Err(resolve_error) => {
                        debug!(
                            "unable to resolve {}: {}",
                            question.parsed_name, resolve_error
                        );
                        item.message.header.set_rcode(Rcode::ServerFailure);
                    }
                }

                if receiver_response_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        // Responder worker: stamp the response bits, serialize, transmit.
        let socket = Arc::clone(&self.socket);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let mut response_rx = response_rx;
            while let Some(mut item) = response_rx.recv().await {
                item.message.header.set_qr(true);
                item.message.header.set_ra(true);
                // EDNS is parsed but never echoed.
                item.message.additionals.clear();

                let data = item.message.encode();
                if let Err(send_error) = socket.send_to(&data, item.source).await {
                    error!("unable to send DNS response: {}", send_error);
                }

                metrics
                    .dns_req_time
                    .observe(item.received_at.elapsed().as_millis() as f64);
            }
        });

        info!("DNS server ready and listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            let received = match timeout(POLL_TIMEOUT, self.socket.recv_from(&mut buffer)).await {
                Err(_) => continue,
                Ok(Err(recv_error)) => {
                    error!("unable to read datagram: {}", recv_error);
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            let (size, source) = received;
            let received_at = Instant::now();

            match DnsMessage::parse(&buffer[..size]) {
                Ok(message) if !message.questions.is_empty() => {
                    let item = WorkItem {
                        message,
                        source,
                        received_at,
                    };
                    if work_tx.send(item).await.is_err() {
                        break;
                    }
                }
                Ok(_) => debug!("dropping question-less message from {}", source),
                Err(parse_error @ (Error::TooManyQuestions | Error::PacketMalformed(_))) => {
                    // The header already parsed, so enough structure
                    // survived to answer FORMERR directly.
                    debug!("rejecting message from {}: {}", source, parse_error);
                    if let Some(mut reply) = formerr_reply(&buffer[..size]) {
                        reply.source = source;
                        reply.received_at = received_at;
                        if response_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Err(parse_error) => {
                    warn!("unable to parse DNS message from {}: {}", source, parse_error);
                }
            }
        }

        info!("DNS server stopped");
        Ok(())
    }

    /// Signals the listener to exit after its next poll deadline.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Builds a header-only FORMERR response when at least the header of the
/// offending query is intact.
fn formerr_reply(data: &[u8]) -> Option<WorkItem> {
    if data.len() < 12 {
        return None;
    }

    let mut message = DnsMessage::new();
    message.header.id = u16::from_be_bytes([data[0], data[1]]);
    message.header.flags = u16::from_be_bytes([data[2], data[3]]);
    message.header.set_rcode(Rcode::FormatError);

    Some(WorkItem {
        message,
        source: SocketAddr::from(([0, 0, 0, 0], 0)),
        received_at: Instant::now(),
    })
}
