use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{DhcpConfig, normalize_mac, sanitize_hostname};
use crate::dhcp::lease::{LeasePool, LeaseState};
use crate::dhcp::options::{MessageType, OptionTag, Options};
use crate::dhcp::packet::{BOOTREQUEST, DhcpPacket, FIXED_HEADER_SIZE};
use crate::dhcp::store::{FileLeaseStore, LeaseStore};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

const DHCP_SERVER_PORT: u16 = 67;
const RECV_BUFFER_SIZE: usize = 1500;
const CHANNEL_CAPACITY: usize = 100;
const NUM_WORKERS: usize = 10;

struct Inbound {
    data: Vec<u8>,
    source: SocketAddr,
}

struct Outbound {
    data: Vec<u8>,
    dest: SocketAddr,
}

pub struct DhcpServer {
    handler: Arc<RequestHandler>,
    socket: Arc<UdpSocket>,
    store: Arc<dyn LeaseStore>,
    metrics: Arc<Metrics>,
    broadcast_addr: Ipv4Addr,
}

impl DhcpServer {
    pub async fn new(config: DhcpConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let pool = Arc::new(LeasePool::new(config.start_addr, config.end_addr));
        let store: Arc<dyn LeaseStore> = Arc::new(FileLeaseStore::new(&config.lease_file));

        // A broken lease file degrades to an empty pool rather than
        // refusing to start.
        match store.load() {
            Ok(leases) if !leases.is_empty() => {
                let restored = pool.restore(leases, config.lease_ttl_seconds).await;
                info!("restored {} leases from {}", restored, config.lease_file);
            }
            Ok(_) => {}
            Err(load_error) => warn!("unable to load leases: {}", load_error),
        }

        for (mac, ip) in &config.reserved_addresses {
            let client_id = normalize_mac(mac);
            match pool.reserve_lease(&client_id, *ip).await {
                Ok(()) => info!("reserving {} for {}", ip, client_id),
                Err(reserve_error) => {
                    warn!("unable to reserve {} for {}: {}", ip, client_id, reserve_error);
                }
            }
        }

        let socket = Arc::new(Self::create_socket()?);
        let broadcast_addr = config.broadcast_addr();

        info!(
            "DHCP server starting on {}:{}, pool {} - {}",
            config.server_ip, DHCP_SERVER_PORT, config.start_addr, config.end_addr
        );
        debug!("directed broadcast is {}", broadcast_addr);

        Ok(Self {
            handler: Arc::new(RequestHandler { config, pool }),
            socket,
            store,
            metrics,
            broadcast_addr,
        })
    }

    fn create_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|socket_error| Error::Socket(format!("failed to create socket: {}", socket_error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|socket_error| Error::Socket(format!("failed to set SO_REUSEADDR: {}", socket_error)))?;

        socket
            .set_broadcast(true)
            .map_err(|socket_error| Error::Socket(format!("failed to set SO_BROADCAST: {}", socket_error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|socket_error| Error::Socket(format!("failed to set non-blocking: {}", socket_error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket
            .bind(&bind_addr.into())
            .map_err(|bind_error| Error::Socket(format!("failed to bind to {}: {}", bind_addr, bind_error)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
            .map_err(|convert_error| Error::Socket(format!("failed to convert to tokio socket: {}", convert_error)))
    }

    pub fn pool(&self) -> Arc<LeasePool> {
        Arc::clone(&self.handler.pool)
    }

    /// Runs the listener and worker pipeline until the future is dropped.
    pub async fn run(&self) -> Result<()> {
        let (request_tx, request_rx) = mpsc::channel::<Inbound>(CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

        let request_rx = Arc::new(Mutex::new(request_rx));
        let response_rx = Arc::new(Mutex::new(response_rx));

        for _ in 0..NUM_WORKERS {
            let request_rx = Arc::clone(&request_rx);
            let response_tx = response_tx.clone();
            let handler = Arc::clone(&self.handler);
            let metrics = Arc::clone(&self.metrics);
            let broadcast_addr = self.broadcast_addr;

            tokio::spawn(async move {
                loop {
                    let inbound = { request_rx.lock().await.recv().await };
                    let Some(inbound) = inbound else { break };

                    let started = Instant::now();
                    let packet = match DhcpPacket::parse(&inbound.data) {
                        Ok(packet) => packet,
                        Err(parse_error) => {
                            debug!("dropping packet from {}: {}", inbound.source, parse_error);
                            continue;
                        }
                    };

                    let Some(message_type) = packet.options.message_type() else {
                        debug!("dropping packet without message type from {}", inbound.source);
                        continue;
                    };
                    let op_label = message_type.to_string();
                    metrics.dhcp_ops.with_label_values(&[op_label.as_str()]).inc();

                    if let Some(reply) = handler.handle(message_type, &packet).await {
                        if let Some(reply_type) = reply.options.message_type() {
                            let reply_label = reply_type.to_string();
                            metrics
                                .dhcp_ops
                                .with_label_values(&[reply_label.as_str()])
                                .inc();
                        }

                        let dest = match inbound.source {
                            SocketAddr::V4(v4) if *v4.ip() == Ipv4Addr::UNSPECIFIED => {
                                SocketAddr::new(IpAddr::V4(broadcast_addr), v4.port())
                            }
                            other => other,
                        };
                        let outbound = Outbound {
                            data: reply.encode(),
                            dest,
                        };
                        if response_tx.send(outbound).await.is_err() {
                            break;
                        }
                    }

                    metrics
                        .dhcp_req_time
                        .observe(started.elapsed().as_millis() as f64);
                }
            });
        }
        drop(response_tx);

        for _ in 0..NUM_WORKERS {
            let response_rx = Arc::clone(&response_rx);
            let socket = Arc::clone(&self.socket);

            tokio::spawn(async move {
                loop {
                    let outbound = { response_rx.lock().await.recv().await };
                    let Some(outbound) = outbound else { break };

                    debug!("responding at {}", outbound.dest);
                    if let Err(send_error) = socket.send_to(&outbound.data, outbound.dest).await {
                        error!("unable to respond to client: {}", send_error);
                    }
                }
            });
        }

        info!("DHCP server ready and listening");

        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    if size >= FIXED_HEADER_SIZE && buffer[0] == BOOTREQUEST {
                        let inbound = Inbound {
                            data: buffer[..size].to_vec(),
                            source,
                        };
                        if request_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                }
                Err(recv_error) => {
                    error!("error receiving packet: {}", recv_error);
                }
            }
        }

        Ok(())
    }

    /// Persists the Active lease set. Called on shutdown; errors propagate.
    pub async fn save_leases(&self) -> Result<()> {
        let leases = self.handler.pool.active_leases().await;
        self.store.persist(&leases)
    }
}

struct RequestHandler {
    config: DhcpConfig,
    pool: Arc<LeasePool>,
}

impl RequestHandler {
    async fn handle(&self, message_type: MessageType, packet: &DhcpPacket) -> Option<DhcpPacket> {
        debug!(
            "{} starting transaction {:08x}: {}",
            packet.mac_address(),
            packet.xid,
            message_type
        );

        match message_type {
            MessageType::Discover => self.handle_discover(packet).await,
            MessageType::Request => self.handle_request(packet).await,
            MessageType::Release => self.handle_release(packet).await,
            other => {
                debug!("ignoring {} message", other);
                None
            }
        }
    }

    async fn handle_discover(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let client_id = packet.mac_address();

        let offered_ip = if let Some(existing) = self.pool.get_lease(&client_id).await {
            debug!("found existing lease {} for {}", existing.ip, client_id);
            existing.ip
        } else if let Some(next) = self.pool.next_available_lease(&client_id).await {
            info!("holding available lease {} for {}", next.ip, client_id);
            next.ip
        } else {
            warn!("unable to offer a lease: {}", Error::PoolExhausted);
            return None;
        };

        info!("offering address {} to {}", offered_ip, client_id);
        Some(DhcpPacket::reply(
            packet,
            MessageType::Offer,
            self.config.server_ip,
            offered_ip,
            self.config.lease_ttl_seconds,
            self.base_options(),
        ))
    }

    async fn handle_request(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let client_id = packet.mac_address();

        if let Some(server_id) = packet.options.server_identifier()
            && server_id != self.config.server_ip
        {
            debug!("client {} is requesting an address from {}", client_id, server_id);
            return None;
        }

        let requested = packet.options.requested_ip().unwrap_or(packet.ciaddr);
        debug!("{} requests address {}", client_id, requested);

        let ttl = self.config.lease_ttl_seconds;
        let (message_type, yiaddr) = match self.pool.get_lease(&client_id).await {
            None => (MessageType::Nak, Ipv4Addr::UNSPECIFIED),
            Some(lease) => {
                if let Some(hostname) = packet.options.hostname() {
                    self.pool
                        .set_hostname(&client_id, &sanitize_hostname(&hostname))
                        .await;
                }

                if lease.ip != requested {
                    info!("reject requested address {} from {}", requested, client_id);
                    (MessageType::Nak, Ipv4Addr::UNSPECIFIED)
                } else {
                    match lease.state {
                        LeaseState::Offered => {
                            info!("confirm address {} for {}", requested, client_id);
                            self.pool.accept_lease(&lease, ttl).await;
                            (MessageType::Ack, requested)
                        }
                        LeaseState::Reserved => {
                            info!("ack reserved address {} for {}", requested, client_id);
                            self.pool.touch_reserved(&client_id, ttl).await;
                            (MessageType::Ack, requested)
                        }
                        LeaseState::Active => {
                            info!("extend address {} for {}", requested, client_id);
                            self.pool.accept_lease(&lease, ttl).await;
                            (MessageType::Ack, requested)
                        }
                        LeaseState::Available => {
                            info!("lease for {} is invalid, resetting and nacking", client_id);
                            self.pool.release_lease(&lease).await;
                            (MessageType::Nak, Ipv4Addr::UNSPECIFIED)
                        }
                    }
                }
            }
        };

        Some(DhcpPacket::reply(
            packet,
            message_type,
            self.config.server_ip,
            yiaddr,
            ttl,
            self.base_options(),
        ))
    }

    async fn handle_release(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let client_id = packet.mac_address();

        if let Some(lease) = self.pool.get_lease(&client_id).await {
            // A static binding survives the client letting go of it.
            if lease.state == LeaseState::Reserved {
                debug!("ignoring release of reserved binding for {}", client_id);
            } else {
                info!("{} releasing {}", client_id, lease.ip);
                self.pool.release_lease(&lease).await;
            }
        }

        None
    }

    fn base_options(&self) -> Options {
        let mut options = Options::new();
        options.insert_ip(OptionTag::ServerIdentifier, self.config.server_ip);
        options.insert_ip(OptionTag::Router, self.config.router);
        options.insert_ip(OptionTag::SubnetMask, self.config.subnet_mask);
        options.insert_ips(OptionTag::DomainNameServer, &self.config.name_servers);
        if !self.config.domain_name.is_empty() {
            options.insert_str(OptionTag::DomainName, &self.config.domain_name);
        }
        options
    }
}
