//! Browse, resolve and advertise DNS-SD services on the local link.
//!
//! This binary owns everything the library keeps behind seams: the
//! multicast socket, the tokio event loop and the wiring between the
//! responder and querier halves of the engine.
use std::cell::RefCell;
use std::io;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};

use mdnslib::cache::{ServiceCache, SocketKey};
use mdnslib::client::{MdnsServiceTypeClient, SearchOptions};
use mdnslib::deps::{Clock, MonotonicClock, Multicaster};
use mdnslib::error::MdnsResult;
use mdnslib::name::DnsName;
use mdnslib::network_order::message::{parse_packet, write_packet};
use mdnslib::repeater::PacketRepeater;
use mdnslib::repository::{EngineFeatures, NsdServiceInfo, RecordRepository};
use mdnslib::rfc6762::{MdnsPacket, MDNS_IPV4_GROUP, MDNS_PORT};
use mdnslib::util::pretty_cursor;

mod args;
use args::CliOptions;

mod display;
use display::PrintListener;

const ADVERTISE_ID: i32 = 1;

fn main() -> MdnsResult<()> {
    env_logger::init();

    let options = CliOptions::options()?;
    debug!("options: {:?}", &options);

    // single-threaded by design: the engine is an event-loop actor
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(options))
}

// Reuse-address socket on port 5353, joined to the IPv4 group.
fn open_socket() -> MdnsResult<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, MDNS_PORT).into();
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&MDNS_IPV4_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(tokio::net::UdpSocket::from_std(std_socket)?)
}

struct UdpMulticaster {
    socket: Rc<tokio::net::UdpSocket>,
}

impl Multicaster for UdpMulticaster {
    fn send(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.socket.try_send_to(buf, dest).map(|_| ())
    }
}

async fn run(options: CliOptions) -> MdnsResult<()> {
    let socket = Rc::new(open_socket()?);
    let out: Rc<dyn Multicaster> = Rc::new(UdpMulticaster {
        socket: socket.clone(),
    });
    let group: SocketAddr = (IpAddr::V4(MDNS_IPV4_GROUP), MDNS_PORT).into();

    let clock: Rc<dyn Clock> = Rc::new(MonotonicClock::new());
    let cache = Rc::new(RefCell::new(ServiceCache::new(clock.clone(), true)));

    // responder half, only when advertising
    let mut repository: Option<RecordRepository> = None;
    if let Some((name, port)) = &options.advertise {
        let hostname = DnsName::try_from(format!("{}.local", options.hostname).as_str())?;
        let mut repo = RecordRepository::new(clock.clone(), hostname, EngineFeatures::default());
        repo.update_addresses(options.addresses.clone());

        let info = NsdServiceInfo {
            service_name: name.clone(),
            service_type: DnsName::try_from(options.service_type.as_str())?,
            port: *port,
            subtypes: options.subtypes.clone(),
            ..Default::default()
        };
        repo.add_service(ADVERTISE_ID, info, None)?;

        let repeater = PacketRepeater::new(out.clone(), vec![group]);
        let probing = repo.set_service_probing(ADVERTISE_ID)?;
        repeater.probe(&probing).await?;
        // conflicts arriving during the probe window surface in the receive
        // loop below; a full stack renames and re-probes
        let announcement = repo.on_probing_succeeded(&probing)?;
        let sent = repeater.announce(&announcement).await?;
        repo.on_advertisement_sent(ADVERTISE_ID, sent);
        println!("advertising {} on port {}", name, port);
        repository = Some(repo);
    }

    // querier half
    let type_name = DnsName::try_from(format!("{}.local", options.service_type).as_str())?;
    let socket_key = SocketKey {
        network_handle: None,
        interface_index: 0,
    };
    let mut client =
        MdnsServiceTypeClient::new(type_name, socket_key, clock.clone(), cache.clone());
    client.start_send_and_receive(
        Rc::new(PrintListener),
        SearchOptions {
            query_mode: options.mode,
            resolve_instance_name: options.resolve.clone(),
            subtypes: options.subtypes.clone(),
        },
    );
    println!("browsing {} (ctrl-c to stop)", options.service_type);

    let mut buf = vec![0u8; 9000];
    loop {
        let now = clock.elapsed_ms();
        let until_query = client
            .next_query_at()
            .map(|at| at.saturating_sub(now))
            .unwrap_or(3_600_000);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            _ = tokio::time::sleep(Duration::from_millis(until_query)) => {
                let session = client.session_id();
                for packet in client.on_query_timer(session) {
                    send_packet(&*out, &packet, group);
                }
            }

            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("recv failed: {}", e);
                        continue;
                    }
                };
                if options.debug {
                    pretty_cursor(&Cursor::new(&buf[..len]));
                }
                // a malformed packet is dropped, the loop continues
                let packet = match parse_packet(&buf[..len], clock.elapsed_ms()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("dropping malformed packet from {}: {}", src, e);
                        continue;
                    }
                };

                if packet.is_response() {
                    client.handle_response(&packet);
                    if let Some(repo) = repository.as_ref() {
                        for (id, kind) in repo.get_conflicting_services(&packet) {
                            warn!("conflict {:#x} on service {}; rename and re-register", kind, id);
                        }
                    }
                } else if let Some(repo) = repository.as_mut() {
                    if let Some(reply) = repo.get_reply(&packet, src) {
                        if reply.send_delay_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(reply.send_delay_ms)).await;
                        }
                        send_packet(&*out, &reply.packet, reply.destination);
                    }
                }
            }
        }
    }

    // withdraw on the way out
    if let Some(mut repo) = repository {
        if let Some(goodbye) = repo.exit_service(ADVERTISE_ID) {
            let repeater = PacketRepeater::new(out.clone(), vec![group]);
            repeater.goodbye(&goodbye).await?;
        }
        repo.remove_service(ADVERTISE_ID);
    }
    Ok(())
}

fn send_packet(out: &dyn Multicaster, packet: &MdnsPacket, dest: SocketAddr) {
    match write_packet(packet) {
        Ok(bytes) => {
            if let Err(e) = out.send(&bytes, dest) {
                warn!("send to {} failed: {}", dest, e);
            }
        }
        Err(e) => warn!("packet serialization failed: {}", e),
    }
}
