//! Timed delivery of the repository's probe and announcement templates.
//!
//! The repository only produces packets; this repeater paces them: three
//! probes 250 ms apart (the first after a random 0-250 ms settle delay),
//! announcements with exponential spacing from 1 s, goodbyes back to back.
//! A conflict aborts a probe run by racing it against the conflict signal at
//! the call site (`tokio::select!`); the repeater itself has no state.
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use tokio::time::sleep;

use crate::deps::Multicaster;
use crate::error::MdnsResult;
use crate::network_order::message::write_packet;
use crate::repository::{AnnouncementInfo, ProbingInfo};
use crate::rfc6762::MdnsPacket;

/// RFC 6762 §8.1: three probes, 250 ms apart
pub const PROBE_COUNT: u32 = 3;
const PROBE_INTERVAL_MS: u64 = 250;

/// announcements run 1 s, 2 s, 4 s, ... apart (RFC 6762 §8.3)
const ANNOUNCE_INITIAL_DELAY_MS: u64 = 1_000;

/// Send counts; the RFC permits 2-8 announcements and 1-2 goodbyes.
#[derive(Debug, Clone, Copy)]
pub struct RepeaterConfig {
    pub announcement_count: u32,
    pub goodbye_count: u32,
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            announcement_count: 3,
            goodbye_count: 1,
        }
    }
}

pub struct PacketRepeater {
    out: Rc<dyn Multicaster>,
    destinations: Vec<SocketAddr>,
    config: RepeaterConfig,
}

impl PacketRepeater {
    pub fn new(out: Rc<dyn Multicaster>, destinations: Vec<SocketAddr>) -> Self {
        Self::with_config(out, destinations, RepeaterConfig::default())
    }

    pub fn with_config(
        out: Rc<dyn Multicaster>,
        destinations: Vec<SocketAddr>,
        config: RepeaterConfig,
    ) -> Self {
        Self {
            out,
            destinations,
            config,
        }
    }

    /// Run the three-probe exchange for one tentative name. Returns the
    /// number of probes sent; the caller checks for conflicts concurrently.
    pub async fn probe(&self, probing: &ProbingInfo) -> MdnsResult<u32> {
        let settle = rand::thread_rng().gen_range(0..=PROBE_INTERVAL_MS);
        sleep(Duration::from_millis(settle)).await;

        for attempt in 0..PROBE_COUNT {
            if attempt > 0 {
                sleep(Duration::from_millis(PROBE_INTERVAL_MS)).await;
            }
            let packet = probe_attempt_packet(probing, attempt);
            debug!(
                "probe {}/{} for service {}",
                attempt + 1,
                PROBE_COUNT,
                probing.service_id
            );
            self.send(&packet)?;
        }
        Ok(PROBE_COUNT)
    }

    /// Repeat an announcement with exponential spacing. Returns how many
    /// went out, which feeds `on_advertisement_sent`.
    pub async fn announce(&self, announcement: &AnnouncementInfo) -> MdnsResult<u32> {
        let count = self.config.announcement_count.clamp(2, 8);
        for attempt in 0..count {
            sleep(Duration::from_millis(announce_delay_ms(attempt))).await;
            debug!(
                "announcement {}/{} for service {}",
                attempt + 1,
                count,
                announcement.service_id
            );
            self.send(&announcement.packet)?;
        }
        Ok(count)
    }

    /// Send the goodbye once or twice, no pacing needed.
    pub async fn goodbye(&self, announcement: &AnnouncementInfo) -> MdnsResult<u32> {
        let count = self.config.goodbye_count.clamp(1, 2);
        for attempt in 0..count {
            if attempt > 0 {
                sleep(Duration::from_millis(PROBE_INTERVAL_MS)).await;
            }
            self.send(&announcement.packet)?;
        }
        Ok(count)
    }

    // serialize once, best-effort to every destination
    fn send(&self, packet: &MdnsPacket) -> MdnsResult<()> {
        let bytes = write_packet(packet)?;
        for dest in &self.destinations {
            if let Err(e) = self.out.send(&bytes, *dest) {
                warn!("send to {} failed: {}", dest, e);
            }
        }
        Ok(())
    }
}

/// Probe packet for one attempt: the first two transmissions request a
/// unicast reply, the last clears the bit (RFC 6762 §8.1).
pub fn probe_attempt_packet(probing: &ProbingInfo, attempt: u32) -> MdnsPacket {
    let mut packet = probing.packet.clone();
    let unicast = attempt < PROBE_COUNT - 1;
    for q in &mut packet.questions {
        q.unicast_reply = unicast;
    }
    packet
}

/// Delay before announcement number `attempt` (0-based): the first goes out
/// immediately, then 1 s, 2 s, 4 s, ...
pub fn announce_delay_ms(attempt: u32) -> u64 {
    if attempt == 0 {
        0
    } else {
        ANNOUNCE_INITIAL_DELAY_MS << (attempt - 1)
    }
}
