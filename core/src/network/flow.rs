use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::config::ExtractionConfig;
use crate::network::capture_file::{decode_frame, read_frames, Segment};
use crate::network::dns::DnsMap;
use crate::network::subnet::SubnetClassifier;
use crate::utils::{format_timestamp_micros, write_atomically};
use crate::Result;

/// Unresolved-endpoint warnings emitted per file before dropping to debug level.
const MAX_ENDPOINT_WARNINGS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "SrcIP")]
    pub src_ip: Ipv4Addr,
    #[serde(rename = "DstIP")]
    pub dst_ip: Ipv4Addr,
    #[serde(rename = "SrcPort")]
    pub src_port: u16,
    #[serde(rename = "DstPort")]
    pub dst_port: u16,
    #[serde(rename = "Protocol")]
    pub protocol: u8,
    #[serde(rename = "Upstream")]
    pub upstream: bool,
    /// Microseconds since the Unix epoch.
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "PktLength")]
    pub pkt_length: usize,
    #[serde(rename = "PayloadSize")]
    pub payload_size: usize,
}

impl Packet {
    pub fn local_endpoint(&self) -> (Ipv4Addr, u16) {
        if self.upstream {
            (self.src_ip, self.src_port)
        } else {
            (self.dst_ip, self.dst_port)
        }
    }

    pub fn remote_endpoint(&self) -> (Ipv4Addr, u16) {
        if self.upstream {
            (self.dst_ip, self.dst_port)
        } else {
            (self.src_ip, self.src_port)
        }
    }

    /// Identity of the flow this packet belongs to, always in upstream orientation.
    pub fn flow_id(&self) -> String {
        let (local_ip, local_port) = self.local_endpoint();
        let (remote_ip, remote_port) = self.remote_endpoint();
        flow_id(local_ip, local_port, remote_ip, remote_port, self.protocol)
    }
}

pub fn flow_id(
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    protocol: u8,
) -> String {
    format!(
        "{}:{}-{}:{}@{}",
        local_ip, local_port, remote_ip, remote_port, protocol
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(rename = "LocalIP")]
    pub local_ip: Ipv4Addr,
    #[serde(rename = "RemoteIP")]
    pub remote_ip: Ipv4Addr,
    #[serde(rename = "LocalPort")]
    pub local_port: u16,
    #[serde(rename = "RemotePort")]
    pub remote_port: u16,
    #[serde(rename = "Protocol")]
    pub protocol: u8,
    #[serde(rename = "ServiceFlowType")]
    pub service_flow_type: String,
    #[serde(rename = "DNSName")]
    pub dns_name: String,
    #[serde(rename = "Packets")]
    pub packets: Vec<Packet>,
}

impl Flow {
    /// Fixes the local and remote roles from the first packet seen for the flow.
    pub fn from_first_packet(packet: Packet, dns: &DnsMap) -> Self {
        let (local_ip, local_port) = packet.local_endpoint();
        let (remote_ip, remote_port) = packet.remote_endpoint();
        let name = dns
            .lookup(&IpAddr::V4(remote_ip))
            .unwrap_or_default()
            .to_string();

        Self {
            local_ip,
            remote_ip,
            local_port,
            remote_port,
            protocol: packet.protocol,
            service_flow_type: name.clone(),
            dns_name: name,
            packets: vec![packet],
        }
    }

    pub fn flow_id(&self) -> String {
        flow_id(
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port,
            self.protocol,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowUpdate {
    Created,
    Appended,
    Capped,
}

/// Flows of one capture keyed by identity string.
#[derive(Debug, Clone, Default)]
pub struct FlowTable {
    flows: BTreeMap<String, Flow>,
    max_packets_per_flow: usize,
}

impl FlowTable {
    /// `max_packets_per_flow` of 0 keeps every packet.
    pub fn new(max_packets_per_flow: usize) -> Self {
        Self {
            flows: BTreeMap::new(),
            max_packets_per_flow,
        }
    }

    pub fn insert_or_append(&mut self, packet: Packet, dns: &DnsMap) -> FlowUpdate {
        match self.flows.entry(packet.flow_id()) {
            Entry::Vacant(entry) => {
                entry.insert(Flow::from_first_packet(packet, dns));
                FlowUpdate::Created
            }
            Entry::Occupied(mut entry) => {
                let flow = entry.get_mut();
                if self.max_packets_per_flow > 0 && flow.packets.len() >= self.max_packets_per_flow {
                    return FlowUpdate::Capped;
                }
                flow.packets.push(packet);
                FlowUpdate::Appended
            }
        }
    }

    pub fn get(&self, flow_id: &str) -> Option<&Flow> {
        self.flows.get(flow_id)
    }

    pub fn flows(&self) -> impl Iterator<Item = (&str, &Flow)> {
        self.flows.iter().map(|(id, flow)| (id.as_str(), flow))
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn packet_count(&self) -> usize {
        self.flows.values().map(|flow| flow.packets.len()).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.flows)?)
    }
}

/// Why a decoded segment was kept out of the flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotIpv4,
    NoLocalEndpoint,
    Unclassified,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    pub frames: u64,
    pub packets_kept: u64,
    pub flows: usize,
    pub undecodable: u64,
    pub not_ipv4: u64,
    pub no_local_endpoint: u64,
    pub unclassified: u64,
    pub capped: u64,
    pub first_timestamp_us: Option<i64>,
    pub last_timestamp_us: Option<i64>,
}

impl ExtractionStats {
    fn observe_timestamp(&mut self, timestamp_us: i64) {
        self.first_timestamp_us.get_or_insert(timestamp_us);
        self.last_timestamp_us = Some(timestamp_us);
    }

    pub fn dropped(&self) -> u64 {
        self.undecodable + self.not_ipv4 + self.no_local_endpoint + self.unclassified + self.capped
    }
}

#[derive(Debug, Clone)]
pub struct FlowExtractor {
    classifier: SubnetClassifier,
    service_ports: RangeInclusive<u16>,
    max_packets_per_flow: usize,
    buffer_size: usize,
}

impl FlowExtractor {
    pub fn new(classifier: SubnetClassifier, service_ports: RangeInclusive<u16>) -> Self {
        Self {
            classifier,
            service_ports,
            max_packets_per_flow: 0,
            buffer_size: 65536,
        }
    }

    pub fn from_config(config: &ExtractionConfig, buffer_size: usize) -> Result<Self> {
        let classifier = SubnetClassifier::from_cidrs(&config.local_subnets)?;
        let [low, high] = config.service_port_range;
        Ok(Self::new(classifier, low..=high)
            .with_max_packets(config.max_packets_per_flow)
            .with_buffer_size(buffer_size))
    }

    pub fn with_max_packets(mut self, max_packets_per_flow: usize) -> Self {
        self.max_packets_per_flow = max_packets_per_flow;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Turns a decoded segment into a flow packet, or says why it is not wanted.
    pub fn classify(
        &self,
        segment: &Segment<'_>,
        timestamp_us: i64,
        frame_len: usize,
        dns: &DnsMap,
    ) -> std::result::Result<Packet, Rejection> {
        let header = &segment.header;
        let (src_ip, dst_ip) = match (header.src_ip, header.dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => (src, dst),
            _ => return Err(Rejection::NotIpv4),
        };

        let upstream = if self.classifier.is_local_v4(src_ip) {
            true
        } else if self.classifier.is_local_v4(dst_ip) {
            false
        } else {
            return Err(Rejection::NoLocalEndpoint);
        };

        let packet = Packet {
            src_ip,
            dst_ip,
            src_port: header.src_port,
            dst_port: header.dst_port,
            protocol: header.protocol,
            upstream,
            timestamp: timestamp_us,
            pkt_length: frame_len,
            payload_size: segment.payload.len(),
        };

        let (remote_ip, _) = packet.remote_endpoint();
        let (_, local_port) = packet.local_endpoint();
        if !dns.contains(&IpAddr::V4(remote_ip)) && !self.service_ports.contains(&local_port) {
            return Err(Rejection::Unclassified);
        }
        Ok(packet)
    }

    /// Builds the flow table for a capture.
    pub fn extract(&self, capture: &Path, dns: &DnsMap) -> Result<(FlowTable, ExtractionStats)> {
        let mut table = FlowTable::new(self.max_packets_per_flow);
        let mut stats = ExtractionStats::default();

        let frames = read_frames(capture, self.buffer_size, |frame| {
            let segment = match decode_frame(frame.linktype, frame.data) {
                Ok(segment) => segment,
                Err(skip) => {
                    stats.undecodable += 1;
                    log::debug!("Skipping frame at {}: {}", frame.timestamp_us, skip);
                    return Ok(());
                }
            };

            match self.classify(&segment, frame.timestamp_us, frame.data.len(), dns) {
                Ok(packet) => {
                    stats.observe_timestamp(packet.timestamp);
                    match table.insert_or_append(packet, dns) {
                        FlowUpdate::Created | FlowUpdate::Appended => stats.packets_kept += 1,
                        FlowUpdate::Capped => stats.capped += 1,
                    }
                }
                Err(Rejection::NotIpv4) => stats.not_ipv4 += 1,
                Err(Rejection::NoLocalEndpoint) => {
                    stats.no_local_endpoint += 1;
                    if stats.no_local_endpoint <= MAX_ENDPOINT_WARNINGS {
                        log::warn!(
                            "Unknown IP address: {} or {}",
                            segment.header.src_ip,
                            segment.header.dst_ip
                        );
                    } else {
                        log::debug!(
                            "Unknown IP address: {} or {}",
                            segment.header.src_ip,
                            segment.header.dst_ip
                        );
                    }
                }
                Err(Rejection::Unclassified) => stats.unclassified += 1,
            }
            Ok(())
        })?;

        stats.frames = frames;
        stats.flows = table.len();
        Ok((table, stats))
    }

    /// Extracts the capture and writes its flow table as JSON to `output`.
    pub fn extract_to_file(&self, capture: &Path, output: &Path, dns: &DnsMap) -> Result<ExtractionStats> {
        log::info!("Processing packets of {}", capture.display());
        let (table, stats) = self.extract(capture, dns)?;

        if stats.no_local_endpoint > MAX_ENDPOINT_WARNINGS {
            log::warn!(
                "{}: {} packets had no local endpoint",
                capture.display(),
                stats.no_local_endpoint
            );
        }
        if let (Some(first), Some(last)) = (stats.first_timestamp_us, stats.last_timestamp_us) {
            log::debug!(
                "{}: packets span {} .. {}",
                capture.display(),
                format_timestamp_micros(first),
                format_timestamp_micros(last)
            );
        }

        log::info!("Writing {} flows to {}", table.len(), output.display());
        let content = table.to_json()?;
        write_atomically(output, &content)?;
        Ok(stats)
    }
}
