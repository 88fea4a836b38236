use pcap_parser::{create_reader, Block, Linktype, PcapBlockOwned, PcapError};
use pnet_packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::vlan::VlanPacket;
use std::fmt;
use std::fs::File;
use std::net::IpAddr;
use std::path::Path;
use crate::{FlowStatsError, Result};

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_HEADER_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
/// Ceiling for the read buffer when a block does not fit in it.
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;
/// Unknown-interface warnings emitted per file before dropping to debug level.
const MAX_INTERFACE_WARNINGS: u64 = 10;

/// One captured frame with its timestamp normalised to microseconds.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub timestamp_us: i64,
    pub linktype: Linktype,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
struct LinkInfo {
    linktype: Linktype,
    ticks_per_second: u64,
    offset_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// Transport header plus the bytes it carries, borrowed from the frame.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub header: TransportHeader,
    pub payload: &'a [u8],
}

/// Why a frame did not yield a TCP or UDP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeSkip {
    UnsupportedLinktype(i32),
    Truncated,
    NotIp,
    Fragment,
    NotTransport(u8),
}

impl fmt::Display for DecodeSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeSkip::UnsupportedLinktype(lt) => write!(f, "unsupported link type {}", lt),
            DecodeSkip::Truncated => write!(f, "truncated header"),
            DecodeSkip::NotIp => write!(f, "not an IP packet"),
            DecodeSkip::Fragment => write!(f, "IP fragment"),
            DecodeSkip::NotTransport(proto) => write!(f, "unsupported transport protocol {}", proto),
        }
    }
}

/// Streams every packet of a pcap or pcapng file through `visit` in capture order.
///
/// Returns the number of frames visited. The read buffer starts at
/// `buffer_size` and doubles for blocks that do not fit. A truncated final
/// block ends the stream; any other container error is fatal for the file.
pub fn read_frames<P, F>(path: P, buffer_size: usize, mut visit: F) -> Result<u64>
where
    P: AsRef<Path>,
    F: FnMut(&Frame<'_>) -> Result<()>,
{
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = create_reader(buffer_size, file).map_err(|e| {
        FlowStatsError::Capture(format!("{}: unrecognised capture format ({:?})", path.display(), e))
    })?;

    let mut interfaces: Vec<LinkInfo> = Vec::new();
    let mut legacy: Option<LinkInfo> = None;
    let mut frames = 0u64;
    let mut unknown_interface = 0u64;
    let mut capacity = buffer_size;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let frame = match block {
                    PcapBlockOwned::LegacyHeader(ref hdr) => {
                        let ticks_per_second = if hdr.is_nanosecond_precision() {
                            1_000_000_000
                        } else {
                            1_000_000
                        };
                        legacy = Some(LinkInfo {
                            linktype: hdr.network,
                            ticks_per_second,
                            offset_us: 0,
                        });
                        None
                    }
                    PcapBlockOwned::Legacy(ref pkt) => legacy.map(|link| {
                        let fraction = pkt.ts_usec as u64 * 1_000_000 / link.ticks_per_second;
                        Frame {
                            timestamp_us: pkt.ts_sec as i64 * 1_000_000 + fraction as i64,
                            linktype: link.linktype,
                            data: captured(pkt.data, pkt.caplen),
                        }
                    }),
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(ref idb)) => {
                        interfaces.push(LinkInfo {
                            linktype: idb.linktype,
                            ticks_per_second: ticks_per_second(idb.if_tsresol),
                            offset_us: idb.if_tsoffset.saturating_mul(1_000_000),
                        });
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(ref epb)) => {
                        match interfaces.get(epb.if_id as usize) {
                            Some(link) => {
                                let ticks = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                                Some(Frame {
                                    timestamp_us: ticks_to_micros(ticks, link.ticks_per_second)
                                        .saturating_add(link.offset_us),
                                    linktype: link.linktype,
                                    data: captured(epb.data, epb.caplen),
                                })
                            }
                            None => {
                                unknown_interface += 1;
                                if unknown_interface <= MAX_INTERFACE_WARNINGS {
                                    log::warn!(
                                        "{}: packet references unknown interface {}",
                                        path.display(),
                                        epb.if_id
                                    );
                                } else {
                                    log::debug!(
                                        "{}: packet references unknown interface {}",
                                        path.display(),
                                        epb.if_id
                                    );
                                }
                                None
                            }
                        }
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(ref spb)) => {
                        // Simple packet blocks carry no timestamp and always belong to interface 0.
                        interfaces.first().map(|link| Frame {
                            timestamp_us: 0,
                            linktype: link.linktype,
                            data: captured(spb.data, spb.origlen),
                        })
                    }
                    _ => None,
                };

                if let Some(frame) = frame {
                    frames += 1;
                    visit(&frame)?;
                }
                drop(block);
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::UnexpectedEof) => {
                log::warn!("{}: capture ends with a truncated block", path.display());
                break;
            }
            Err(PcapError::Incomplete(_)) => {
                reader.refill().map_err(|e| {
                    FlowStatsError::Capture(format!("{}: refill failed ({:?})", path.display(), e))
                })?;
            }
            Err(PcapError::BufferTooSmall) => {
                if capacity >= MAX_BUFFER_SIZE {
                    return Err(FlowStatsError::Capture(format!(
                        "{}: block larger than {} bytes",
                        path.display(),
                        MAX_BUFFER_SIZE
                    )));
                }
                capacity = capacity.saturating_mul(2).min(MAX_BUFFER_SIZE);
                log::debug!("{}: growing read buffer to {} bytes", path.display(), capacity);
                reader.grow(capacity);
                reader.refill().map_err(|e| {
                    FlowStatsError::Capture(format!("{}: refill failed ({:?})", path.display(), e))
                })?;
            }
            Err(e) => {
                return Err(FlowStatsError::Capture(format!(
                    "{}: corrupt capture ({:?})",
                    path.display(),
                    e
                )))
            }
        }
    }

    Ok(frames)
}

fn captured(data: &[u8], caplen: u32) -> &[u8] {
    &data[..data.len().min(caplen as usize)]
}

fn ticks_per_second(if_tsresol: u8) -> u64 {
    let exponent = (if_tsresol & 0x7f) as u32;
    let base: u64 = if if_tsresol & 0x80 == 0 { 10 } else { 2 };
    match base.checked_pow(exponent) {
        Some(0) | None => 1_000_000,
        Some(ticks) => ticks,
    }
}

fn ticks_to_micros(ticks: u64, ticks_per_second: u64) -> i64 {
    (ticks as u128 * 1_000_000 / ticks_per_second as u128) as i64
}

/// Strips link, network and transport headers off a frame.
pub fn decode_frame(linktype: Linktype, data: &[u8]) -> std::result::Result<Segment<'_>, DecodeSkip> {
    let (network, ethertype) = if linktype == Linktype::ETHERNET {
        strip_ethernet(data)?
    } else if linktype == Linktype::LINUX_SLL {
        if data.len() < SLL_HEADER_LEN {
            return Err(DecodeSkip::Truncated);
        }
        let ethertype = EtherType(u16::from_be_bytes([data[14], data[15]]));
        (&data[SLL_HEADER_LEN..], Some(ethertype))
    } else if linktype == Linktype::NULL {
        if data.len() < NULL_HEADER_LEN {
            return Err(DecodeSkip::Truncated);
        }
        (&data[NULL_HEADER_LEN..], None)
    } else if linktype == Linktype::RAW || linktype == Linktype::IPV4 || linktype == Linktype::IPV6 {
        (data, None)
    } else {
        return Err(DecodeSkip::UnsupportedLinktype(linktype.0));
    };

    let version = match ethertype {
        Some(EtherTypes::Ipv4) => 4,
        Some(EtherTypes::Ipv6) => 6,
        Some(_) => return Err(DecodeSkip::NotIp),
        None => network.first().map(|b| b >> 4).ok_or(DecodeSkip::Truncated)?,
    };

    match version {
        4 => decode_ipv4(network),
        6 => decode_ipv6(network),
        _ => Err(DecodeSkip::NotIp),
    }
}

fn strip_ethernet(data: &[u8]) -> std::result::Result<(&[u8], Option<EtherType>), DecodeSkip> {
    let ethernet = EthernetPacket::new(data).ok_or(DecodeSkip::Truncated)?;
    let ethertype = ethernet.get_ethertype();
    if ethertype != EtherTypes::Vlan {
        return Ok((&data[ETHERNET_HEADER_LEN..], Some(ethertype)));
    }

    let tagged = &data[ETHERNET_HEADER_LEN..];
    let vlan = VlanPacket::new(tagged).ok_or(DecodeSkip::Truncated)?;
    Ok((&tagged[VLAN_HEADER_LEN..], Some(vlan.get_ethertype())))
}

fn decode_ipv4(data: &[u8]) -> std::result::Result<Segment<'_>, DecodeSkip> {
    let ipv4 = Ipv4Packet::new(data).ok_or(DecodeSkip::Truncated)?;
    if ipv4.get_version() != 4 {
        return Err(DecodeSkip::NotIp);
    }
    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < 20 || header_len > data.len() {
        return Err(DecodeSkip::Truncated);
    }
    if ipv4.get_fragment_offset() != 0 || ipv4.get_flags() & Ipv4Flags::MoreFragments != 0 {
        return Err(DecodeSkip::Fragment);
    }

    // A zero total length shows up on segmentation-offloaded captures; trust the frame then.
    let total_len = ipv4.get_total_length() as usize;
    let end = if total_len >= header_len {
        total_len.min(data.len())
    } else {
        data.len()
    };

    decode_transport(
        IpAddr::V4(ipv4.get_source()),
        IpAddr::V4(ipv4.get_destination()),
        ipv4.get_next_level_protocol().0,
        &data[header_len..end],
    )
}

fn decode_ipv6(data: &[u8]) -> std::result::Result<Segment<'_>, DecodeSkip> {
    let ipv6 = Ipv6Packet::new(data).ok_or(DecodeSkip::Truncated)?;
    if ipv6.get_version() != 6 {
        return Err(DecodeSkip::NotIp);
    }
    let end = (IPV6_HEADER_LEN + ipv6.get_payload_length() as usize).min(data.len());

    decode_transport(
        IpAddr::V6(ipv6.get_source()),
        IpAddr::V6(ipv6.get_destination()),
        ipv6.get_next_header().0,
        &data[IPV6_HEADER_LEN..end],
    )
}

fn decode_transport(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    protocol: u8,
    data: &[u8],
) -> std::result::Result<Segment<'_>, DecodeSkip> {
    let (src_port, dst_port, payload) = if protocol == IpNextHeaderProtocols::Tcp.0 {
        let tcp = TcpPacket::new(data).ok_or(DecodeSkip::Truncated)?;
        let data_offset = tcp.get_data_offset() as usize * 4;
        if data_offset < 20 || data_offset > data.len() {
            return Err(DecodeSkip::Truncated);
        }
        (tcp.get_source(), tcp.get_destination(), &data[data_offset..])
    } else if protocol == IpNextHeaderProtocols::Udp.0 {
        let udp = UdpPacket::new(data).ok_or(DecodeSkip::Truncated)?;
        let length = udp.get_length() as usize;
        let end = if length >= UDP_HEADER_LEN {
            length.min(data.len())
        } else {
            data.len()
        };
        (udp.get_source(), udp.get_destination(), &data[UDP_HEADER_LEN..end])
    } else {
        return Err(DecodeSkip::NotTransport(protocol));
    };

    Ok(Segment {
        header: TransportHeader {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        },
        payload,
    })
}
