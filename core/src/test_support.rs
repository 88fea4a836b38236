//! Synthetic captures for unit tests.

use std::net::Ipv4Addr;
use std::path::Path;
use trust_dns_proto::op::{Message, MessageType, OpCode};
use trust_dns_proto::rr::rdata::A;
use trust_dns_proto::rr::{Name, RData, Record};

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const REMOTE: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
pub const RESOLVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Little-endian pcapng writer with a single Ethernet interface.
pub struct PcapngWriter {
    bytes: Vec<u8>,
}

impl PcapngWriter {
    pub fn new() -> Self {
        let mut writer = Self { bytes: Vec::new() };
        writer.section_header();
        writer.block(1, &[1, 0, 0, 0, 0, 0, 0, 0]);
        writer
    }

    pub fn with_tsresol(tsresol: u8) -> Self {
        let mut writer = Self { bytes: Vec::new() };
        writer.section_header();
        let mut body = vec![1, 0, 0, 0, 0, 0, 0, 0];
        body.extend_from_slice(&[9, 0, 1, 0, tsresol, 0, 0, 0]);
        body.extend_from_slice(&[0, 0, 0, 0]);
        writer.block(1, &body);
        writer
    }

    /// Microsecond interface whose timestamps are shifted by `seconds`.
    pub fn with_tsoffset(seconds: i64) -> Self {
        let mut writer = Self { bytes: Vec::new() };
        writer.section_header();
        let mut body = vec![1, 0, 0, 0, 0, 0, 0, 0];
        body.extend_from_slice(&[14, 0, 8, 0]);
        body.extend_from_slice(&seconds.to_le_bytes());
        body.extend_from_slice(&[0, 0, 0, 0]);
        writer.block(1, &body);
        writer
    }

    /// Appends an enhanced packet block; `ticks` is in the interface's resolution.
    pub fn push(&mut self, ticks: u64, frame: &[u8]) -> &mut Self {
        self.push_on_interface(0, ticks, frame)
    }

    pub fn push_on_interface(&mut self, if_id: u32, ticks: u64, frame: &[u8]) -> &mut Self {
        let mut body = Vec::new();
        body.extend_from_slice(&if_id.to_le_bytes());
        body.extend_from_slice(&((ticks >> 32) as u32).to_le_bytes());
        body.extend_from_slice(&(ticks as u32).to_le_bytes());
        body.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        body.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        body.extend_from_slice(frame);
        while body.len() % 4 != 0 {
            body.push(0);
        }
        self.block(6, &body);
        self
    }

    fn section_header(&mut self) {
        let mut body = Vec::new();
        body.extend_from_slice(&0x1A2B_3C4Du32.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(-1i64).to_le_bytes());
        self.block(0x0A0D_0D0A, &body);
    }

    fn block(&mut self, block_type: u32, body: &[u8]) {
        let total = (12 + body.len()) as u32;
        self.bytes.extend_from_slice(&block_type.to_le_bytes());
        self.bytes.extend_from_slice(&total.to_le_bytes());
        self.bytes.extend_from_slice(body);
        self.bytes.extend_from_slice(&total.to_le_bytes());
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)
    }
}

/// Microsecond legacy pcap file with an Ethernet link type.
pub fn legacy_pcap(frames: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0xA1B2_C3D4u32.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&4u16.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&65535u32.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    for (ts_sec, ts_usec, frame) in frames {
        bytes.extend_from_slice(&ts_sec.to_le_bytes());
        bytes.extend_from_slice(&ts_usec.to_le_bytes());
        bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        bytes.extend_from_slice(frame);
    }
    bytes
}

fn ethernet_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, transport: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(34 + transport.len());
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame.extend_from_slice(&[0x08, 0x00]);

    let total_len = (20 + transport.len()) as u16;
    frame.extend_from_slice(&[0x45, 0x00]);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 64, protocol, 0x00, 0x00]);
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(transport);
    frame
}

pub fn ethernet_ipv4_udp(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8 + payload.len());
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    ethernet_ipv4(src, dst, 17, &udp)
}

pub fn ethernet_ipv4_tcp(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20 + payload.len());
    tcp.extend_from_slice(&sport.to_be_bytes());
    tcp.extend_from_slice(&dport.to_be_bytes());
    tcp.extend_from_slice(&1u32.to_be_bytes());
    tcp.extend_from_slice(&0u32.to_be_bytes());
    tcp.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    tcp.extend_from_slice(payload);
    ethernet_ipv4(src, dst, 6, &tcp)
}

/// Wire-format DNS response carrying one A answer per `(name, address)` pair.
pub fn dns_response(answers: &[(&str, Ipv4Addr)]) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(7)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query);
    for (name, addr) in answers {
        let name = Name::from_ascii(name).unwrap();
        message.add_answer(Record::from_rdata(name, 300, RData::A(A(*addr))));
    }
    message.to_vec().unwrap()
}

/// DNS response frame from the resolver to the local host.
pub fn dns_response_frame(answers: &[(&str, Ipv4Addr)]) -> Vec<u8> {
    ethernet_ipv4_udp(RESOLVER, 53, LOCAL, 53124, &dns_response(answers))
}
