pub mod capture_file;
pub mod dns;
pub mod flow;
pub mod subnet;

pub use capture_file::{decode_frame, read_frames, DecodeSkip, Frame, Segment, TransportHeader};
pub use dns::{DnsCorrelator, DnsMap, DnsMapStore, FileDnsMapStore, MemoryDnsMapStore};
pub use flow::{ExtractionStats, Flow, FlowExtractor, FlowTable, FlowUpdate, Packet};
pub use subnet::{Ipv4Cidr, SubnetClassifier};
