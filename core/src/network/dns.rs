use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use trust_dns_proto::op::{Message, MessageType};
use trust_dns_proto::rr::{RData, RecordType};
use crate::network::capture_file::{decode_frame, read_frames};
use crate::utils::write_atomically;
use crate::{FlowStatsError, Result};

/// Address to domain name mapping learned from the A answers of one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DnsMap {
    entries: BTreeMap<String, String>,
}

impl DnsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `addr -> name`, replacing any earlier name for the address.
    pub fn insert(&mut self, addr: IpAddr, name: impl Into<String>) {
        self.entries.insert(addr.to_string(), name.into());
    }

    pub fn lookup(&self, addr: &IpAddr) -> Option<&str> {
        self.entries.get(&addr.to_string()).map(String::as_str)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.entries.contains_key(&addr.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(addr, name)| (addr.as_str(), name.as_str()))
    }
}

/// Where DNS maps are cached between runs.
///
/// A map returned by `load` is treated as authoritative for the capture and
/// the capture is not rescanned.
pub trait DnsMapStore: Send + Sync {
    fn load(&self, capture: &Path) -> Result<Option<DnsMap>>;
    fn save(&self, capture: &Path, map: &DnsMap) -> Result<()>;
}

/// Keeps one JSON cache file in the directory of each capture.
#[derive(Debug, Clone)]
pub struct FileDnsMapStore {
    file_name: String,
}

impl FileDnsMapStore {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn cache_path(&self, capture: &Path) -> PathBuf {
        capture
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.file_name)
    }
}

impl Default for FileDnsMapStore {
    fn default() -> Self {
        Self::new("dns_map.json")
    }
}

impl DnsMapStore for FileDnsMapStore {
    fn load(&self, capture: &Path) -> Result<Option<DnsMap>> {
        let path = self.cache_path(capture);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(&path)?;
        let map = serde_json::from_slice(&content).map_err(|e| {
            FlowStatsError::DnsCache(format!("{} is unreadable: {}", path.display(), e))
        })?;
        Ok(Some(map))
    }

    fn save(&self, capture: &Path, map: &DnsMap) -> Result<()> {
        let content = serde_json::to_vec(map)?;
        write_atomically(&self.cache_path(capture), &content)
    }
}

/// In-memory store keyed by capture directory, mirroring the file layout.
#[derive(Debug, Default)]
pub struct MemoryDnsMapStore {
    maps: Mutex<HashMap<PathBuf, DnsMap>>,
}

impl MemoryDnsMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(capture: &Path) -> PathBuf {
        capture.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    pub fn insert(&self, capture: &Path, map: DnsMap) {
        if let Ok(mut maps) = self.maps.lock() {
            maps.insert(Self::key(capture), map);
        }
    }

    pub fn len(&self) -> usize {
        self.maps.lock().map(|maps| maps.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DnsMapStore for MemoryDnsMapStore {
    fn load(&self, capture: &Path) -> Result<Option<DnsMap>> {
        let maps = self
            .maps
            .lock()
            .map_err(|_| FlowStatsError::DnsCache("store lock poisoned".to_string()))?;
        Ok(maps.get(&Self::key(capture)).cloned())
    }

    fn save(&self, capture: &Path, map: &DnsMap) -> Result<()> {
        let mut maps = self
            .maps
            .lock()
            .map_err(|_| FlowStatsError::DnsCache("store lock poisoned".to_string()))?;
        maps.insert(Self::key(capture), map.clone());
        Ok(())
    }
}

pub struct DnsCorrelator {
    store: Arc<dyn DnsMapStore>,
    dns_port: u16,
    buffer_size: usize,
}

impl DnsCorrelator {
    pub fn new(store: Arc<dyn DnsMapStore>, dns_port: u16, buffer_size: usize) -> Self {
        Self {
            store,
            dns_port,
            buffer_size,
        }
    }

    /// Returns the cached map for the capture, scanning and caching it on a miss.
    pub fn correlate(&self, capture: &Path) -> Result<DnsMap> {
        log::info!("Mapping DNS names for {}", capture.display());

        if let Some(map) = self.store.load(capture)? {
            log::info!("DNS map already exists, reusing {} entries", map.len());
            return Ok(map);
        }

        let map = self.scan(capture)?;
        log::info!("Writing DNS map with {} entries", map.len());
        self.store.save(capture, &map)?;
        Ok(map)
    }

    /// Single pass over the capture collecting A answers from DNS responses.
    pub fn scan(&self, capture: &Path) -> Result<DnsMap> {
        let mut map = DnsMap::new();
        let mut malformed = 0u64;

        read_frames(capture, self.buffer_size, |frame| {
            let segment = match decode_frame(frame.linktype, frame.data) {
                Ok(segment) => segment,
                Err(_) => return Ok(()),
            };
            if segment.header.protocol != 17 || segment.header.src_port != self.dns_port {
                return Ok(());
            }
            match Message::from_vec(segment.payload) {
                Ok(message) => record_answers(&message, &mut map),
                Err(e) => {
                    malformed += 1;
                    log::debug!("Skipping malformed DNS payload: {}", e);
                }
            }
            Ok(())
        })?;

        if malformed > 0 {
            log::warn!(
                "{}: skipped {} malformed DNS responses",
                capture.display(),
                malformed
            );
        }
        Ok(map)
    }
}

fn record_answers(message: &Message, map: &mut DnsMap) {
    if message.message_type() != MessageType::Response {
        return;
    }
    for answer in message.answers() {
        if answer.record_type() != RecordType::A {
            continue;
        }
        if let Some(RData::A(addr)) = answer.data() {
            let name = answer.name().to_ascii();
            map.insert(IpAddr::V4(addr.0), name.trim_end_matches('.'));
        }
    }
}
