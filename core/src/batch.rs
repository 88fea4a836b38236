use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use crate::config::{BatchConfig, Config};
use crate::network::dns::{DnsCorrelator, DnsMapStore, FileDnsMapStore};
use crate::network::flow::{ExtractionStats, FlowExtractor};
use crate::utils::{has_extension, output_path_for};
use crate::{FlowStatsError, Result};

/// A capture and the flow statistics file it will produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureJob {
    pub capture: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionSummary {
    pub capture: PathBuf,
    pub output: PathBuf,
    pub dns_entries: usize,
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub capture: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub pending: Vec<CaptureJob>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub processed: Vec<ExtractionSummary>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<FileFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// DNS pass followed by the flow pass for a single capture.
pub struct CapturePipeline {
    correlator: DnsCorrelator,
    extractor: FlowExtractor,
}

impl CapturePipeline {
    pub fn new(config: &Config, store: Arc<dyn DnsMapStore>) -> Result<Self> {
        let buffer_size = config.batch.read_buffer_size;
        Ok(Self {
            correlator: DnsCorrelator::new(store, config.extraction.dns_port, buffer_size),
            extractor: FlowExtractor::from_config(&config.extraction, buffer_size)?,
        })
    }

    /// Pipeline caching DNS maps on disk next to each capture.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(FileDnsMapStore::new(config.batch.dns_cache_file.clone()));
        Self::new(config, store)
    }

    pub fn process(&self, job: &CaptureJob) -> Result<ExtractionSummary> {
        log::info!("Processing file: {}", job.capture.display());

        let dns = self.correlator.correlate(&job.capture)?;
        let stats = self.extractor.extract_to_file(&job.capture, &job.output, &dns)?;

        log::info!(
            "Finished {}: {} flows, {} packets kept, {} dropped",
            job.capture.display(),
            stats.flows,
            stats.packets_kept,
            stats.dropped()
        );
        Ok(ExtractionSummary {
            capture: job.capture.clone(),
            output: job.output.clone(),
            dns_entries: dns.len(),
            stats,
        })
    }
}

pub struct BatchDriver {
    max_concurrent_files: usize,
    capture_extension: String,
    output_suffix: String,
}

impl BatchDriver {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            max_concurrent_files: config.max_concurrent_files.max(1),
            capture_extension: config.capture_extension.clone(),
            output_suffix: config.output_suffix.clone(),
        }
    }

    pub fn with_max_concurrent_files(mut self, max_concurrent_files: usize) -> Self {
        self.max_concurrent_files = max_concurrent_files.max(1);
        self
    }

    /// Walks `root` and splits captures into those still to process and those already done.
    pub fn discover(&self, root: &Path) -> Result<Discovery> {
        let mut captures = Vec::new();
        self.walk(root, &mut captures)?;

        let mut discovery = Discovery::default();
        for capture in captures {
            let output = output_path_for(&capture, &self.output_suffix)?;
            if output.exists() {
                log::info!("Output file {} already exists, skipping...", output.display());
                discovery.skipped.push(capture);
            } else {
                discovery.pending.push(CaptureJob { capture, output });
            }
        }
        Ok(discovery)
    }

    fn walk(&self, dir: &Path, captures: &mut Vec<PathBuf>) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)
            .and_then(|entries| entries.collect::<std::io::Result<Vec<_>>>())
            .map_err(|e| FlowStatsError::Batch(format!("error walking {}: {}", dir.display(), e)))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| FlowStatsError::Batch(format!("error walking {}: {}", path.display(), e)))?;
            if file_type.is_dir() {
                self.walk(&path, captures)?;
            } else if has_extension(&path, &self.capture_extension) {
                captures.push(path);
            }
        }
        Ok(())
    }

    pub async fn run(&self, root: &Path, pipeline: Arc<CapturePipeline>) -> Result<BatchReport> {
        self.run_with(root, move |job| pipeline.process(job)).await
    }

    /// Runs `processor` over every pending capture with bounded parallelism.
    ///
    /// Submission waits for a free slot once `max_concurrent_files` captures are
    /// in flight. A failing capture is recorded in the report and does not stop
    /// the others.
    pub async fn run_with<F>(&self, root: &Path, processor: F) -> Result<BatchReport>
    where
        F: Fn(&CaptureJob) -> Result<ExtractionSummary> + Send + Sync + 'static,
    {
        let discovery = self.discover(root)?;
        log::info!(
            "Found {} captures to process, {} already done",
            discovery.pending.len(),
            discovery.skipped.len()
        );

        let processor = Arc::new(processor);
        let slots = Arc::new(Semaphore::new(self.max_concurrent_files));
        let mut tasks: Vec<(PathBuf, JoinHandle<Result<ExtractionSummary>>)> = Vec::new();

        for job in discovery.pending {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| FlowStatsError::Batch(e.to_string()))?;
            let processor = processor.clone();
            let capture = job.capture.clone();

            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit; // Hold permit until the capture is done
                processor(&job)
            });
            tasks.push((capture, task));
        }

        let mut report = BatchReport {
            skipped: discovery.skipped,
            ..BatchReport::default()
        };
        for (capture, task) in tasks {
            let outcome = task
                .await
                .map_err(|e| FlowStatsError::Batch(format!("worker aborted: {}", e)))
                .and_then(|result| result);
            match outcome {
                Ok(summary) => report.processed.push(summary),
                Err(e) => {
                    log::error!("Failed to process {}: {}", capture.display(), e);
                    report.failed.push(FileFailure {
                        capture,
                        error: e.to_string(),
                    });
                }
            }
        }

        log::info!(
            "Batch complete: {} processed, {} skipped, {} failed",
            report.processed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        dns_response_frame, ethernet_ipv4_tcp, ethernet_ipv4_udp, PcapngWriter, LOCAL, REMOTE,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn write_session(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut writer = PcapngWriter::new();
        writer
            .push(1_000, &dns_response_frame(&[("cloud.example.com", REMOTE)]))
            .push(2_000, &ethernet_ipv4_tcp(LOCAL, 50123, REMOTE, 443, b"hi"))
            .push(3_000, &ethernet_ipv4_udp(REMOTE, 12000, LOCAL, 49005, &[0u8; 64]));
        writer.write_to(path).unwrap();
    }

    fn dummy_summary(job: &CaptureJob) -> ExtractionSummary {
        ExtractionSummary {
            capture: job.capture.clone(),
            output: job.output.clone(),
            dns_entries: 0,
            stats: ExtractionStats::default(),
        }
    }

    #[test]
    fn test_discovery_skips_existing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("gfn/run1")).unwrap();
        std::fs::create_dir_all(root.join("xcloud")).unwrap();
        std::fs::write(root.join("gfn/run1/a.pcapng"), b"").unwrap();
        std::fs::write(root.join("gfn/run1/a_packetStats.json"), b"{}").unwrap();
        std::fs::write(root.join("xcloud/b.pcapng"), b"").unwrap();
        std::fs::write(root.join("xcloud/notes.txt"), b"").unwrap();
        std::fs::write(root.join("xcloud/c.pcap"), b"").unwrap();

        let driver = BatchDriver::new(&BatchConfig::default());
        let discovery = driver.discover(root).unwrap();

        assert_eq!(discovery.skipped, vec![root.join("gfn/run1/a.pcapng")]);
        assert_eq!(
            discovery.pending,
            vec![CaptureJob {
                capture: root.join("xcloud/b.pcapng"),
                output: root.join("xcloud/b_packetStats.json"),
            }]
        );
    }

    #[test]
    fn test_walk_error_aborts() {
        let driver = BatchDriver::new(&BatchConfig::default());
        let result = driver.discover(Path::new("/nonexistent/dataset/root"));
        assert!(matches!(result, Err(FlowStatsError::Batch(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bound() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..40 {
            let sub = dir.path().join(format!("session{:02}", i % 5));
            std::fs::create_dir_all(&sub).unwrap();
            std::fs::write(sub.join(format!("capture{:02}.pcapng", i)), b"").unwrap();
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (active_c, peak_c, started_c) = (active.clone(), peak.clone(), started.clone());

        let driver = BatchDriver::new(&BatchConfig::default());
        let report = driver
            .run_with(dir.path(), move |job| {
                let now = active_c.fetch_add(1, Ordering::SeqCst) + 1;
                peak_c.fetch_max(now, Ordering::SeqCst);
                started_c.fetch_add(1, Ordering::SeqCst);
                // Hold the first wave until a full complement of workers is running.
                let deadline = Instant::now() + Duration::from_secs(10);
                while started_c.load(Ordering::SeqCst) < 24 && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(2));
                }
                std::thread::sleep(Duration::from_millis(5));
                active_c.fetch_sub(1, Ordering::SeqCst);
                Ok(dummy_summary(job))
            })
            .await
            .unwrap();

        assert_eq!(report.processed.len(), 40);
        assert_eq!(peak.load(Ordering::SeqCst), 24);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_configurable_bound() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            std::fs::write(dir.path().join(format!("c{}.pcapng", i)), b"").unwrap();
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (active_c, peak_c) = (active.clone(), peak.clone());

        let driver = BatchDriver::new(&BatchConfig::default()).with_max_concurrent_files(3);
        driver
            .run_with(dir.path(), move |job| {
                let now = active_c.fetch_add(1, Ordering::SeqCst) + 1;
                peak_c.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                active_c.fetch_sub(1, Ordering::SeqCst);
                Ok(dummy_summary(job))
            })
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_idempotent_rerun() {
        let dir = tempfile::tempdir().unwrap();
        write_session(&dir.path().join("gfn/a/session.pcapng"));
        write_session(&dir.path().join("gfn/b/session.pcapng"));

        let config = Config::default();
        let pipeline = Arc::new(CapturePipeline::from_config(&config).unwrap());
        let driver = BatchDriver::new(&config.batch);

        let first = driver.run(dir.path(), pipeline.clone()).await.unwrap();
        assert_eq!(first.processed.len(), 2);
        assert!(first.is_success());
        assert!(dir.path().join("gfn/a/dns_map.json").exists());

        let output = dir.path().join("gfn/a/session_packetStats.json");
        let before = std::fs::read(&output).unwrap();

        let second = driver.run(dir.path(), pipeline).await.unwrap();
        assert!(second.processed.is_empty());
        assert_eq!(second.skipped.len(), 2);
        assert_eq!(std::fs::read(&output).unwrap(), before);

        let json: serde_json::Value = serde_json::from_slice(&before).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_capture_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        write_session(&dir.path().join("good/session.pcapng"));
        std::fs::create_dir_all(dir.path().join("bad")).unwrap();
        std::fs::write(dir.path().join("bad/session.pcapng"), b"definitely not pcapng").unwrap();

        let config = Config::default();
        let pipeline = Arc::new(CapturePipeline::from_config(&config).unwrap());
        let report = BatchDriver::new(&config.batch)
            .run(dir.path(), pipeline)
            .await
            .unwrap();

        assert_eq!(report.processed.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].capture, dir.path().join("bad/session.pcapng"));
        assert!(!report.is_success());
        assert!(dir.path().join("good/session_packetStats.json").exists());
        assert!(!dir.path().join("bad/session_packetStats.json").exists());
    }

    #[tokio::test]
    async fn test_pipeline_with_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("session.pcapng");
        write_session(&capture);

        let mut config = Config::default();
        config.extraction.max_packets_per_flow = 1;
        let store = Arc::new(crate::network::dns::MemoryDnsMapStore::new());
        let pipeline = CapturePipeline::new(&config, store.clone()).unwrap();

        let job = CaptureJob {
            capture: capture.clone(),
            output: dir.path().join("session_packetStats.json"),
        };
        let summary = pipeline.process(&job).unwrap();

        assert_eq!(summary.dns_entries, 1);
        assert_eq!(summary.stats.flows, 2);
        assert_eq!(store.len(), 1);
        assert!(!dir.path().join("dns_map.json").exists());
    }
}
