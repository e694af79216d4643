//! Deterministic Simulation Testing for the Sink
//!
//! Shadow-state harness driving sink files against the in-memory store
//! emulator with seeded fault injection:
//! - Random workload of open / append / sync / publish / discard
//! - Shadow copy of what each file should contain
//! - Invariant checks after every operation and at the end of a run
//! - Seed-based reproducibility
//!
//! ```text
//! for seed in 0..1000 {
//!     let mut harness = SinkDSTHarness::new(SinkDSTConfig::chaos(seed));
//!     harness.run(500).await;
//!     harness.check_invariants().await;   // violations carry the seed
//! }
//! ```
//!
//! Checked invariants:
//! - a published object decodes to exactly the appended records, in order
//! - nothing appears under the publish directory except successful publishes
//! - after a clean discard no object with the file's name remains
//! - a full buffer rejects appends without changing

use crate::sink::config::{RetryConfig, SinkConfig};
use crate::sink::credentials::StaticCredentials;
use crate::sink::encoder::RecordReader;
use crate::sink::error::SinkError;
use crate::sink::factory::{FileManager, SinkFactory};
use crate::sink::file::{FileState, SinkFile};
use crate::sink::memory::{FaultConfig, GcsStats, InMemoryGcs};
use crate::sink::path::FilePaths;
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

const DST_BUCKET: &str = "dst-bucket";
const DST_ENDPOINT: &str = "http://gcs.dst";

/// Configuration for sink DST
#[derive(Debug, Clone)]
pub struct SinkDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Store fault probabilities
    pub faults: FaultConfig,
    /// Records buffered between syncs
    pub capacity: usize,
    /// Attempts per remote call
    pub max_attempts: u32,
    pub sync_probability: f64,
    pub publish_probability: f64,
    pub discard_probability: f64,
    /// Upper bound for generated record payloads
    pub max_record_len: usize,
}

impl Default for SinkDSTConfig {
    fn default() -> Self {
        SinkDSTConfig {
            seed: 0,
            faults: FaultConfig::moderate(),
            capacity: 8,
            max_attempts: 3,
            sync_probability: 0.15,
            publish_probability: 0.04,
            discard_probability: 0.01,
            max_record_len: 64,
        }
    }
}

impl SinkDSTConfig {
    pub fn new(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults
    pub fn calm(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            faults: FaultConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Transient faults, absorbed by retries most of the time
    pub fn moderate(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            faults: FaultConfig::moderate(),
            ..Default::default()
        }
    }

    /// Frequent faults including fatal ones; files fail and get discarded
    pub fn chaos(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            faults: FaultConfig::chaos(),
            capacity: 4,
            discard_probability: 0.03,
            ..Default::default()
        }
    }
}

/// Workload operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOperation {
    Open { name: String },
    Append { record: Bytes },
    Sync,
    Publish,
    Discard,
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct SinkDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    /// Failed operations (expected under faults)
    pub failed_operations: u64,
    pub files_opened: u64,
    pub syncs: u64,
    pub publishes: u64,
    pub discards: u64,
    /// Appends rejected by a full buffer
    pub capacity_rejections: u64,
    /// Emulator counters at the end of the run
    pub store_stats: GcsStats,
    pub invariant_violations: Vec<String>,
}

impl SinkDSTResult {
    pub fn new(seed: u64) -> Self {
        SinkDSTResult {
            seed,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            files_opened: 0,
            syncs: 0,
            publishes: 0,
            discards: 0,
            capacity_rejections: 0,
            store_stats: GcsStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} ok, {} failed), {} files, {} syncs, {} published, {} discarded, {} violations",
            self.seed,
            self.total_operations,
            self.successful_operations,
            self.failed_operations,
            self.files_opened,
            self.syncs,
            self.publishes,
            self.discards,
            self.invariant_violations.len()
        )
    }
}

/// A file under test plus what it should contain
struct ShadowFile {
    file: SinkFile,
    /// Records the store holds in the inflight object
    synced: Vec<Bytes>,
    /// Records appended since the last successful sync
    buffered: Vec<Bytes>,
}

/// Main DST harness for sink files
pub struct SinkDSTHarness {
    config: SinkDSTConfig,
    gcs: Arc<InMemoryGcs>,
    manager: FileManager,
    rng: ChaCha8Rng,
    current: Option<ShadowFile>,
    next_file: u64,
    /// Successfully published files and their expected records
    published: BTreeMap<String, Vec<Bytes>>,
    /// Files whose transient objects may legitimately remain
    leaked: BTreeMap<String, usize>,
    result: SinkDSTResult,
}

impl SinkDSTHarness {
    pub fn new(config: SinkDSTConfig) -> Self {
        let gcs = Arc::new(InMemoryGcs::with_faults(
            DST_BUCKET,
            config.faults,
            config.seed.wrapping_add(1),
        ));

        let sink_config = SinkConfig {
            bucket: DST_BUCKET.to_string(),
            sync_file_after_records: config.capacity,
            retry: RetryConfig {
                max_attempts: config.max_attempts,
                ..RetryConfig::test()
            },
            ..SinkConfig::test(DST_ENDPOINT)
        };
        let factory = SinkFactory::new(
            sink_config,
            gcs.clone(),
            Arc::new(StaticCredentials::bearer("dst-token")),
        )
        .expect("DST configuration is valid");

        SinkDSTHarness {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            result: SinkDSTResult::new(config.seed),
            manager: factory.create(),
            config,
            gcs,
            current: None,
            next_file: 0,
            published: BTreeMap::new(),
            leaked: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<InMemoryGcs> {
        &self.gcs
    }

    /// Generate the next operation
    fn next_operation(&mut self) -> SinkOperation {
        if self.current.is_none() {
            self.next_file += 1;
            return SinkOperation::Open {
                name: format!("file-{:05}.rec", self.next_file),
            };
        }

        let roll: f64 = self.rng.gen();
        let publish = self.config.publish_probability;
        let discard = publish + self.config.discard_probability;
        let sync = discard + self.config.sync_probability;
        if roll < publish {
            SinkOperation::Publish
        } else if roll < discard {
            SinkOperation::Discard
        } else if roll < sync {
            SinkOperation::Sync
        } else {
            let len = self.rng.gen_range(0..=self.config.max_record_len);
            let mut record = vec![0u8; len];
            self.rng.fill(record.as_mut_slice());
            SinkOperation::Append {
                record: Bytes::from(record),
            }
        }
    }

    /// Run the workload for a number of operations
    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.next_operation();
            let ok = self.execute(op).await;
            self.result.total_operations += 1;
            if ok {
                self.result.successful_operations += 1;
            } else {
                self.result.failed_operations += 1;
            }
        }
    }

    async fn execute(&mut self, op: SinkOperation) -> bool {
        match op {
            SinkOperation::Open { name } => self.execute_open(name).await,
            SinkOperation::Append { record } => self.execute_append(record),
            SinkOperation::Sync => self.execute_sync().await,
            SinkOperation::Publish => self.execute_publish().await,
            SinkOperation::Discard => self.execute_discard().await,
        }
    }

    async fn execute_open(&mut self, name: String) -> bool {
        match self.manager.create_file(&name).await {
            Ok(file) => {
                self.result.files_opened += 1;
                self.current = Some(ShadowFile {
                    file,
                    synced: Vec::new(),
                    buffered: Vec::new(),
                });
                true
            }
            Err(_) => {
                // Cleanup after a failed open is best-effort.
                self.leaked.insert(name, 1);
                false
            }
        }
    }

    fn execute_append(&mut self, record: Bytes) -> bool {
        let capacity = self.config.capacity;
        let Some(shadow) = self.current.as_mut() else {
            return false;
        };
        let was_full = shadow.buffered.len() >= capacity;
        let mut violations = Vec::new();
        let ok = match shadow.file.append(record.clone()) {
            Ok(()) => {
                if was_full {
                    violations.push("append accepted into a full buffer".to_string());
                }
                shadow.buffered.push(record);
                true
            }
            Err(SinkError::CapacityExceeded { .. }) => {
                if !was_full {
                    violations.push("append rejected below capacity".to_string());
                }
                if shadow.file.buffered() != shadow.buffered.len() {
                    violations.push("rejected append changed the buffer".to_string());
                }
                self.result.capacity_rejections += 1;
                false
            }
            Err(e) => {
                violations.push(format!("unexpected append error: {}", e));
                false
            }
        };

        for message in violations {
            self.violation(message);
        }
        ok
    }

    async fn execute_sync(&mut self) -> bool {
        let Some(mut shadow) = self.current.take() else {
            return false;
        };
        match shadow.file.sync().await {
            Ok(()) => {
                self.result.syncs += 1;
                shadow.synced.append(&mut shadow.buffered);
                let inflight = shadow.file.paths().inflight.clone();
                self.expect_object(inflight.as_str(), &shadow.synced);
                self.current = Some(shadow);
                true
            }
            Err(_) => {
                if shadow.file.state() != FileState::Failed {
                    self.violation(format!("failed sync left state {}", shadow.file.state()));
                }
                self.discard_shadow(shadow).await;
                false
            }
        }
    }

    async fn execute_publish(&mut self) -> bool {
        let Some(mut shadow) = self.current.take() else {
            return false;
        };
        let name = shadow.file.name().to_string();
        let paths = shadow.file.paths().clone();

        match shadow.file.close_and_publish().await {
            Ok(outcome) => {
                self.result.publishes += 1;
                let mut expected = std::mem::take(&mut shadow.synced);
                expected.append(&mut shadow.buffered);
                self.expect_object(paths.publish.as_str(), &expected);

                let remaining = self.transient_objects(&paths);
                if remaining > outcome.cleanup_failures.len() {
                    self.violation(format!(
                        "{} transient objects remain after publishing {} with {} cleanup failures",
                        remaining,
                        name,
                        outcome.cleanup_failures.len()
                    ));
                }
                if !outcome.is_clean() {
                    self.leaked.insert(name.clone(), outcome.cleanup_failures.len());
                }
                self.published.insert(name, expected);
                true
            }
            Err(_) => {
                self.discard_shadow(shadow).await;
                false
            }
        }
    }

    async fn execute_discard(&mut self) -> bool {
        let Some(shadow) = self.current.take() else {
            return false;
        };
        self.discard_shadow(shadow).await
    }

    async fn discard_shadow(&mut self, mut shadow: ShadowFile) -> bool {
        let name = shadow.file.name().to_string();
        let paths = shadow.file.paths().clone();
        match shadow.file.discard().await {
            Ok(leftover) => {
                self.result.discards += 1;
                let remaining = self.transient_objects(&paths)
                    + usize::from(self.gcs.object(DST_BUCKET, paths.publish.as_str()).is_some());
                if remaining > leftover {
                    self.violation(format!(
                        "discard of {} reported {} leftovers but {} objects remain",
                        name, leftover, remaining
                    ));
                }
                if leftover > 0 {
                    self.leaked.insert(name, leftover);
                }
                true
            }
            Err(e) => {
                self.violation(format!("discard of {} failed: {}", name, e));
                false
            }
        }
    }

    fn transient_objects(&self, paths: &FilePaths) -> usize {
        [&paths.inflight, &paths.part]
            .iter()
            .filter(|path| self.gcs.object(DST_BUCKET, path.as_str()).is_some())
            .count()
    }

    fn expect_object(&mut self, name: &str, expected: &[Bytes]) {
        let Some(data) = self.gcs.object(DST_BUCKET, name) else {
            self.violation(format!("{} missing", name));
            return;
        };
        match RecordReader::open(data) {
            Ok(decoded) if decoded.records == expected => {}
            Ok(decoded) => self.violation(format!(
                "{} holds {} records, expected {}",
                name,
                decoded.records.len(),
                expected.len()
            )),
            Err(e) => self.violation(format!("{} does not decode: {}", name, e)),
        }
    }

    fn violation(&mut self, message: String) {
        self.result
            .invariant_violations
            .push(format!("seed {}: {}", self.config.seed, message));
    }

    /// Discard any open file, then check store-wide invariants
    pub async fn check_invariants(&mut self) {
        if let Some(shadow) = self.current.take() {
            self.discard_shadow(shadow).await;
        }

        let publish_prefix = format!("{}/", SinkConfig::test(DST_ENDPOINT).publish_dir);
        let working_prefix = format!("{}/", SinkConfig::test(DST_ENDPOINT).working_dir);
        let published = self.published.clone();

        for (name, expected) in &published {
            self.expect_object(&format!("{}{}", publish_prefix, name), expected);
        }

        for object in self.gcs.object_names(DST_BUCKET) {
            if let Some(name) = object.strip_prefix(&publish_prefix) {
                if !published.contains_key(name) && !self.leaked.contains_key(name) {
                    self.violation(format!("{} published without a successful publish", object));
                }
            } else if let Some(rest) = object.strip_prefix(&working_prefix) {
                let name = rest.strip_suffix(crate::sink::path::PART_SUFFIX).unwrap_or(rest);
                if !self.leaked.contains_key(name) {
                    self.violation(format!("{} left behind without a reported failure", object));
                }
            } else {
                self.violation(format!("unexpected object {}", object));
            }
        }

        self.result.store_stats = self.gcs.stats();
    }

    pub fn result(&self) -> &SinkDSTResult {
        &self.result
    }

    pub fn into_result(self) -> SinkDSTResult {
        self.result
    }
}

/// Run a batch of DST runs with consecutive seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> SinkDSTConfig,
) -> Vec<SinkDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = SinkDSTHarness::new(config_fn(seed));
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[SinkDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_publishes: u64 = results.iter().map(|r| r.publishes).sum();
    let total_discards: u64 = results.iter().map(|r| r.discards).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} published, {} discarded",
        passed, total, total_ops, total_publishes, total_discards
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dst_harness_calm() {
        let mut harness = SinkDSTHarness::new(SinkDSTConfig::calm(42));
        harness.run(300).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(
            result.is_success(),
            "Calm mode should not have invariant violations: {:?}",
            result.invariant_violations
        );
        assert_eq!(result.failed_operations, result.capacity_rejections);
        assert!(result.publishes > 0);
    }

    #[tokio::test]
    async fn test_dst_harness_moderate() {
        let mut harness = SinkDSTHarness::new(SinkDSTConfig::moderate(123));
        harness.run(300).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert!(result.store_stats.injected_retriable > 0);
    }

    #[tokio::test]
    async fn test_dst_deterministic() {
        let mut first = SinkDSTHarness::new(SinkDSTConfig::chaos(7));
        first.run(200).await;
        let mut second = SinkDSTHarness::new(SinkDSTConfig::chaos(7));
        second.run(200).await;

        assert_eq!(
            first.result().successful_operations,
            second.result().successful_operations
        );
        assert_eq!(first.store().stats(), second.store().stats());
    }

    #[tokio::test]
    async fn test_dst_batch_chaos() {
        let results = run_dst_batch(500, 5, 200, SinkDSTConfig::chaos).await;
        let summary = summarize_batch(&results);
        println!("{}", summary);
        assert!(results.iter().all(|r| r.is_success()), "{}", summary);
    }
}
