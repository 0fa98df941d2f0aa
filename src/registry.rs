use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use crate::config::{self, GlobalSettings, IngestCfg, Settings, SrtSettings};
use crate::errors::{RelayError, Result};

/// Minimum interval between bitrate samples.
const BITRATE_WINDOW: Duration = Duration::from_millis(500);

/// Live status of one (ingest, URL) pair as reported by the API.
#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    pub url: String,
    pub active: bool,
    pub bitrate_kbps: f64,
    pub error_count: u64,
    pub uptime: String,
}

/// Live status of one ingest as reported by the API.
#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub name: String,
    pub url_path: String,
    pub active: bool,
    pub connections: u32,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputStatus>,
}

struct OutputEntry {
    url: String,
    active: bool,
    bitrate_kbps: f64,
    error_count: u64,
    start_time: Option<Instant>,
    // bitrate sampling window, touched only on the worker update path
    prev_bytes: u64,
    prev_time: Option<Instant>,
    reconnect: Arc<Notify>,
}

impl OutputEntry {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            active: false,
            bitrate_kbps: 0.0,
            error_count: 0,
            start_time: None,
            prev_bytes: 0,
            prev_time: None,
            reconnect: Arc::new(Notify::new()),
        }
    }
}

struct IngestEntry {
    name: String,
    url_path: String,
    active: bool,
    connections: u32,
    error_count: u64,
}

struct Inner {
    inputs: HashMap<String, IngestCfg>,
    status: HashMap<String, IngestEntry>,
    outputs: HashMap<String, HashMap<String, OutputEntry>>,
    settings: Settings,
}

/// Shared store of ingest configurations and live output status. The
/// single source of truth for the control plane, ingest sessions, and
/// output workers; one RwLock guards all three maps.
pub struct Registry {
    inner: RwLock<Inner>,
    config_path: PathBuf,
}

impl Registry {
    pub fn new(settings: Settings, config_path: PathBuf) -> Self {
        let mut inputs = HashMap::new();
        let mut status = HashMap::new();
        for cfg in &settings.inputs {
            inputs.insert(cfg.name.clone(), cfg.clone());
            status.insert(
                cfg.name.clone(),
                IngestEntry {
                    name: cfg.name.clone(),
                    url_path: cfg.url_path.clone(),
                    active: false,
                    connections: 0,
                    error_count: 0,
                },
            );
        }

        Self {
            inner: RwLock::new(Inner {
                inputs,
                status,
                outputs: HashMap::new(),
                settings,
            }),
            config_path,
        }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    // --- ingest configuration ---

    pub async fn add_ingest(&self, cfg: IngestCfg) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.inputs.contains_key(&cfg.name) {
            return Err(RelayError::IngestExists {
                name: cfg.name.clone(),
            });
        }
        inner.status.insert(
            cfg.name.clone(),
            IngestEntry {
                name: cfg.name.clone(),
                url_path: cfg.url_path.clone(),
                active: false,
                connections: 0,
                error_count: 0,
            },
        );
        log::info!("Added ingest {}", cfg.name);
        inner.inputs.insert(cfg.name.clone(), cfg);
        Ok(())
    }

    pub async fn remove_ingest(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner.inputs.remove(name);
        inner.status.remove(name);
        inner.outputs.remove(name);
        log::info!("Removed ingest {}", name);
    }

    pub async fn list_ingests(&self) -> Vec<IngestCfg> {
        let inner = self.inner.read().await;
        let mut list: Vec<_> = inner.inputs.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn ingest_by_path(&self, path: &str) -> Option<IngestCfg> {
        let inner = self.inner.read().await;
        inner
            .inputs
            .values()
            .find(|i| i.url_path.eq_ignore_ascii_case(path))
            .cloned()
    }

    pub async fn ingest_by_name(&self, name: &str) -> Option<IngestCfg> {
        let inner = self.inner.read().await;
        inner.inputs.get(name).cloned()
    }

    /// Snapshot of the declared outputs list. The reconciler reads this
    /// every tick; mutations by the control plane are observed here.
    pub async fn output_urls(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .inputs
            .get(name)
            .map(|i| i.outputs.clone())
            .unwrap_or_default()
    }

    pub async fn update_outputs(&self, name: &str, outputs: Vec<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let input = inner
            .inputs
            .get_mut(name)
            .ok_or_else(|| RelayError::IngestNotFound {
                name: name.to_string(),
            })?;
        input.outputs = outputs.clone();
        for url in &outputs {
            register_output_entry(&mut inner, name, url);
        }
        cleanup_removed(&mut inner, name);
        log::info!("Updated outputs for ingest {}: {:?}", name, outputs);
        Ok(())
    }

    /// Appends a URL to the declared list; idempotent.
    pub async fn add_output_url(&self, name: &str, url: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let input = inner
            .inputs
            .get_mut(name)
            .ok_or_else(|| RelayError::IngestNotFound {
                name: name.to_string(),
            })?;
        if !input.outputs.iter().any(|o| o == url) {
            input.outputs.push(url.to_string());
        }
        register_output_entry(&mut inner, name, url);
        Ok(())
    }

    pub async fn remove_output_url(&self, name: &str, url: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let input = inner
            .inputs
            .get_mut(name)
            .ok_or_else(|| RelayError::IngestNotFound {
                name: name.to_string(),
            })?;
        input.outputs.retain(|o| o != url);
        cleanup_removed(&mut inner, name);
        Ok(())
    }

    // --- ingest status ---

    pub async fn set_ingest_active(&self, name: &str, active: bool) {
        let mut inner = self.inner.write().await;
        if let Some(s) = inner.status.get_mut(name) {
            s.active = active;
            if active {
                s.connections += 1;
            } else if s.connections > 0 {
                s.connections -= 1;
            }
        }
    }

    pub async fn increment_ingest_error(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(s) = inner.status.get_mut(name) {
            s.error_count += 1;
        }
    }

    // --- output status ---

    /// Idempotent creation of an output status entry.
    pub async fn register_output(&self, name: &str, url: &str) {
        let mut inner = self.inner.write().await;
        register_output_entry(&mut inner, name, url);
    }

    pub async fn set_output_active(&self, name: &str, url: &str, active: bool) {
        let mut inner = self.inner.write().await;
        if let Some(out) = inner
            .outputs
            .get_mut(name)
            .and_then(|m| m.get_mut(url))
        {
            out.active = active;
            if active {
                out.start_time = Some(Instant::now());
            } else {
                out.start_time = None;
                out.bitrate_kbps = 0.0;
                out.prev_bytes = 0;
                out.prev_time = None;
            }
        }
    }

    pub async fn increment_output_error(&self, name: &str, url: &str) {
        let mut inner = self.inner.write().await;
        if let Some(out) = inner
            .outputs
            .get_mut(name)
            .and_then(|m| m.get_mut(url))
        {
            out.error_count += 1;
            out.active = false;
        }
    }

    /// Rolling bitrate from a cumulative byte counter. Emits a new value
    /// only once the sampling window has passed; a counter regression
    /// resets the window.
    pub async fn update_output_bitrate(&self, name: &str, url: &str, cumulative_bytes: u64) {
        self.update_output_bitrate_at(name, url, cumulative_bytes, Instant::now())
            .await
    }

    async fn update_output_bitrate_at(
        &self,
        name: &str,
        url: &str,
        cumulative_bytes: u64,
        now: Instant,
    ) {
        let mut inner = self.inner.write().await;
        let out = match inner.outputs.get_mut(name).and_then(|m| m.get_mut(url)) {
            Some(out) => out,
            // output already removed; routine during dynamic removal
            None => return,
        };

        let prev_time = match out.prev_time {
            Some(t) => t,
            None => {
                out.prev_bytes = cumulative_bytes;
                out.prev_time = Some(now);
                out.bitrate_kbps = 0.0;
                return;
            }
        };

        let elapsed = now.saturating_duration_since(prev_time);
        if elapsed < BITRATE_WINDOW {
            return;
        }

        if cumulative_bytes < out.prev_bytes {
            log::debug!("Bytes counter reset detected for ingest={} url={}", name, url);
            out.prev_bytes = cumulative_bytes;
            out.prev_time = Some(now);
            out.bitrate_kbps = 0.0;
            return;
        }

        let delta_bytes = cumulative_bytes - out.prev_bytes;
        let bitrate = (delta_bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1000.0;
        out.bitrate_kbps = bitrate.max(0.0);
        out.prev_bytes = cumulative_bytes;
        out.prev_time = Some(now);
    }

    /// Deletes output entries whose URL is no longer declared.
    pub async fn cleanup_removed_outputs(&self, name: &str) {
        let mut inner = self.inner.write().await;
        cleanup_removed(&mut inner, name);
    }

    /// Flags the output for reconnection: error count bumped, marked
    /// inactive, and the worker's reconnect signal fired.
    pub async fn force_reconnect(&self, name: &str, url: &str) {
        let mut inner = self.inner.write().await;
        if let Some(out) = inner
            .outputs
            .get_mut(name)
            .and_then(|m| m.get_mut(url))
        {
            out.active = false;
            out.start_time = None;
            out.bitrate_kbps = 0.0;
            out.error_count += 1;
            // notify_one stores a permit, so the signal is not lost when
            // the worker is mid-write rather than parked on the select
            out.reconnect.notify_one();
            log::info!("Forced reconnect for ingest={} url={}", name, url);
        }
    }

    /// The reconnect signal a worker selects on, registered on demand.
    pub async fn reconnect_signal(&self, name: &str, url: &str) -> Arc<Notify> {
        let mut inner = self.inner.write().await;
        register_output_entry(&mut inner, name, url);
        inner.outputs[name][url].reconnect.clone()
    }

    // --- status snapshots ---

    pub async fn status(&self, name: &str) -> Option<IngestStatus> {
        let inner = self.inner.read().await;
        inner.status.get(name).map(|s| ingest_status(&inner, s))
    }

    pub async fn all_statuses(&self) -> Vec<IngestStatus> {
        let inner = self.inner.read().await;
        let mut list: Vec<_> = inner
            .status
            .values()
            .map(|s| ingest_status(&inner, s))
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    // --- global settings ---

    pub async fn settings(&self) -> Settings {
        self.inner.read().await.settings.clone()
    }

    pub async fn global_settings(&self) -> GlobalSettings {
        GlobalSettings::from(&self.inner.read().await.settings)
    }

    pub async fn update_global_settings(&self, global: GlobalSettings) {
        let mut inner = self.inner.write().await;
        inner.settings.srt_settings = global.srt_settings;
        inner.settings.log_to_file = global.log_to_file;
        inner.settings.log_file = global.log_file;
        inner.settings.reconnect_interval = global.reconnect_interval;
        log::info!(
            "Global settings updated: latency={} streamid={} reconnect_interval={}",
            inner.settings.srt_settings.latency,
            inner.settings.srt_settings.streamid,
            inner.settings.reconnect_interval
        );
    }

    /// Re-reads config.yaml and replaces the global settings. Live ingest
    /// routing is untouched; only the tunables change.
    pub async fn reload_settings(&self) -> Result<()> {
        let manager = config::ConfigManager::from_path(&self.config_path)?;
        let fresh = manager.into_settings();
        let mut inner = self.inner.write().await;
        inner.settings.srt_settings = fresh.srt_settings;
        inner.settings.log_to_file = fresh.log_to_file;
        inner.settings.log_file = fresh.log_file;
        inner.settings.reconnect_interval = fresh.reconnect_interval;
        log::info!("Global settings reloaded from {}", self.config_path.display());
        Ok(())
    }

    /// Live backoff interval, re-read by workers before every redial.
    pub async fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.inner.read().await.settings.reconnect_interval)
    }

    pub async fn srt_settings(&self) -> SrtSettings {
        self.inner.read().await.settings.srt_settings.clone()
    }

    pub async fn queue_capacity(&self) -> usize {
        self.inner.read().await.settings.output_queue_size
    }
}

fn register_output_entry(inner: &mut Inner, name: &str, url: &str) {
    let map = inner.outputs.entry(name.to_string()).or_default();
    map.entry(url.to_string())
        .or_insert_with(|| OutputEntry::new(url));
}

fn cleanup_removed(inner: &mut Inner, name: &str) {
    let declared: std::collections::HashSet<&String> = match inner.inputs.get(name) {
        Some(input) => input.outputs.iter().collect(),
        None => return,
    };
    if let Some(map) = inner.outputs.get_mut(name) {
        map.retain(|url, _| declared.contains(url));
    }
}

fn ingest_status(inner: &Inner, entry: &IngestEntry) -> IngestStatus {
    let mut outputs: Vec<OutputStatus> = inner
        .outputs
        .get(&entry.name)
        .map(|m| m.values().map(output_status).collect())
        .unwrap_or_default();
    outputs.sort_by(|a, b| a.url.cmp(&b.url));

    IngestStatus {
        name: entry.name.clone(),
        url_path: entry.url_path.clone(),
        active: entry.active,
        connections: entry.connections,
        error_count: entry.error_count,
        outputs,
    }
}

fn output_status(out: &OutputEntry) -> OutputStatus {
    let uptime = match (out.active, out.start_time) {
        (true, Some(start)) => format_uptime(start.elapsed()),
        _ => "00:00:00".to_string(),
    };
    OutputStatus {
        url: out.url.clone(),
        active: out.active,
        bitrate_kbps: out.bitrate_kbps,
        error_count: out.error_count,
        uptime,
    }
}

fn format_uptime(d: Duration) -> String {
    let total = d.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(name: &str, outputs: Vec<&str>) -> Registry {
        let settings = Settings {
            inputs: vec![IngestCfg {
                name: name.to_string(),
                url_path: format!("/live/{}", name),
                outputs: outputs.into_iter().map(String::from).collect(),
            }],
            ..Settings::default()
        };
        Registry::new(settings, PathBuf::from("config.yaml"))
    }

    #[tokio::test]
    async fn add_ingest_conflict() {
        let registry = registry_with("live", vec![]);
        let err = registry
            .add_ingest(IngestCfg {
                name: "live".to_string(),
                url_path: "/other".to_string(),
                outputs: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::IngestExists { .. }));
    }

    #[tokio::test]
    async fn path_lookup_is_case_insensitive() {
        let registry = registry_with("live", vec![]);
        assert!(registry.ingest_by_path("/LIVE/live").await.is_some());
        assert!(registry.ingest_by_path("/nope").await.is_none());
    }

    #[tokio::test]
    async fn register_output_is_idempotent() {
        let registry = registry_with("live", vec![]);
        for _ in 0..3 {
            registry.register_output("live", "rtmp://a/b/c").await;
        }
        registry.increment_output_error("live", "rtmp://a/b/c").await;
        let status = registry.status("live").await.unwrap();
        assert_eq!(status.outputs.len(), 1);
        assert_eq!(status.outputs[0].error_count, 1);
    }

    #[tokio::test]
    async fn cleanup_leaves_exactly_declared_urls() {
        let registry = registry_with("live", vec!["rtmp://a/b/c", "srt://h:1"]);
        registry.register_output("live", "rtmp://a/b/c").await;
        registry.register_output("live", "srt://h:1").await;
        registry.register_output("live", "file:///tmp/x.flv").await;

        registry.cleanup_removed_outputs("live").await;

        let status = registry.status("live").await.unwrap();
        let urls: Vec<_> = status.outputs.iter().map(|o| o.url.as_str()).collect();
        assert_eq!(urls, vec!["rtmp://a/b/c", "srt://h:1"]);
    }

    #[tokio::test]
    async fn bitrate_never_negative_and_resets_on_regression() {
        let registry = registry_with("live", vec![]);
        registry.register_output("live", "srt://h:1").await;

        let t0 = Instant::now();
        registry
            .update_output_bitrate_at("live", "srt://h:1", 1000, t0)
            .await;
        registry
            .update_output_bitrate_at("live", "srt://h:1", 126_000, t0 + Duration::from_secs(1))
            .await;
        let status = registry.status("live").await.unwrap();
        assert!((status.outputs[0].bitrate_kbps - 1000.0).abs() < 1.0);

        // cumulative counter regressed: window resets, rate drops to zero
        registry
            .update_output_bitrate_at("live", "srt://h:1", 500, t0 + Duration::from_secs(2))
            .await;
        let status = registry.status("live").await.unwrap();
        assert_eq!(status.outputs[0].bitrate_kbps, 0.0);
    }

    #[tokio::test]
    async fn bitrate_window_holds_half_second() {
        let registry = registry_with("live", vec![]);
        registry.register_output("live", "srt://h:1").await;

        let t0 = Instant::now();
        registry
            .update_output_bitrate_at("live", "srt://h:1", 0, t0)
            .await;
        registry
            .update_output_bitrate_at("live", "srt://h:1", 10_000, t0 + Duration::from_millis(100))
            .await;
        let status = registry.status("live").await.unwrap();
        assert_eq!(status.outputs[0].bitrate_kbps, 0.0);
    }

    #[tokio::test]
    async fn deactivation_zeroes_bitrate_and_uptime() {
        let registry = registry_with("live", vec![]);
        registry.register_output("live", "srt://h:1").await;
        registry.set_output_active("live", "srt://h:1", true).await;

        let t0 = Instant::now();
        registry
            .update_output_bitrate_at("live", "srt://h:1", 0, t0)
            .await;
        registry
            .update_output_bitrate_at("live", "srt://h:1", 125_000, t0 + Duration::from_secs(1))
            .await;

        registry.set_output_active("live", "srt://h:1", false).await;
        let status = registry.status("live").await.unwrap();
        assert!(!status.outputs[0].active);
        assert_eq!(status.outputs[0].bitrate_kbps, 0.0);
        assert_eq!(status.outputs[0].uptime, "00:00:00");
    }

    #[tokio::test]
    async fn force_reconnect_fires_signal() {
        let registry = registry_with("live", vec![]);
        let signal = registry.reconnect_signal("live", "rtmp://a/b/c").await;

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.notified().await })
        };
        tokio::task::yield_now().await;

        registry.force_reconnect("live", "rtmp://a/b/c").await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("reconnect signal not delivered")
            .unwrap();

        let status = registry.status("live").await.unwrap();
        assert_eq!(status.outputs[0].error_count, 1);
        assert!(!status.outputs[0].active);
    }

    #[tokio::test]
    async fn connection_counting() {
        let registry = registry_with("live", vec![]);
        registry.set_ingest_active("live", true).await;
        registry.set_ingest_active("live", true).await;
        let status = registry.status("live").await.unwrap();
        assert_eq!(status.connections, 2);

        registry.set_ingest_active("live", false).await;
        registry.set_ingest_active("live", false).await;
        let status = registry.status("live").await.unwrap();
        assert!(!status.active);
        assert_eq!(status.connections, 0);
    }

    #[tokio::test]
    async fn remove_ingest_clears_everything() {
        let registry = registry_with("live", vec!["rtmp://a/b/c"]);
        registry.register_output("live", "rtmp://a/b/c").await;
        registry.remove_ingest("live").await;
        assert!(registry.status("live").await.is_none());
        assert!(registry.ingest_by_name("live").await.is_none());
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_uptime(Duration::from_secs(3661)), "01:01:01");
        assert_eq!(format_uptime(Duration::from_secs(86_400)), "24:00:00");
    }
}
