//! External knowledge sources and their registry.
//!
//! A [`KnowledgeSource`] turns a query into a handful of pre-formatted,
//! source-attributed text blocks. Sources never fail outward: transport and
//! decoding problems are logged and produce an empty list, so a broken
//! source can only ever shrink the context, not abort a query.
//!
//! [`SourceRegistry`] owns the configured sources, drives their connection
//! lifecycle, and applies a per-source timeout to every search.

pub mod adapters;
pub mod mcp;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SourceConfig;

pub use adapters::{ArgumentLayout, ResultFormatter};
pub use mcp::{McpConnection, McpSource, McpTransport};

pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn health_check(&self) -> bool;

    /// Returns formatted context blocks, or an empty list on any failure.
    async fn search_context(&self, query: &str, top_k: usize) -> Vec<String>;
}

/// Health of one registered source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub display_name: String,
    pub available: bool,
}

struct RegisteredSource {
    source: Arc<dyn KnowledgeSource>,
    timeout: Duration,
}

#[derive(Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one [`McpSource`] per enabled `[sources.*]` table. Sources are
    /// registered but not yet connected.
    pub fn from_config(configs: &BTreeMap<String, SourceConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, config) in configs {
            if !config.enabled {
                info!(source = %name, "Source disabled, skipping");
                continue;
            }
            let source = McpSource::from_config(name, config)?;
            registry.register(Arc::new(source), Duration::from_secs(config.timeout_secs));
        }
        Ok(registry)
    }

    /// Adds a source under its own name, replacing any previous holder.
    pub fn register(&mut self, source: Arc<dyn KnowledgeSource>, timeout: Duration) {
        let name = source.name().to_string();
        info!(source = %name, timeout_secs = timeout.as_secs(), "Registered knowledge source");
        self.sources
            .insert(name, RegisteredSource { source, timeout });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KnowledgeSource>> {
        self.sources.get(name).map(|r| Arc::clone(&r.source))
    }

    pub fn available_sources(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Connects every source. Individual failures are logged and skipped.
    pub async fn connect_all(&self) {
        let attempts = self.sources.iter().map(|(name, r)| async move {
            match tokio::time::timeout(r.timeout, r.source.connect()).await {
                Ok(Ok(())) => info!(source = %name, "Connected knowledge source"),
                Ok(Err(e)) => warn!(source = %name, error = %e, "Failed to connect source"),
                Err(_) => warn!(source = %name, "Timed out connecting source"),
            }
        });
        join_all(attempts).await;
    }

    pub async fn disconnect_all(&self) {
        for (name, r) in &self.sources {
            match r.source.disconnect().await {
                Ok(()) => info!(source = %name, "Disconnected knowledge source"),
                Err(e) => warn!(source = %name, error = %e, "Error disconnecting source"),
            }
        }
    }

    /// Searches one named source under its timeout. Unknown names, expired
    /// timeouts, and panicking sources yield an empty list.
    pub async fn search_context(&self, source: &str, query: &str, top_k: usize) -> Vec<String> {
        let Some(registered) = self.sources.get(source) else {
            warn!(source = %source, "Unknown knowledge source");
            return Vec::new();
        };
        let search =
            AssertUnwindSafe(registered.source.search_context(query, top_k)).catch_unwind();
        match tokio::time::timeout(registered.timeout, search).await {
            Ok(Ok(context)) => context,
            Ok(Err(_)) => {
                warn!(source = %source, "Source search panicked");
                Vec::new()
            }
            Err(_) => {
                warn!(
                    source = %source,
                    timeout_secs = registered.timeout.as_secs_f64(),
                    "Source search timed out"
                );
                Vec::new()
            }
        }
    }

    /// Searches every source concurrently.
    pub async fn search_all(&self, query: &str, top_k: usize) -> BTreeMap<String, Vec<String>> {
        let searches = self.sources.keys().map(|name| async move {
            (name.clone(), self.search_context(name, query, top_k).await)
        });
        join_all(searches).await.into_iter().collect()
    }

    pub async fn get_sources_status(&self) -> Vec<SourceStatus> {
        let checks = self.sources.iter().map(|(name, r)| async move {
            let check = AssertUnwindSafe(r.source.health_check()).catch_unwind();
            let available = matches!(tokio::time::timeout(r.timeout, check).await, Ok(Ok(true)));
            SourceStatus {
                name: name.clone(),
                display_name: r.source.display_name().to_string(),
                available,
            }
        });
        join_all(checks).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-process source with canned results.
    pub(crate) struct FakeSource {
        pub name: String,
        pub results: Vec<String>,
        pub delay: Duration,
        pub fail_connect: bool,
        pub panic: bool,
        pub connected: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl FakeSource {
        pub fn new(name: &str, results: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                results: results.iter().map(|s| s.to_string()).collect(),
                delay: Duration::ZERO,
                fail_connect: false,
                panic: false,
                connected: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KnowledgeSource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn display_name(&self) -> &str {
            "Fake"
        }

        async fn connect(&self) -> Result<()> {
            if self.fail_connect {
                anyhow::bail!("connection refused");
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn health_check(&self) -> bool {
            self.is_connected()
        }

        async fn search_context(&self, _query: &str, top_k: usize) -> Vec<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.panic {
                let empty: Vec<String> = Vec::new();
                return vec![empty[top_k].clone()];
            }
            self.results.iter().take(top_k).cloned().collect()
        }
    }

    fn registry(sources: Vec<FakeSource>, timeout: Duration) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for source in sources {
            registry.register(Arc::new(source), timeout);
        }
        registry
    }

    #[tokio::test]
    async fn test_search_context_passthrough_and_unknown() {
        let registry = registry(
            vec![FakeSource::new("docs", &["a", "b", "c"])],
            DEFAULT_SOURCE_TIMEOUT,
        );
        assert_eq!(registry.search_context("docs", "q", 2).await, vec!["a", "b"]);
        assert!(registry.search_context("nope", "q", 2).await.is_empty());
        assert_eq!(registry.available_sources(), vec!["docs"]);
        assert!(registry.get("docs").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_search_context_timeout_yields_empty() {
        let mut slow = FakeSource::new("slow", &["late"]);
        slow.delay = Duration::from_secs(5);
        let registry = registry(vec![slow], Duration::from_millis(20));
        assert!(registry.search_context("slow", "q", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_source_yields_empty() {
        let mut broken = FakeSource::new("broken", &["never"]);
        broken.panic = true;
        let registry = registry(
            vec![broken, FakeSource::new("ok", &["fine"])],
            DEFAULT_SOURCE_TIMEOUT,
        );
        assert!(registry.search_context("broken", "q", 3).await.is_empty());

        let results = registry.search_all("q", 3).await;
        assert!(results["broken"].is_empty());
        assert_eq!(results["ok"], vec!["fine"]);
    }

    #[tokio::test]
    async fn test_search_all_runs_every_source() {
        let mut slow = FakeSource::new("slow", &["s"]);
        slow.delay = Duration::from_millis(50);
        let registry = registry(
            vec![FakeSource::new("fast", &["f"]), slow],
            DEFAULT_SOURCE_TIMEOUT,
        );
        let results = registry.search_all("q", 5).await;
        assert_eq!(results["fast"], vec!["f"]);
        assert_eq!(results["slow"], vec!["s"]);
    }

    #[tokio::test]
    async fn test_connect_all_tolerates_failures() {
        let mut broken = FakeSource::new("broken", &[]);
        broken.fail_connect = true;
        let registry = registry(
            vec![broken, FakeSource::new("ok", &[])],
            DEFAULT_SOURCE_TIMEOUT,
        );
        registry.connect_all().await;

        let status = registry.get_sources_status().await;
        assert_eq!(
            status,
            vec![
                SourceStatus {
                    name: "broken".into(),
                    display_name: "Fake".into(),
                    available: false
                },
                SourceStatus {
                    name: "ok".into(),
                    display_name: "Fake".into(),
                    available: true
                },
            ]
        );

        registry.disconnect_all().await;
        assert!(!registry.get("ok").unwrap().is_connected());
    }

    #[test]
    fn test_from_config_skips_disabled() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "docs".to_string(),
            SourceConfig {
                adapter: "docs".into(),
                display_name: Some("Learn".into()),
                transport: "http".into(),
                command: None,
                args: Vec::new(),
                working_dir: None,
                url: Some("https://learn.microsoft.com/api/mcp".into()),
                timeout_secs: 10,
                enabled: true,
            },
        );
        configs.insert(
            "off".to_string(),
            SourceConfig {
                adapter: "compliance".into(),
                display_name: None,
                transport: "stdio".into(),
                command: Some("python".into()),
                args: Vec::new(),
                working_dir: None,
                url: None,
                timeout_secs: 30,
                enabled: false,
            },
        );
        let registry = SourceRegistry::from_config(&configs).unwrap();
        assert_eq!(registry.available_sources(), vec!["docs"]);
        assert_eq!(registry.get("docs").unwrap().display_name(), "Learn");
    }
}
