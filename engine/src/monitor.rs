//! Resource monitor
//!
//! The manager samples every enabled plugin on `limits.sample_interval_ms`
//! and hands the samples here. A reading above its ceiling publishes
//! `ResourceLimitExceeded` and records a high `resource_limit` violation.
//! The monitor never stops a plugin itself.
//!
//! A resource is reported once when it crosses its ceiling and again only
//! after it has dropped back below.

use crate::config::LimitsConfig;
use crate::message_bus::{Event, MessageBus};
use crate::security::SecurityValidator;
use sdk::types::Severity;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Violation kind recorded for overruns
pub const RESOURCE_LIMIT: &str = "resource_limit";

/// Sampled resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Memory,
    NetworkCalls,
    Storage,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Memory => "memory",
            Resource::NetworkCalls => "network_calls",
            Resource::Storage => "storage",
        }
    }
}

/// One reading for one plugin
#[derive(Debug, Clone, Default)]
pub struct UsageSample {
    pub plugin_id: String,
    /// None when the context did not answer `stats` in time
    pub memory_bytes: Option<u64>,
    pub network_calls: u64,
    pub storage_bytes: u64,
}

pub struct ResourceMonitor {
    limits: LimitsConfig,
    bus: Arc<MessageBus>,
    security: Arc<SecurityValidator>,
    flagged: Mutex<HashSet<(String, Resource)>>,
}

impl ResourceMonitor {
    pub fn new(limits: LimitsConfig, bus: Arc<MessageBus>, security: Arc<SecurityValidator>) -> Self {
        Self {
            limits,
            bus,
            security,
            flagged: Mutex::new(HashSet::new()),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Compare a sample against the limits, returning newly exceeded resources
    pub async fn check(&self, sample: &UsageSample) -> Vec<Resource> {
        let readings = [
            (Resource::Memory, sample.memory_bytes, self.limits.max_memory_bytes),
            (
                Resource::NetworkCalls,
                Some(sample.network_calls),
                self.limits.max_network_calls,
            ),
            (
                Resource::Storage,
                Some(sample.storage_bytes),
                self.limits.max_storage_bytes,
            ),
        ];

        let mut exceeded = Vec::new();
        for (resource, usage, limit) in readings {
            let Some(usage) = usage else { continue };
            let key = (sample.plugin_id.clone(), resource);

            if usage <= limit {
                self.flagged.lock().await.remove(&key);
                continue;
            }
            if !self.flagged.lock().await.insert(key) {
                continue;
            }

            self.report(&sample.plugin_id, resource, usage, limit).await;
            exceeded.push(resource);
        }
        exceeded
    }

    async fn report(&self, plugin_id: &str, resource: Resource, usage: u64, limit: u64) {
        tracing::warn!(
            "{} exceeded its {} limit: {} > {}",
            plugin_id,
            resource.as_str(),
            usage,
            limit
        );
        self.bus
            .publish(Event::ResourceLimitExceeded {
                plugin_id: plugin_id.to_string(),
                resource: resource.as_str().to_string(),
                usage,
                limit,
            })
            .await;

        let description = format!("{} usage {} exceeds limit {}", resource.as_str(), usage, limit);
        if let Err(e) = self
            .security
            .record_violation(plugin_id, RESOURCE_LIMIT, Severity::High, &description, false)
            .await
        {
            tracing::error!("Failed to record violation for {}: {}", plugin_id, e);
        }
    }

    /// Forget flagged state of a plugin
    pub async fn forget(&self, plugin_id: &str) {
        self.flagged.lock().await.retain(|(id, _)| id != plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::message_bus::EventType;
    use crate::security::patterns::CodePatterns;
    use crate::storage::MemoryKvStore;

    fn monitor() -> (ResourceMonitor, Arc<SecurityValidator>, Arc<MessageBus>) {
        let config = Config::default();
        let bus = Arc::new(MessageBus::new());
        let security = Arc::new(SecurityValidator::new(
            config.security.clone(),
            &config.sandbox,
            Arc::new(CodePatterns::new().unwrap()),
            Arc::new(MemoryKvStore::new()),
            Arc::clone(&bus),
            Arc::new(ManualClock::new(0)),
        ));
        let limits = LimitsConfig {
            max_memory_bytes: 1000,
            max_network_calls: 5,
            max_storage_bytes: 100,
            sample_interval_ms: 1000,
        };
        (
            ResourceMonitor::new(limits, Arc::clone(&bus), Arc::clone(&security)),
            security,
            bus,
        )
    }

    fn sample(memory: u64, calls: u64, storage: u64) -> UsageSample {
        UsageSample {
            plugin_id: "p".to_string(),
            memory_bytes: Some(memory),
            network_calls: calls,
            storage_bytes: storage,
        }
    }

    #[tokio::test]
    async fn test_within_limits() {
        let (monitor, security, _) = monitor();
        assert!(monitor.check(&sample(10, 1, 1)).await.is_empty());
        assert!(security.violations(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_overrun_is_reported_once() {
        let (monitor, security, bus) = monitor();
        let mut rx = bus.subscribe(EventType::ResourceLimitExceeded).await;

        assert_eq!(monitor.check(&sample(5000, 1, 1)).await, vec![Resource::Memory]);
        assert!(monitor.check(&sample(5000, 1, 1)).await.is_empty());

        match rx.recv().await.unwrap() {
            Event::ResourceLimitExceeded {
                resource, usage, limit, ..
            } => {
                assert_eq!(resource, "memory");
                assert_eq!(usage, 5000);
                assert_eq!(limit, 1000);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let violations = security.violations(Some("p")).await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, RESOURCE_LIMIT);
        assert_eq!(violations[0].severity, Severity::High);
        assert!(!security.is_blocked("p").await);

        // drops below, then crosses again
        monitor.check(&sample(10, 1, 1)).await;
        assert_eq!(monitor.check(&sample(5000, 1, 1)).await, vec![Resource::Memory]);
    }

    #[tokio::test]
    async fn test_missing_memory_reading_is_skipped() {
        let (monitor, _, _) = monitor();
        let mut reading = sample(0, 9, 500);
        reading.memory_bytes = None;
        assert_eq!(
            monitor.check(&reading).await,
            vec![Resource::NetworkCalls, Resource::Storage]
        );
    }
}
