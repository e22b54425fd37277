//! Health monitoring and load-balancing hints (C9).
//!
//! Periodic, tiered health checks over registered components, rolled up to
//! a five-level [`HealthStatus`], with cooldown-gated alerts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub response_time_ms: f32,
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: f32,
    pub gpu_memory_mb: f32,
    pub gpu_util_percent: f32,
    pub active_transcriptions: usize,
    pub queued_requests: usize,
    pub buffer_usage_mb: f32,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub max_response_time_ms: f32,
    pub max_cpu_percent: f32,
    pub max_memory_mb: f32,
    pub max_gpu_memory_mb: f32,
    pub max_buffer_mb: f32,
    pub max_concurrent_transcriptions: usize,
    pub max_queue_size: usize,
    pub min_confidence: f32,
    pub max_latency_ms: f32,
    pub min_accuracy: f32,
    pub alert_cooldown_ms: u64,
    pub load_balancing_threshold: f32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            max_response_time_ms: 1_000.0,
            max_cpu_percent: 90.0,
            max_memory_mb: 4_096.0,
            max_gpu_memory_mb: 8_192.0,
            max_buffer_mb: 256.0,
            max_concurrent_transcriptions: 32,
            max_queue_size: 256,
            min_confidence: 0.5,
            max_latency_ms: 2_000.0,
            min_accuracy: 0.8,
            alert_cooldown_ms: 60_000,
            load_balancing_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemHealthStatus {
    pub overall_status: HealthStatus,
    pub overall_message: String,
    pub timestamp_ms: u64,
    pub total_check_time_ms: f32,
    pub components: Vec<ComponentHealth>,
    pub resource_usage: ResourceUsage,
}

#[derive(Debug, Clone)]
pub struct HealthAlert {
    pub id: u64,
    pub component: String,
    pub severity: HealthStatus,
    pub message: String,
    pub context: HashMap<String, String>,
    pub timestamp: Instant,
    pub acknowledged: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonitoringStats {
    pub checks_run: u64,
    pub alerts_generated: u64,
    pub health_transitions: u64,
}

/// §4.9 overall-status precedence: any Critical wins, then Unhealthy, then
/// Degraded, else Healthy if at least one component is Healthy, else Unknown.
pub fn determine_overall_status(components: &[ComponentHealth]) -> HealthStatus {
    if components.iter().any(|c| c.status == HealthStatus::Critical) {
        return HealthStatus::Critical;
    }
    if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
        return HealthStatus::Unhealthy;
    }
    if components.iter().any(|c| c.status == HealthStatus::Degraded) {
        return HealthStatus::Degraded;
    }
    if components.iter().any(|c| c.status == HealthStatus::Healthy) {
        return HealthStatus::Healthy;
    }
    HealthStatus::Unknown
}

fn health_weight(status: HealthStatus) -> f32 {
    match status {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 0.3,
        HealthStatus::Unhealthy => 0.7,
        HealthStatus::Critical | HealthStatus::Unknown => 1.0,
    }
}

type CheckFn = Box<dyn Fn() -> ComponentHealth + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct InstanceHealth {
    status: HealthStatus,
    response_time_ms: f32,
}

struct Inner {
    config: HealthCheckConfig,
    checks: Mutex<HashMap<String, CheckFn>>,
    resource_fn: Mutex<Option<Box<dyn Fn() -> ResourceUsage + Send + Sync>>>,
    instances: Mutex<HashMap<String, InstanceHealth>>,
    alerts: Mutex<Vec<HealthAlert>>,
    last_alert_emitted: Mutex<HashMap<String, Instant>>,
    next_alert_id: AtomicU64,
    stats: Mutex<MonitoringStats>,
    last_overall: Mutex<Option<HealthStatus>>,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct HealthMonitor(Arc<Inner>);

impl HealthMonitor {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self(Arc::new(Inner {
            config,
            checks: Mutex::new(HashMap::new()),
            resource_fn: Mutex::new(None),
            instances: Mutex::new(HashMap::new()),
            alerts: Mutex::new(Vec::new()),
            last_alert_emitted: Mutex::new(HashMap::new()),
            next_alert_id: AtomicU64::new(1),
            stats: Mutex::new(MonitoringStats::default()),
            last_overall: Mutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    pub fn register_check(&self, name: impl Into<String>, check: impl Fn() -> ComponentHealth + Send + Sync + 'static) {
        self.0.checks.lock().insert(name.into(), Box::new(check));
    }

    pub fn set_resource_sampler(&self, sampler: impl Fn() -> ResourceUsage + Send + Sync + 'static) {
        *self.0.resource_fn.lock() = Some(Box::new(sampler));
    }

    pub fn register_instance(&self, name: impl Into<String>, status: HealthStatus, response_time_ms: f32) {
        self.0.instances.lock().insert(name.into(), InstanceHealth { status, response_time_ms });
    }

    /// Runs all registered checks on demand and aggregates a system-wide report.
    pub fn check(&self) -> SystemHealthStatus {
        let started = Instant::now();
        let components: Vec<ComponentHealth> = self.0.checks.lock().values().map(|f| f()).collect();
        let resource_usage = self.0.resource_fn.lock().as_ref().map(|f| f()).unwrap_or_default();

        self.0.stats.lock().checks_run += 1;

        let overall_status = determine_overall_status(&components);
        {
            let mut last = self.0.last_overall.lock();
            if *last != Some(overall_status) {
                self.0.stats.lock().health_transitions += 1;
                *last = Some(overall_status);
            }
        }

        for c in &components {
            if c.status >= HealthStatus::Unhealthy {
                self.maybe_alert(&c.name, c.status, c.message.clone());
            }
        }

        let overall_message = format!("{overall_status:?}: {} components checked", components.len());
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        SystemHealthStatus {
            overall_status,
            overall_message,
            timestamp_ms,
            total_check_time_ms: started.elapsed().as_secs_f32() * 1000.0,
            components,
            resource_usage,
        }
    }

    fn maybe_alert(&self, component: &str, severity: HealthStatus, message: String) {
        let key = format!("{component}|{severity:?}");
        let mut last_emitted = self.0.last_alert_emitted.lock();
        if let Some(last) = last_emitted.get(&key) {
            if last.elapsed() < Duration::from_millis(self.0.config.alert_cooldown_ms) {
                return;
            }
        }
        last_emitted.insert(key, Instant::now());
        drop(last_emitted);

        let alert = HealthAlert {
            id: self.0.next_alert_id.fetch_add(1, Ordering::SeqCst),
            component: component.to_string(),
            severity,
            message,
            context: HashMap::new(),
            timestamp: Instant::now(),
            acknowledged: false,
        };
        self.0.alerts.lock().push(alert);
        self.0.stats.lock().alerts_generated += 1;
    }

    pub fn acknowledge(&self, id: u64) {
        if let Some(a) = self.0.alerts.lock().iter_mut().find(|a| a.id == id) {
            a.acknowledged = true;
        }
    }

    pub fn clear_acknowledged(&self) {
        self.0.alerts.lock().retain(|a| !a.acknowledged);
    }

    pub fn alerts(&self) -> Vec<HealthAlert> {
        self.0.alerts.lock().clone()
    }

    pub fn monitoring_stats(&self) -> MonitoringStats {
        *self.0.stats.lock()
    }

    fn load_for(&self, h: &InstanceHealth) -> f32 {
        0.7 * health_weight(h.status) + 0.3 * (h.response_time_ms / self.0.config.max_response_time_ms).min(1.0)
    }

    /// Lowest-load Healthy-or-Degraded instance, if any.
    pub fn recommend(&self) -> Option<String> {
        self.0
            .instances
            .lock()
            .iter()
            .filter(|(_, h)| matches!(h.status, HealthStatus::Healthy | HealthStatus::Degraded))
            .min_by(|(_, a), (_, b)| self.load_for(a).total_cmp(&self.load_for(b)))
            .map(|(name, _)| name.clone())
    }

    pub fn can_accept(&self) -> bool {
        let instances = self.0.instances.lock();
        if instances.is_empty() {
            return true;
        }
        let overall = determine_overall_status(
            &instances
                .iter()
                .map(|(name, h)| ComponentHealth {
                    name: name.clone(),
                    status: h.status,
                    message: String::new(),
                    response_time_ms: h.response_time_ms,
                    details: HashMap::new(),
                })
                .collect::<Vec<_>>(),
        );
        if overall == HealthStatus::Critical {
            return false;
        }
        let healthy_count = instances.values().filter(|h| h.status == HealthStatus::Healthy).count();
        if healthy_count < 1 {
            return false;
        }
        let avg_load = instances.values().map(|h| self.load_for(h)).sum::<f32>() / instances.len() as f32;
        avg_load <= self.0.config.load_balancing_threshold
    }

    /// Spawns two cooperative loops (health, resource) calling `check()`
    /// and the resource sampler on the given interval until stopped.
    pub fn start_background(&self, interval: Duration) -> BackgroundHandles {
        self.0.running.store(true, Ordering::SeqCst);
        let health_self = self.clone();
        let health_thread = std::thread::spawn(move || {
            while health_self.0.running.load(Ordering::SeqCst) {
                health_self.check();
                std::thread::sleep(interval);
            }
        });
        let resource_self = self.clone();
        let resource_thread = std::thread::spawn(move || {
            while resource_self.0.running.load(Ordering::SeqCst) {
                if let Some(sampler) = resource_self.0.resource_fn.lock().as_ref() {
                    let _ = sampler();
                }
                std::thread::sleep(interval);
            }
        });
        BackgroundHandles { monitor: self.clone(), health_thread: Some(health_thread), resource_thread: Some(resource_thread) }
    }
}

pub struct BackgroundHandles {
    monitor: HealthMonitor,
    health_thread: Option<JoinHandle<()>>,
    resource_thread: Option<JoinHandle<()>>,
}

impl Drop for BackgroundHandles {
    fn drop(&mut self) {
        self.monitor.0.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.health_thread.take() {
            if h.join().is_err() {
                warn!("health loop panicked while joining");
            }
        }
        if let Some(h) = self.resource_thread.take() {
            if h.join().is_err() {
                warn!("resource loop panicked while joining");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, status: HealthStatus) -> ComponentHealth {
        ComponentHealth { name: name.to_string(), status, message: String::new(), response_time_ms: 10.0, details: HashMap::new() }
    }

    #[test]
    fn overall_status_follows_precedence() {
        assert_eq!(determine_overall_status(&[component("a", HealthStatus::Healthy), component("b", HealthStatus::Degraded)]), HealthStatus::Degraded);
        assert_eq!(determine_overall_status(&[component("a", HealthStatus::Critical), component("b", HealthStatus::Healthy)]), HealthStatus::Critical);
        assert_eq!(determine_overall_status(&[]), HealthStatus::Unknown);
    }

    #[test]
    fn alert_is_suppressed_within_cooldown() {
        let monitor = HealthMonitor::new(HealthCheckConfig { alert_cooldown_ms: 60_000, ..HealthCheckConfig::default() });
        monitor.register_check("model", || component("model", HealthStatus::Critical));
        monitor.check();
        monitor.check();
        assert_eq!(monitor.alerts().len(), 1);
    }

    #[test]
    fn recommend_picks_lowest_load_instance() {
        let monitor = HealthMonitor::new(HealthCheckConfig::default());
        monitor.register_instance("a", HealthStatus::Healthy, 900.0);
        monitor.register_instance("b", HealthStatus::Healthy, 50.0);
        monitor.register_instance("c", HealthStatus::Critical, 10.0);
        assert_eq!(monitor.recommend(), Some("b".to_string()));
    }

    #[test]
    fn can_accept_false_when_no_healthy_instances() {
        let monitor = HealthMonitor::new(HealthCheckConfig::default());
        monitor.register_instance("a", HealthStatus::Unhealthy, 10.0);
        assert!(!monitor.can_accept());
    }

    #[test]
    fn acknowledge_and_clear_removes_alert() {
        let monitor = HealthMonitor::new(HealthCheckConfig::default());
        monitor.register_check("model", || component("model", HealthStatus::Unhealthy));
        monitor.check();
        let id = monitor.alerts()[0].id;
        monitor.acknowledge(id);
        monitor.clear_acknowledged();
        assert!(monitor.alerts().is_empty());
    }
}
