use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub static LOGIN_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static AUTHZ_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static REFRESH_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static PERMISSION_CACHE_LOOKUPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static PERMISSION_CACHE_INVALIDATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(registry: &Registry, name: &str, help: &str, label: &str) -> prometheus::Result<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Registers the core's counters. Calling it again is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let login = counter(
        &registry,
        "identity_login_attempts_total",
        "Login and second-factor attempts by outcome",
        "outcome",
    )?;
    let authz = counter(
        &registry,
        "identity_authz_decisions_total",
        "Authorization decisions",
        "decision",
    )?;
    let refresh = counter(
        &registry,
        "identity_refresh_outcomes_total",
        "Refresh token redemptions by outcome",
        "outcome",
    )?;
    let lookups = counter(
        &registry,
        "identity_permission_cache_lookups_total",
        "Permission cache line lookups",
        "result",
    )?;
    let invalidations = counter(
        &registry,
        "identity_permission_cache_invalidations_total",
        "Permission cache line invalidations",
        "source",
    )?;

    let _ = LOGIN_ATTEMPTS_TOTAL.set(login);
    let _ = AUTHZ_DECISIONS_TOTAL.set(authz);
    let _ = REFRESH_OUTCOMES_TOTAL.set(refresh);
    let _ = PERMISSION_CACHE_LOOKUPS_TOTAL.set(lookups);
    let _ = PERMISSION_CACHE_INVALIDATIONS_TOTAL.set(invalidations);
    let _ = REGISTRY.set(registry);

    tracing::info!("Metrics registry initialized");
    Ok(())
}

fn inc(metric: &OnceLock<IntCounterVec>, label: &str) {
    if let Some(m) = metric.get() {
        m.with_label_values(&[label]).inc();
    }
}

pub fn record_login(outcome: &str) {
    inc(&LOGIN_ATTEMPTS_TOTAL, outcome);
}

pub fn record_authz(allowed: bool) {
    inc(&AUTHZ_DECISIONS_TOTAL, if allowed { "allow" } else { "deny" });
}

pub fn record_refresh(outcome: &str) {
    inc(&REFRESH_OUTCOMES_TOTAL, outcome);
}

pub fn record_cache_lookup(hit: bool) {
    inc(&PERMISSION_CACHE_LOOKUPS_TOTAL, if hit { "hit" } else { "miss" });
}

pub fn record_invalidation(source: &str) {
    inc(&PERMISSION_CACHE_INVALIDATIONS_TOTAL, source);
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_after_init() {
        init_metrics().unwrap();
        init_metrics().unwrap();

        record_login("success");
        record_authz(false);

        let text = get_metrics();
        assert!(text.contains("identity_login_attempts_total"));
        assert!(text.contains("identity_authz_decisions_total"));
    }
}
