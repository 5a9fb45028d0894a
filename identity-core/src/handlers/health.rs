use service_core::axum::{extract::State, Json};
use service_core::error::AppError;

use crate::AppState;

/// Database must answer; Redis only when configured.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.db.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Database health check failed");
        e
    })?;

    let redis = match &state.redis {
        Some(bus) => {
            bus.health_check().await.map_err(|e| {
                tracing::error!(error = %e, "Redis health check failed");
                AppError::ServiceUnavailable
            })?;
            "up"
        }
        None => "disabled",
    };

    let cache = state.core.cache.stats();

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "checks": {
            "postgres": "up",
            "redis": redis,
        },
        "permission_cache": {
            "lines": cache.lines,
            "tracked_roles": cache.tracked_roles,
            "hits": cache.hits,
            "misses": cache.misses,
        }
    })))
}
