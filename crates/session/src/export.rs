//! Session export — a versioned JSON snapshot of everything a session
//! tracked: timing, request counts, cost and token breakdowns by model, and
//! alert state. A snapshot format, not an append log.

use crate::session::Session;
use chrono::{DateTime, Utc};
use costrail_core::error::{Error, Result};
use costrail_telemetry::{AlertStatus, CostBreakdown, UsageBreakdown};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Bumped whenever the export layout changes shape.
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

/// Flat JSON snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExport {
    /// Export format version.
    pub schema_version: u32,
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub dry_run: bool,
    pub metadata: Map<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub request_count: u64,
    pub cost: CostBreakdown,
    pub tokens: UsageBreakdown,
    pub alerts: Vec<AlertStatus>,
}

impl Session {
    /// Snapshot the session state.
    pub fn export(&self) -> SessionExport {
        let (started_at, ended_at) = self.timestamps();
        SessionExport {
            schema_version: EXPORT_SCHEMA_VERSION,
            session_id: self.session_id().to_string(),
            provider: self.provider_name().to_string(),
            model: self.model().to_string(),
            dry_run: self.is_dry_run(),
            metadata: self.metadata().clone(),
            started_at,
            ended_at,
            duration_seconds: self.duration_seconds(),
            request_count: self.request_count(),
            cost: self.cost_tracker().breakdown(),
            tokens: self.token_monitor().breakdown(),
            alerts: self.alert_manager().status(),
        }
    }

    /// Write the snapshot as pretty-printed JSON, creating parent
    /// directories as needed.
    pub async fn export_to_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("create {}: {e}", parent.display())))?;
        }

        let json = serde_json::to_string_pretty(&self.export())?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| Error::Internal(format!("write {}: {e}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use costrail_core::provider::{ChatRequest, ChatResponse, CostEstimate, Provider};
    use costrail_core::{ProviderError, Role};
    use std::sync::Arc;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn validate_connection(&self) -> std::result::Result<bool, ProviderError> {
            Ok(true)
        }

        async fn chat(
            &self,
            request: ChatRequest,
        ) -> std::result::Result<ChatResponse, ProviderError> {
            let prompt = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatResponse {
                content: prompt,
                model: request.model,
                input_tokens: 10,
                output_tokens: 20,
                finish_reason: Some("stop".into()),
                metadata: Map::new(),
            })
        }

        async fn count_tokens(
            &self,
            text: &str,
            _model: &str,
        ) -> std::result::Result<u32, ProviderError> {
            Ok((text.len() / 4) as u32)
        }

        async fn estimate_cost(
            &self,
            _prompt: &str,
            _model: &str,
            _max_tokens: Option<u32>,
        ) -> std::result::Result<CostEstimate, ProviderError> {
            Ok(CostEstimate {
                input_cost: 0.001,
                output_cost: 0.0,
                total_cost: 0.001,
                input_tokens: 10,
            })
        }

        fn calculate_cost(&self, _input: u32, _output: u32, _model: &str) -> f64 {
            0.001
        }
    }

    #[tokio::test]
    async fn export_snapshot_shape() {
        let session = Session::new(Arc::new(EchoProvider), "echo-1").with_budget(1.0);
        session.chat("hello").await.unwrap();
        session.chat("again").await.unwrap();

        let export = session.export();
        assert_eq!(export.schema_version, EXPORT_SCHEMA_VERSION);
        assert_eq!(export.provider, "echo");
        assert_eq!(export.model, "echo-1");
        assert_eq!(export.request_count, 2);
        assert!(export.started_at.is_some());
        assert!((export.cost.total_cost - 0.002).abs() < 1e-12);
        assert_eq!(export.tokens.total_tokens, 60);
        assert_eq!(export.cost.records.len(), 2);
        assert_eq!(export.cost.budget, Some(1.0));
    }

    #[tokio::test]
    async fn export_json_roundtrip() {
        let session = Session::new(Arc::new(EchoProvider), "echo-1");
        session.chat("hello").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        session.export_to_json(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: SessionExport = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.schema_version, EXPORT_SCHEMA_VERSION);
        assert_eq!(parsed.session_id, session.session_id());
        assert_eq!(parsed.tokens.request_count, 1);
    }
}
