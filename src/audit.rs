//! Audit emission for security-relevant events.
//!
//! Components that audit (the upgrade handler, the RPC interceptor) hold an
//! [`Auditor`] handle. The handle forwards each event to the currently
//! installed [`AuditSink`], which defaults to [`NoopAuditSink`]. Sinks are
//! fire-and-forget: they never fail the caller and ordering between entries
//! is not guaranteed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::auth::{read_user_id, RequestContext};

/// User id recorded when no user is bound to the context.
pub const UNKNOWN_USER: &str = "unknown";

/// Free-form key/value details attached to an audit entry.
pub type AuditMetadata = BTreeMap<String, String>;

/// Build [`AuditMetadata`] from string pairs.
pub fn metadata<const N: usize>(pairs: [(&str, &str); N]) -> AuditMetadata {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A single, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub success: bool,
    pub metadata: AuditMetadata,
}

impl AuditEntry {
    /// Build an entry stamped with the current time, resolving the user id
    /// from `ctx` or falling back to [`UNKNOWN_USER`].
    pub fn new(
        ctx: Option<&RequestContext>,
        action: &str,
        resource: &str,
        success: bool,
        metadata: AuditMetadata,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: read_user_id(ctx).unwrap_or(UNKNOWN_USER).to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            success,
            metadata,
        }
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Discards every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _entry: AuditEntry) {}
}

/// Emits entries as structured `tracing` events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let metadata = serde_json::to_string(&entry.metadata).unwrap_or_default();
        if entry.success {
            tracing::info!(
                target: "audit",
                timestamp = %entry.timestamp.to_rfc3339(),
                user_id = %entry.user_id,
                action = %entry.action,
                resource = %entry.resource,
                success = entry.success,
                metadata = %metadata,
                "audit"
            );
        } else {
            tracing::warn!(
                target: "audit",
                timestamp = %entry.timestamp.to_rfc3339(),
                user_id = %entry.user_id,
                action = %entry.action,
                resource = %entry.resource,
                success = entry.success,
                metadata = %metadata,
                "audit"
            );
        }
    }
}

/// Keeps entries in memory so they can be inspected later.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry recorded so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Entries whose action equals `action`.
    pub fn with_action(&self, action: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

/// Cloneable handle to the installed audit sink.
///
/// The sink is swapped with [`Auditor::set_sink`] while the process is being
/// composed (or in tests); request paths only ever read it.
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<RwLock<Arc<dyn AuditSink>>>,
}

impl Default for Auditor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor").finish_non_exhaustive()
    }
}

impl Auditor {
    /// Handle backed by [`NoopAuditSink`].
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoopAuditSink))
    }

    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink: Arc::new(RwLock::new(sink)),
        }
    }

    /// Replace the sink for every clone of this handle.
    pub fn set_sink(&self, sink: Arc<dyn AuditSink>) {
        *self.sink.write() = sink;
    }

    pub fn log_audit(
        &self,
        ctx: Option<&RequestContext>,
        action: &str,
        resource: &str,
        success: bool,
        metadata: AuditMetadata,
    ) {
        let entry = AuditEntry::new(ctx, action, resource, success, metadata);
        let sink = self.sink.read().clone();
        sink.record(entry);
    }
}
