//! Append-only decision log.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::authz::errors::AuthzError;
use crate::authz::types::Effect;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Completion order across all evaluations of one logger.
    pub sequence: u64,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub principal_id: String,
    pub principal_roles: BTreeSet<String>,
    pub resource_kind: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub effect: Effect,
    pub reason: String,
    pub matched_rules: Vec<String>,
}

/// Durable forwarder for audit records (database, queue, file).
pub trait AuditSink: Send + Sync {
    fn write(&self, record: &AuditRecord) -> Result<(), AuthzError>;
}

/// Emits each record as a structured event on the `warden::audit` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuthzError> {
        tracing::info!(
            target: "warden::audit",
            sequence = record.sequence,
            correlation_id = %record.correlation_id,
            tenant = %record.tenant_id,
            principal = %record.principal_id,
            resource_kind = %record.resource_kind,
            resource_id = record.resource_id.as_deref().unwrap_or("-"),
            action = %record.action,
            effect = %record.effect,
            matched_rules = ?record.matched_rules,
            reason = %record.reason,
            "authorization decision"
        );
        Ok(())
    }
}

/// Fields of a record before the logger stamps sequence and timestamp.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub correlation_id: String,
    pub tenant_id: String,
    pub principal_id: String,
    pub principal_roles: BTreeSet<String>,
    pub resource_kind: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub effect: Effect,
    pub reason: String,
    pub matched_rules: Vec<String>,
}

#[derive(Default)]
pub struct AuditLogger {
    records: RwLock<Vec<Arc<AuditRecord>>>,
    sequence: AtomicU64,
    sinks: Vec<Arc<dyn AuditSink>>,
    sink_failures: AtomicU64,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("records", &self.len())
            .field("sinks", &self.sinks.len())
            .field("sink_failures", &self.sink_failures())
            .finish()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Append a record. Sink errors are logged and counted, never returned.
    pub fn log(&self, entry: AuditEntry) -> Arc<AuditRecord> {
        self.log_with_failures(entry).0
    }

    /// Like [`log`](Self::log), also reporting how many sinks failed for this record.
    pub fn log_with_failures(&self, entry: AuditEntry) -> (Arc<AuditRecord>, usize) {
        let record = {
            let mut records = self.records.write();
            // sequence is taken under the write lock so it matches append order
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let record = Arc::new(AuditRecord {
                sequence,
                correlation_id: entry.correlation_id,
                timestamp: Utc::now(),
                tenant_id: entry.tenant_id,
                principal_id: entry.principal_id,
                principal_roles: entry.principal_roles,
                resource_kind: entry.resource_kind,
                resource_id: entry.resource_id,
                action: entry.action,
                effect: entry.effect,
                reason: entry.reason,
                matched_rules: entry.matched_rules,
            });
            records.push(record.clone());
            record
        };

        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.write(&record) {
                failed += 1;
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    correlation_id = %record.correlation_id,
                    "audit sink write failed"
                );
            }
        }
        (record, failed)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.query(limit, |_| true)
    }

    pub fn for_principal(&self, principal_id: &str, limit: usize) -> Vec<AuditRecord> {
        self.query(limit, |r| r.principal_id == principal_id)
    }

    /// `resource_id = None` matches every instance of the kind.
    pub fn for_resource(
        &self,
        kind: &str,
        resource_id: Option<&str>,
        limit: usize,
    ) -> Vec<AuditRecord> {
        self.query(limit, |r| {
            r.resource_kind == kind
                && resource_id.map_or(true, |id| r.resource_id.as_deref() == Some(id))
        })
    }

    pub fn by_effect(&self, effect: Effect, limit: usize) -> Vec<AuditRecord> {
        self.query(limit, |r| r.effect == effect)
    }

    pub fn find_by_correlation_id(&self, correlation_id: &str) -> Option<AuditRecord> {
        self.query(1, |r| r.correlation_id == correlation_id)
            .into_iter()
            .next()
    }

    fn query<F>(&self, limit: usize, predicate: F) -> Vec<AuditRecord>
    where
        F: Fn(&AuditRecord) -> bool,
    {
        self.records
            .read()
            .iter()
            .rev()
            .filter(|r| predicate(r))
            .take(limit)
            .map(|r| AuditRecord::clone(r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn entry(principal: &str, kind: &str, id: Option<&str>, effect: Effect) -> AuditEntry {
        AuditEntry {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "default".into(),
            principal_id: principal.into(),
            principal_roles: BTreeSet::new(),
            resource_kind: kind.into(),
            resource_id: id.map(String::from),
            action: "read".into(),
            effect,
            reason: "test".into(),
            matched_rules: vec![],
        }
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn write(&self, _record: &AuditRecord) -> Result<(), AuthzError> {
            Err(AuthzError::AuditSink("disk full".into()))
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<u64>>);

    impl AuditSink for CollectingSink {
        fn write(&self, record: &AuditRecord) -> Result<(), AuthzError> {
            self.0.lock().unwrap().push(record.sequence);
            Ok(())
        }
    }

    #[test]
    fn test_queries_newest_first_with_limit() {
        let log = AuditLogger::new();
        log.log(entry("u1", "lead", Some("l1"), Effect::Allow));
        log.log(entry("u2", "lead", Some("l2"), Effect::Deny));
        log.log(entry("u1", "document", None, Effect::Deny));

        let u1 = log.for_principal("u1", 10);
        assert_eq!(u1.len(), 2);
        assert_eq!(u1[0].resource_kind, "document");
        assert!(u1[0].sequence > u1[1].sequence);

        assert_eq!(log.for_principal("u1", 1).len(), 1);
        assert_eq!(log.for_resource("lead", None, 10).len(), 2);
        assert_eq!(log.for_resource("lead", Some("l2"), 10)[0].principal_id, "u2");
        assert_eq!(log.by_effect(Effect::Deny, 10).len(), 2);
        assert_eq!(log.recent(2).len(), 2);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let collecting = Arc::new(CollectingSink::default());
        let log = AuditLogger::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(collecting.clone());
        let record = log.log(entry("u1", "lead", None, Effect::Allow));
        assert_eq!(record.sequence, 1);
        assert_eq!(log.sink_failures(), 1);
        assert_eq!(*collecting.0.lock().unwrap(), vec![1]);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_concurrent_appends_get_unique_sequences() {
        let log = Arc::new(AuditLogger::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        log.log(entry(&format!("u{t}"), "lead", None, Effect::Allow));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let all = log.recent(usize::MAX);
        assert_eq!(all.len(), 800);
        let seqs: BTreeSet<u64> = all.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs.len(), 800);
        assert!(all.windows(2).all(|w| w[0].sequence > w[1].sequence));
    }

    #[test]
    fn test_find_by_correlation_id() {
        let log = AuditLogger::new();
        let rec = log.log(entry("u1", "lead", None, Effect::Allow));
        let found = log.find_by_correlation_id(&rec.correlation_id).unwrap();
        assert_eq!(found.sequence, rec.sequence);
        assert!(log.find_by_correlation_id("nope").is_none());
    }
}
