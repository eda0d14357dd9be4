use std::fmt;
use std::sync::Arc;

use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;

use crate::store::RecordStore;

/// One probed dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub name: &'static str,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{} connection OK", self.name),
            Some(e) => write!(f, "{} connection FAILED: {e}", self.name),
        }
    }
}

/// Result of probing every enabled dependency. Displays one line per probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probes: Vec<ProbeResult>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.probes.iter().all(ProbeResult::is_ok)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.probes.is_empty() {
            return f.write_str("no dependencies configured");
        }
        for (i, probe) in self.probes.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{probe}")?;
        }
        Ok(())
    }
}

pub struct HealthChecker {
    store: Option<(Arc<dyn ObjectStore>, String)>,
    db: Option<Arc<dyn RecordStore>>,
}

impl HealthChecker {
    pub fn new(store: Option<(Arc<dyn ObjectStore>, String)>, db: Option<Arc<dyn RecordStore>>) -> Self {
        Self { store, db }
    }

    /// List one level under the archive folder.
    pub async fn check_object_store(&self) -> Option<ProbeResult> {
        let (store, folder) = self.store.as_ref()?;
        let folder = folder.trim_matches('/');
        let prefix = (!folder.is_empty()).then(|| ObjectPath::from(folder));
        let error = store
            .list_with_delimiter(prefix.as_ref())
            .await
            .err()
            .map(|e| e.to_string());
        Some(ProbeResult { name: "archive store", error })
    }

    pub async fn check_database(&self, deep: bool) -> Option<ProbeResult> {
        let db = self.db.as_ref()?;
        let error = db.check(deep).await.err().map(|e| e.to_string());
        Some(ProbeResult { name: "database", error })
    }

    pub async fn check(&self, deep: bool) -> HealthReport {
        let (store, db) = tokio::join!(self.check_object_store(), self.check_database(deep));
        let probes: Vec<_> = [store, db].into_iter().flatten().collect();
        for probe in probes.iter().filter(|p| !p.is_ok()) {
            tracing::warn!(dependency = probe.name, error = probe.error.as_deref().unwrap_or_default(), "health check failed");
        }
        HealthReport { probes }
    }
}
