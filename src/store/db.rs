//! Sled backed run record storage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sled::{Config as SledConfig, Db, IVec, Tree};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH, ERR_DECODE_RUN_RECORD};
use crate::models::{ProgramRunId, RunRecord, RunStatus};
use crate::store::RunRecordStore;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/hadron-flow/data";
/// The DB tree used for run records.
const TREE_RUN_RECORDS: &str = "run_records";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// A run record store backed by a sled database.
#[derive(Clone)]
pub struct SledRunRecordStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    /// The underlying DB handle.
    _db: Db,
    /// The tree holding run records keyed by program run ID.
    tree: Tree,
}

impl SledRunRecordStore {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for hadron flow database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).open().context("error opening database")?;
            let tree = db.open_tree(TREE_RUN_RECORDS).context("error opening run records tree")?;
            Ok(Self {
                inner: Arc::new(StoreInner { _db: db, tree }),
            })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    fn record_key(run: &ProgramRunId) -> IVec {
        IVec::from(run.to_string().as_bytes())
    }

    /// Write the given record.
    async fn put(&self, record: RunRecord) -> Result<()> {
        let (tree, key) = (self.inner.tree.clone(), Self::record_key(&record.run));
        let val = serde_json::to_vec(&record).context("error encoding run record")?;
        Self::spawn_blocking(move || -> Result<()> {
            tree.insert(key, val).context("error writing run record")?;
            Ok(())
        })
        .await??;
        self.inner.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }

    /// Apply the given mutation to an existing run record.
    async fn update<F>(&self, run: &ProgramRunId, f: F) -> Result<()>
    where
        F: FnOnce(&mut RunRecord) + Send,
    {
        let mut record = self.get(run).await?.with_context(|| format!("no run record found for {}", run))?;
        f(&mut record);
        self.put(record).await
    }
}

#[async_trait]
impl RunRecordStore for SledRunRecordStore {
    #[tracing::instrument(level = "debug", skip(self, system_args, user_args))]
    async fn set_start(
        &self, run: &ProgramRunId, start_secs: i64, system_args: &BTreeMap<String, String>, user_args: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.put(RunRecord {
            run: run.clone(),
            start_secs,
            stop_secs: None,
            status: RunStatus::Running,
            failure: None,
            system_args: system_args.clone(),
            user_args: user_args.clone(),
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_stop(&self, run: &ProgramRunId, stop_secs: i64, status: RunStatus, failure: Option<&str>) -> Result<()> {
        let failure = failure.map(String::from);
        self.update(run, move |record| {
            record.stop_secs = Some(stop_secs);
            record.status = status;
            record.failure = failure;
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_suspend(&self, run: &ProgramRunId) -> Result<()> {
        self.update(run, |record| record.status = RunStatus::Suspended).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_resume(&self, run: &ProgramRunId) -> Result<()> {
        self.update(run, |record| record.status = RunStatus::Running).await
    }

    async fn get(&self, run: &ProgramRunId) -> Result<Option<RunRecord>> {
        let (tree, key) = (self.inner.tree.clone(), Self::record_key(run));
        let val = Self::spawn_blocking(move || tree.get(key).context("error reading run record")).await??;
        val.map(|val| serde_json::from_slice(&val).context(ERR_DECODE_RUN_RECORD)).transpose()
    }
}
