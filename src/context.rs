use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::args::BaseArgs;
use crate::auth::{AccountProvider, StaticAccount};
use crate::autosave::{AutosaveConfig, SnapshotWriter};
use crate::codec::{Compression, SnapshotCodec};
use crate::config::{self, Config};
use crate::reconcile::{FsLocalStore, ObjectRecordStore, SyncReconciler};
use crate::rolling::RollingSnapshotStore;
use crate::storage::{bucket_url, store_from_url, ObjectStore};

pub const SNAPSHOT_BUCKET: &str = "snapshots";
pub const RECORD_BUCKET: &str = "records";

struct RemoteStores {
    snapshots: Arc<dyn ObjectStore>,
    records: Arc<dyn ObjectStore>,
}

/// Everything a command needs, resolved once from flags, environment and
/// config files.
pub struct AppContext {
    pub json: bool,
    pub account: Arc<StaticAccount>,
    pub local: Arc<FsLocalStore>,
    pub codec: SnapshotCodec,
    pub autosave: AutosaveConfig,
    remote: Option<RemoteStores>,
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("stitch"))
        .ok_or_else(|| anyhow!("could not determine a data directory; pass --data-dir"))
}

impl AppContext {
    pub fn from_base(base: &BaseArgs) -> Result<Self> {
        let cfg = config::load()?;
        Self::resolve(base, &cfg)
    }

    fn resolve(base: &BaseArgs, cfg: &Config) -> Result<Self> {
        let data_dir = match (&base.data_dir, &cfg.data_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => PathBuf::from(dir),
            (None, None) => default_data_dir()?,
        };
        let compression = match &cfg.compression {
            Some(value) => Compression::from_config(value).context("invalid compression setting")?,
            None => Compression::default(),
        };
        let token = base.token.clone().or_else(|| cfg.token.clone());
        let remote = match base.remote_url.clone().or_else(|| cfg.remote_url.clone()) {
            Some(url) => Some(RemoteStores {
                snapshots: store_from_url(&bucket_url(&url, SNAPSHOT_BUCKET), token.as_deref())
                    .with_context(|| format!("invalid remote_url {url}"))?,
                records: store_from_url(&bucket_url(&url, RECORD_BUCKET), token.as_deref())
                    .with_context(|| format!("invalid remote_url {url}"))?,
            }),
            None => None,
        };

        let local = Arc::new(FsLocalStore::new(data_dir));
        let codec = SnapshotCodec::new(compression);
        debug!(
            data_dir = %local.root().display(),
            compression = ?codec.compression(),
            remote = remote.is_some(),
            "resolved context"
        );

        Ok(Self {
            json: base.json,
            account: Arc::new(StaticAccount::new(
                base.account.clone().or_else(|| cfg.account.clone()),
            )),
            local,
            codec,
            autosave: AutosaveConfig::from_overrides(&cfg.autosave),
            remote,
        })
    }

    pub fn account_id(&self) -> Option<String> {
        self.account.current_account_id()
    }

    pub fn require_account(&self) -> Result<String> {
        self.account_id().ok_or_else(|| {
            anyhow!("no account configured. Use --account, STITCH_ACCOUNT or `stitch config set account <id>`")
        })
    }

    fn remote(&self) -> Result<&RemoteStores> {
        self.remote.as_ref().ok_or_else(|| {
            anyhow!("no remote store configured. Use --remote-url, STITCH_REMOTE_URL or `stitch config set remote_url <url>`")
        })
    }

    pub fn snapshot_store(&self) -> Result<RollingSnapshotStore> {
        Ok(RollingSnapshotStore::new(Arc::clone(&self.remote()?.snapshots)))
    }

    pub fn snapshot_writer(&self) -> Result<SnapshotWriter> {
        Ok(SnapshotWriter::new(self.codec, self.snapshot_store()?))
    }

    pub fn reconciler(&self) -> Result<SyncReconciler> {
        let records = ObjectRecordStore::new(Arc::clone(&self.remote()?.records));
        Ok(SyncReconciler::new(
            self.local.clone(),
            Arc::new(records),
            self.account.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base(data_dir: Option<PathBuf>) -> BaseArgs {
        BaseArgs {
            json: false,
            account: None,
            remote_url: None,
            token: None,
            data_dir,
            verbose: 0,
            env_file: None,
        }
    }

    #[test]
    fn flags_override_config() {
        let tmp = TempDir::new().unwrap();
        let mut args = base(Some(tmp.path().join("flag-data")));
        args.account = Some("flag-acct".into());
        let cfg = Config {
            account: Some("cfg-acct".into()),
            data_dir: Some("/cfg/data".into()),
            compression: Some("none".into()),
            ..Default::default()
        };
        let ctx = AppContext::resolve(&args, &cfg).unwrap();
        assert_eq!(ctx.account_id(), Some("flag-acct".into()));
        assert_eq!(ctx.local.root(), tmp.path().join("flag-data"));
        assert_eq!(ctx.codec.compression(), Compression::None);
    }

    #[test]
    fn missing_remote_is_reported_on_use() {
        let tmp = TempDir::new().unwrap();
        let ctx = AppContext::resolve(&base(Some(tmp.path().into())), &Config::default()).unwrap();
        assert!(ctx.snapshot_store().is_err());
        assert!(ctx.require_account().is_err());
    }

    #[test]
    fn bad_compression_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config {
            compression: Some("lz4".into()),
            ..Default::default()
        };
        assert!(AppContext::resolve(&base(Some(tmp.path().into())), &cfg).is_err());
    }
}
