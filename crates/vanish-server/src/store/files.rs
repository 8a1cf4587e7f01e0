use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::backend::Backend;

const RECORD_EXT: &str = "rec";
const STAGING_TAG: &str = "tmp";
const CLAIM_TAG: &str = "claim";

/// One file per token, `<token>.rec`, inside a private directory.
///
/// Publishing writes a scratch file, fsyncs it, then hard-links it to the final
/// name; `link` fails if the name exists, so a record is never overwritten or
/// seen half-written. Taking renames the record to a unique claim name before
/// reading it. `rename` is atomic, so only one of several concurrent takers can
/// move a given file; the rest see `NotFound`. Nothing is shared between
/// tokens, so unrelated requests never wait on each other.
///
/// A crash between those steps can strand a `<token>.tmp-*` or
/// `<token>.claim-*` file; [`Backend::purge_scratch`] deletes them.
///
/// Callers must only pass well-formed tokens (see [`super::token::is_well_formed`]);
/// the token becomes part of a file name.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir` for record files, creating it (mode `0700` on unix) if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("restrict permissions on {}", dir.display()))?;
        }
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    fn record_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{token}.{RECORD_EXT}"))
    }

    fn scratch_path(&self, token: &str, tag: &str) -> PathBuf {
        self.dir
            .join(format!("{token}.{tag}-{:016x}", rand::random::<u64>()))
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<()> {
        fs::File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("sync {}", self.dir.display()))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<()> {
        Ok(())
    }
}

impl Backend for FileBackend {
    fn put(&self, token: &str, record: &[u8]) -> Result<()> {
        let staged = self.scratch_path(token, STAGING_TAG);
        let target = self.record_path(token);

        let published = write_synced(&staged, record)
            .with_context(|| format!("write {}", staged.display()))
            .and_then(|()| {
                fs::hard_link(&staged, &target)
                    .with_context(|| format!("publish {}", target.display()))
            });

        if let Err(e) = fs::remove_file(&staged) {
            if e.kind() != ErrorKind::NotFound {
                warn!(error = %e, path = %staged.display(), "failed to remove staging file");
            }
        }
        published?;
        self.sync_dir()?;

        debug!(token = %super::token::hint(token), "stored record");
        Ok(())
    }

    fn take(&self, token: &str) -> Result<Option<Vec<u8>>> {
        let source = self.record_path(token);
        let claim = self.scratch_path(token, CLAIM_TAG);

        match fs::rename(&source, &claim) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("claim {}", source.display()));
            }
        }

        // The record is already unreachable under its token; whatever happens
        // below, it is gone.
        let bytes = fs::read(&claim).with_context(|| format!("read {}", claim.display()));
        if let Err(e) = fs::remove_file(&claim) {
            warn!(error = %e, path = %claim.display(), "failed to remove claimed record");
        }
        bytes.map(Some)
    }

    fn peek(&self, token: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(token);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    fn tokens(&self) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("list {}", self.dir.display()))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(token) = name.strip_suffix(RECORD_EXT).and_then(|t| t.strip_suffix('.')) {
                tokens.push(token.to_owned());
            }
        }
        Ok(tokens)
    }

    fn purge_scratch(&self, older_than: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut purged = 0usize;
        for entry in fs::read_dir(&self.dir).with_context(|| format!("list {}", self.dir.display()))? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_str().is_some_and(is_scratch_name) {
                continue;
            }
            let Some(changed) = entry.metadata().ok().and_then(|m| last_change(&m)) else {
                continue;
            };
            if now.duration_since(changed).unwrap_or_default() < older_than {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(error = %e, path = %entry.path().display(), "failed to remove scratch file");
                }
            }
        }
        Ok(purged)
    }
}

/// `<token>.tmp-<hex>` or `<token>.claim-<hex>`. Tokens never contain a dot.
fn is_scratch_name(name: &str) -> bool {
    name.split_once('.').is_some_and(|(_, rest)| {
        rest.split_once('-')
            .is_some_and(|(tag, _)| tag == STAGING_TAG || tag == CLAIM_TAG)
    })
}

/// Inode change time on unix: `rename` and `link` bump it, while a freshly
/// claimed record keeps the mtime of its original put.
#[cfg(unix)]
fn last_change(meta: &fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn last_change(meta: &fs::Metadata) -> Option<SystemTime> {
    meta.modified().ok()
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
