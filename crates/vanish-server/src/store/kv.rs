use std::path::Path;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::backend::Backend;

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Records kept in a single redb database file.
///
/// `take` removes inside one write transaction, so it is atomic. redb allows a
/// single writer at a time, so every `put` and `take` queues behind that one
/// lock, even for unrelated tokens. Each transaction touches one key and
/// commits immediately, so the lock is never held across requests. Use
/// [`super::FileBackend`] where unrelated tokens must not contend.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("open redb database {}", path.display()))?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl Backend for RedbBackend {
    fn put(&self, token: &str, record: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(token)?.is_some() {
                anyhow::bail!("token already exists");
            }
            table.insert(token, record)?;
        }
        write_txn.commit().context("commit record")?;
        debug!(token = %super::token::hint(token), "stored record");
        Ok(())
    }

    fn take(&self, token: &str) -> Result<Option<Vec<u8>>> {
        let write_txn = self.db.begin_write()?;
        let taken = {
            let mut table = write_txn.open_table(SECRETS)?;
            // Copy out before the guard's borrow of `table` ends.
            let taken = table.remove(token)?.map(|guard| guard.value().to_vec());
            taken
        };
        write_txn.commit().context("commit take")?;
        Ok(taken)
    }

    fn peek(&self, token: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let bytes = table.get(token)?.map(|guard| guard.value().to_vec());
        Ok(bytes)
    }

    fn tokens(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;

        let mut tokens = Vec::new();
        for item in table.iter()? {
            let (k, _v) = item?;
            tokens.push(k.value().to_owned());
        }
        Ok(tokens)
    }
}
