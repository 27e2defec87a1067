// Core object-store operations (kept out of mod.rs for readability).
use super::*;

impl ContentAddressableStore {
    /// Initialize a store at the provided root, or the default `~/.mx/store`
    /// when `None` is supplied.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or the index schema
    /// cannot be initialized.
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(path) => path,
            None => default_root()?,
        };
        let store = Self {
            root,
            health: Arc::default(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the content address for a blob.
    #[must_use]
    pub fn compute_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Store a blob, returning its content address. Existing objects are
    /// verified rather than rewritten.
    pub fn insert_bytes(&self, bytes: &[u8]) -> Result<StoredObject> {
        self.ensure_layout()?;
        let hash = Self::compute_hash(bytes);
        let _lock = self.acquire_lock(&hash)?;
        let tmp = self.tmp_path(&hash);
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
        let object_path = self.object_path(&hash);

        if object_path.exists() {
            self.verify_existing(&hash, &object_path)?;
            self.ensure_index_entry(&hash, bytes.len() as u64)?;
            debug!(%hash, "cas hit");
            return Ok(StoredObject {
                hash,
                path: object_path,
                size: bytes.len() as u64,
            });
        }

        self.write_new_object(&hash, bytes, &object_path)
            .map_err(store_write_error)?;
        self.ensure_index_entry(&hash, bytes.len() as u64)
            .map_err(store_write_error)?;
        debug!(%hash, size = bytes.len(), "cas store");
        Ok(StoredObject {
            hash,
            path: object_path,
            size: bytes.len() as u64,
        })
    }

    /// Ingest a file from disk into the store.
    pub fn insert_file(&self, source: &Path) -> Result<StoredObject> {
        let bytes = fs::read(source)
            .with_context(|| format!("failed to read {} for CAS ingest", source.display()))?;
        self.insert_bytes(&bytes)
    }

    /// Whether an object with this hash is present and intact.
    pub fn contains(&self, hash: &str) -> Result<bool> {
        let hash = normalize_hash(hash)?;
        let path = self.object_path(&hash);
        if !path.exists() {
            return Ok(false);
        }
        Ok(self.verify_existing(&hash, &path).is_ok())
    }

    /// Read an object's bytes, verifying the digest.
    pub fn read_object(&self, hash: &str) -> Result<Vec<u8>> {
        let hash = normalize_hash(hash)?;
        let path = self.object_path(&hash);
        if !path.exists() {
            return Err(StoreError::MissingObject { hash }.into());
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read CAS object at {}", path.display()))?;
        self.verify_bytes(&hash, &bytes)?;
        Ok(bytes)
    }

    /// Return metadata about an object if present, repairing a missing index
    /// row from disk.
    pub fn object_info(&self, hash: &str) -> Result<Option<ObjectInfo>> {
        let hash = normalize_hash(hash)?;
        self.ensure_layout()?;
        let mut conn = self.connection()?;
        if let Some(info) = self.object_info_with_conn(&conn, &hash)? {
            return Ok(Some(info));
        }
        self.repair_object_index_from_disk(&mut conn, &hash)
    }

    /// List all indexed object hashes, optionally filtered by prefix.
    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let mut results = Vec::new();
        match prefix {
            Some(prefix) => {
                let mut stmt =
                    conn.prepare("SELECT hash FROM objects WHERE hash LIKE ?1 ORDER BY hash ASC")?;
                let mut rows = stmt.query(params![format!("{prefix}%")])?;
                while let Some(row) = rows.next()? {
                    results.push(row.get::<_, String>(0)?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT hash FROM objects ORDER BY hash ASC")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    results.push(row.get::<_, String>(0)?);
                }
            }
        }
        Ok(results)
    }

    pub(super) fn ensure_layout(&self) -> Result<()> {
        for dir in [OBJECTS_DIR, LOCKS_DIR, TMP_DIR] {
            fs::create_dir_all(self.root.join(dir)).with_context(|| {
                format!(
                    "failed to ensure CAS directory {}",
                    self.root.join(dir).display()
                )
            })?;
        }
        self.ensure_index_health(false)?;
        let mut conn = self.connection_raw()?;
        self.init_schema(&conn)?;
        self.ensure_meta(&mut conn)?;
        Ok(())
    }

    pub(super) fn connection(&self) -> Result<Connection> {
        let conn = self.connection_raw()?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for CAS index")?;
        Ok(conn)
    }

    pub(super) fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start CAS index transaction")?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn connection_raw(&self) -> Result<Connection> {
        let path = self.index_path();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open CAS index at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for CAS index")?;
        Ok(conn)
    }

    fn init_schema(&self, conn: &Connection) -> Result<()> {
        // The refs table carries no foreign key: the ledger is pure
        // bookkeeping and may name hashes whose acquisition is still in
        // flight.
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS objects (
                hash TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS refs (
                consumer_kind TEXT NOT NULL,
                consumer_id TEXT NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY(consumer_kind, consumer_id, hash)
            );
            "#,
        )
        .context("failed to initialize CAS index schema")?;
        Ok(())
    }

    fn ensure_meta(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start CAS meta transaction")?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_CAS_FORMAT_VERSION, CAS_FORMAT_VERSION.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_CREATED_BY, MX_VERSION],
        )?;
        tx.commit()?;

        self.enforce_meta_version(conn, META_KEY_CAS_FORMAT_VERSION, CAS_FORMAT_VERSION)?;
        self.enforce_meta_version(conn, META_KEY_SCHEMA_VERSION, SCHEMA_VERSION)?;
        Ok(())
    }

    fn enforce_meta_version(&self, conn: &Connection, key: &str, expected: u32) -> Result<()> {
        let found: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match found {
            None => Err(StoreError::MissingMeta(key.to_string()).into()),
            Some(value) if value == expected.to_string() => Ok(()),
            Some(value) => Err(StoreError::IncompatibleFormat {
                key: key.to_string(),
                expected: expected.to_string(),
                found: value,
            }
            .into()),
        }
    }

    pub(super) fn ensure_index_health(&self, force_integrity: bool) -> Result<()> {
        let already_validated = self.health.index_validated.load(Ordering::SeqCst);
        let index_missing = !self.index_path().exists();
        if !force_integrity && already_validated && !index_missing {
            return Ok(());
        }
        if index_missing {
            // Fresh store; ensure_layout creates the schema next.
            self.health.index_validated.store(true, Ordering::SeqCst);
            return Ok(());
        }

        match self.validate_index() {
            Ok(()) => {
                self.health.index_validated.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                if matches!(
                    err.downcast_ref::<StoreError>(),
                    Some(StoreError::MissingMeta(_)) | Some(StoreError::IncompatibleFormat { .. })
                ) {
                    // Never auto-repair a format/schema mismatch; surface MX812
                    // so the caller can migrate or clear the store.
                    return Err(err);
                }
                debug!(
                    root = %self.root.display(),
                    error = %err,
                    "cas index unhealthy; rebuilding from store"
                );
                self.rebuild_index_from_store()?;
                self.health.index_validated.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn validate_index(&self) -> Result<()> {
        let conn = self.connection_raw()?;
        let mut stmt = conn.prepare("PRAGMA integrity_check")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let verdict: String = row.get(0)?;
            if verdict != "ok" {
                return Err(StoreError::IndexCorrupt(verdict).into());
            }
        }
        drop(rows);
        drop(stmt);

        for table in ["meta", "objects", "refs"] {
            let present: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |row| row.get(0),
                )
                .optional()?;
            if present.is_none() {
                return Err(
                    StoreError::IndexCorrupt(format!("table '{table}' is missing")).into(),
                );
            }
        }
        self.enforce_meta_version(&conn, META_KEY_CAS_FORMAT_VERSION, CAS_FORMAT_VERSION)?;
        self.enforce_meta_version(&conn, META_KEY_SCHEMA_VERSION, SCHEMA_VERSION)?;
        Ok(())
    }

    /// Rebuild the object index from the on-disk blobs. The reference ledger
    /// cannot be reconstructed from disk; recovered objects are re-stamped
    /// with a fresh `created_at` so the grace window shields them until
    /// consumers re-track.
    fn rebuild_index_from_store(&self) -> Result<()> {
        let index = self.index_path();
        if index.exists() {
            fs::remove_file(&index)
                .with_context(|| format!("failed to remove corrupt index {}", index.display()))?;
        }
        let mut conn = self.connection_raw()?;
        self.init_schema(&conn)?;
        self.ensure_meta(&mut conn)?;

        let objects_root = self.root.join(OBJECTS_DIR);
        if !objects_root.exists() {
            return Ok(());
        }
        let now = timestamp_secs();
        let mut recovered = 0usize;
        for entry in walkdir::WalkDir::new(&objects_root)
            .min_depth(2)
            .max_depth(2)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(hash) = entry.path().file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if normalize_hash(hash).is_err() {
                continue;
            }
            let size = fs::metadata(entry.path()).map(|m| m.len()).unwrap_or(0);
            conn.execute(
                "INSERT OR IGNORE INTO objects(hash, size, created_at, last_accessed) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![hash, size as i64, now as i64],
            )?;
            recovered += 1;
        }
        warn!(
            recovered,
            root = %self.root.display(),
            "cas index rebuilt from disk; reference ledger reset"
        );
        Ok(())
    }

    fn repair_object_index_from_disk(
        &self,
        conn: &mut Connection,
        hash: &str,
    ) -> Result<Option<ObjectInfo>> {
        let path = self.object_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        self.verify_existing(hash, &path)?;
        let size = fs::metadata(&path)
            .with_context(|| format!("failed to stat CAS object at {}", path.display()))?
            .len();
        let created_at = file_modified_secs(&path).unwrap_or_else(timestamp_secs);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start CAS index repair transaction")?;
        tx.execute(
            "INSERT OR IGNORE INTO objects(hash, size, created_at, last_accessed) \
             VALUES (?1, ?2, ?3, ?3)",
            params![hash, size as i64, created_at as i64],
        )?;
        tx.commit()?;
        Ok(Some(ObjectInfo {
            hash: hash.to_string(),
            size,
            created_at,
            last_accessed: created_at,
        }))
    }

    pub(super) fn ensure_index_entry(&self, hash: &str, size: u64) -> Result<()> {
        let now = timestamp_secs();
        self.with_immediate_tx(|tx| {
            let updated = tx.execute(
                "UPDATE objects SET last_accessed = ?2 WHERE hash = ?1",
                params![hash, now as i64],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO objects(hash, size, created_at, last_accessed) \
                     VALUES (?1, ?2, ?3, ?3)",
                    params![hash, size as i64, now as i64],
                )?;
            }
            Ok(())
        })
    }

    pub(super) fn object_info_with_conn(
        &self,
        conn: &Connection,
        hash: &str,
    ) -> Result<Option<ObjectInfo>> {
        let info = conn
            .query_row(
                "SELECT size, created_at, last_accessed FROM objects WHERE hash = ?1",
                params![hash],
                |row| {
                    Ok(ObjectInfo {
                        hash: hash.to_string(),
                        size: row.get::<_, i64>(0)? as u64,
                        created_at: row.get::<_, i64>(1)? as u64,
                        last_accessed: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    pub(super) fn verify_existing(&self, hash: &str, path: &Path) -> Result<()> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read CAS object at {}", path.display()))?;
        self.verify_bytes(hash, &bytes)
    }

    pub(super) fn verify_bytes(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let actual = Self::compute_hash(bytes);
        if actual != hash {
            return Err(StoreError::DigestMismatch {
                hash: hash.to_string(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    fn write_new_object(&self, hash: &str, bytes: &[u8], dest: &Path) -> Result<()> {
        let tmp = self.tmp_path(hash);
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write CAS object to {}", tmp.display()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&tmp, dest)
            .with_context(|| format!("failed to move CAS object into {}", dest.display()))?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }
        Ok(())
    }

    pub(crate) fn acquire_lock(&self, hash: &str) -> Result<File> {
        let path = self.lock_path(hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock CAS object {hash}"))?;
        Ok(file)
    }

    #[must_use]
    pub fn object_path(&self, hash: &str) -> PathBuf {
        let shard = &hash[..hash.len().min(2)];
        self.root.join(OBJECTS_DIR).join(shard).join(hash)
    }

    pub(super) fn lock_path(&self, hash: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{hash}.lock"))
    }

    pub(super) fn tmp_path(&self, hash: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(format!("{hash}.partial"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }
}
