use super::*;

impl ContentAddressableStore {
    /// Perform a mark-and-sweep GC. Objects without any ledger reference and
    /// older than the grace window are deleted from disk and the index.
    ///
    /// `force` bypasses the age heuristic only; the reference check is
    /// re-run inside each delete transaction, so a reference that lands
    /// mid-sweep always wins.
    pub fn collect(&self, grace: Duration, force: bool) -> Result<GcSummary> {
        self.ensure_layout()?;
        self.ensure_index_health(true).map_err(|err| {
            warn!(%err, "skipping cas gc because index is unhealthy");
            err
        })?;
        let mut conn = self.connection()?;
        let live = self.live_set(&conn)?;
        let cutoff = if force {
            u64::MAX
        } else {
            timestamp_secs().saturating_sub(grace.as_secs())
        };
        let mut summary = GcSummary::default();

        let mut stmt = conn.prepare("SELECT hash, size, created_at FROM objects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        drop(stmt);

        for (hash, size, created_at) in rows {
            summary.scanned += 1;

            if live.contains(&hash) || created_at > cutoff {
                continue;
            }

            let Some(_lock) = self.try_lock_for_gc(&hash)? else {
                // Another process is using the object; skip it for now.
                continue;
            };

            if self.delete_if_unreferenced(&mut conn, &hash)? {
                summary.reclaimed += 1;
                summary.reclaimed_bytes += size;
            }
        }

        let (orphans, orphan_bytes) = self.sweep_orphaned_objects(&conn, &live, cutoff)?;
        summary.reclaimed += orphans;
        summary.reclaimed_bytes += orphan_bytes;
        summary.scanned += orphans;

        debug!(
            scanned = summary.scanned,
            reclaimed = summary.reclaimed,
            reclaimed_bytes = summary.reclaimed_bytes,
            "cas gc sweep complete"
        );

        Ok(summary)
    }

    /// Delete on-disk blobs that have no index row. Blobs still named by the
    /// ledger are re-indexed instead of deleted.
    fn sweep_orphaned_objects(
        &self,
        conn: &Connection,
        live: &HashSet<String>,
        cutoff: u64,
    ) -> Result<(usize, u64)> {
        let objects_root = self.root.join(OBJECTS_DIR);
        if !objects_root.exists() {
            return Ok((0, 0));
        }
        let mut reclaimed = 0usize;
        let mut reclaimed_bytes = 0u64;
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
            let path = entry.path().to_path_buf();
            let Some(hash) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.object_info_with_conn(conn, hash)?.is_some() {
                continue;
            }
            if live.contains(hash) {
                // Referenced but unindexed; restore the row rather than sweep.
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let now = timestamp_secs();
                let _ = conn.execute(
                    "INSERT OR IGNORE INTO objects(hash, size, created_at, last_accessed) \
                     VALUES (?1, ?2, ?3, ?3)",
                    params![hash, size as i64, now as i64],
                );
                continue;
            }
            let modified = file_modified_secs(&path).unwrap_or(0);
            if modified > cutoff {
                continue;
            }
            let Some(_lock) = self.try_lock_for_gc(hash)? else {
                continue;
            };
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let _ = fs::remove_file(&path);
            if let Some(parent) = path.parent() {
                fsync_dir(parent).ok();
            }
            reclaimed += 1;
            reclaimed_bytes = reclaimed_bytes.saturating_add(size);
        }
        Ok((reclaimed, reclaimed_bytes))
    }

    fn live_set(&self, conn: &Connection) -> Result<HashSet<String>> {
        let mut stmt = conn.prepare("SELECT DISTINCT hash FROM refs")?;
        let mut rows = stmt.query([])?;
        let mut set = HashSet::new();
        while let Some(row) = rows.next()? {
            let hash: String = row.get(0)?;
            set.insert(hash);
        }
        Ok(set)
    }

    fn delete_if_unreferenced(&self, conn: &mut Connection, hash: &str) -> Result<bool> {
        // Remove the index row only if no refs exist at deletion time to
        // avoid racing with concurrent tracking.
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM objects \
             WHERE hash = ?1 \
             AND NOT EXISTS (SELECT 1 FROM refs WHERE refs.hash = ?1)",
            params![hash],
        )?;
        tx.commit()?;

        if deleted == 0 {
            return Ok(false);
        }

        let path = self.object_path(hash);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete CAS object {}", path.display()))?;
            if let Some(parent) = path.parent() {
                fsync_dir(parent).ok();
            }
        }

        // Clean up stale partial files to avoid future collisions.
        let tmp = self.tmp_path(hash);
        if tmp.exists() {
            let _ = fs::remove_file(tmp);
        }
        Ok(true)
    }

    pub(super) fn try_lock_for_gc(&self, hash: &str) -> Result<Option<File>> {
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
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
