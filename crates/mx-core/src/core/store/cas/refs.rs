//! Reference ledger: consumer → content-hash bookkeeping.
//!
//! The ledger is the sole input to garbage collection. A write failure here
//! is fatal for callers: proceeding to mutate profile or manifest state
//! without a durable reference record opens a window where content is
//! reachable but unprotected.

use super::*;

impl ContentAddressableStore {
    /// Merge `hashes` into the consumer's reference set. Idempotent and
    /// additive; tracking does not require the objects to exist yet.
    pub fn track(&self, consumer: &ConsumerId, hashes: &BTreeSet<String>) -> Result<()> {
        let mut normalized = Vec::with_capacity(hashes.len());
        for hash in hashes {
            normalized.push(normalize_hash(hash)?);
        }
        self.ensure_layout()
            .map_err(|err| StoreError::TrackingFailure(format!("{err:#}")))?;
        self.with_immediate_tx(|tx| {
            for hash in &normalized {
                tx.execute(
                    "INSERT OR IGNORE INTO refs(consumer_kind, consumer_id, hash) \
                     VALUES (?1, ?2, ?3)",
                    params![consumer.kind.as_str(), consumer.id, hash],
                )?;
            }
            Ok(())
        })
        .map_err(|err| StoreError::TrackingFailure(format!("{err:#}")))?;
        debug!(consumer = %consumer, count = normalized.len(), "cas refs tracked");
        Ok(())
    }

    /// Delete the consumer's entire reference set in one step. Idempotent;
    /// returns the number of rows removed (0 when the consumer was absent).
    pub fn untrack(&self, consumer: &ConsumerId) -> Result<u64> {
        self.ensure_layout()?;
        let removed = self.with_immediate_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM refs WHERE consumer_kind = ?1 AND consumer_id = ?2",
                params![consumer.kind.as_str(), consumer.id],
            )?;
            Ok(removed as u64)
        })?;
        debug!(consumer = %consumer, removed, "cas refs untracked");
        Ok(removed)
    }

    /// Full ledger snapshot: the live-hash union plus the per-consumer
    /// breakdown it was computed from.
    pub fn ledger_audit(&self) -> Result<LedgerAudit> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT consumer_kind, consumer_id, hash FROM refs \
             ORDER BY consumer_kind, consumer_id, hash",
        )?;
        let mut rows = stmt.query([])?;
        let mut by_consumer: BTreeMap<ConsumerId, BTreeSet<String>> = BTreeMap::new();
        let mut live = BTreeSet::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let id: String = row.get(1)?;
            let hash: String = row.get(2)?;
            let consumer = ConsumerId {
                kind: ConsumerKind::try_from(kind.as_str())?,
                id,
            };
            live.insert(hash.clone());
            by_consumer.entry(consumer).or_default().insert(hash);
        }
        Ok(LedgerAudit {
            live,
            consumers: by_consumer
                .into_iter()
                .map(|(consumer, hashes)| ConsumerRefs { consumer, hashes })
                .collect(),
        })
    }

    /// List all consumers referencing a given hash.
    pub fn refs_for(&self, hash: &str) -> Result<Vec<ConsumerId>> {
        let hash = normalize_hash(hash)?;
        self.ensure_layout()?;
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT consumer_kind, consumer_id FROM refs WHERE hash = ?1")?;
        let mut rows = stmt.query(params![hash])?;
        let mut consumers = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let id: String = row.get(1)?;
            consumers.push(ConsumerId {
                kind: ConsumerKind::try_from(kind.as_str())?,
                id,
            });
        }
        Ok(consumers)
    }
}
