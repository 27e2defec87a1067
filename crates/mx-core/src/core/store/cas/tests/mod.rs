//! CAS unit tests, split by topic.

use super::*;
use std::thread;
use tempfile::tempdir;

fn new_store() -> Result<(tempfile::TempDir, ContentAddressableStore)> {
    let temp = tempdir()?;
    let root = temp.path().join("store");
    let store = ContentAddressableStore::new(Some(root))?;
    Ok((temp, store))
}

fn set_created_at(store: &ContentAddressableStore, hash: &str, ts: i64) -> Result<()> {
    let conn = store.connection()?;
    conn.execute(
        "UPDATE objects SET created_at=?1, last_accessed=?1 WHERE hash=?2",
        params![ts, hash],
    )?;
    Ok(())
}

fn hashes_of(values: &[&StoredObject]) -> BTreeSet<String> {
    values.iter().map(|stored| stored.hash.clone()).collect()
}

mod refs;
