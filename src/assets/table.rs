use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::assets::AssetRecord;

struct StoredAsset {
    record: AssetRecord,
    refs: AtomicU32,
}

impl StoredAsset {
    fn snapshot(&self) -> AssetRecord {
        AssetRecord { ref_count: self.refs.load(Ordering::SeqCst), ..self.record.clone() }
    }
}

/// Content-addressed asset records shared by every download of a job.
///
/// Lookups never wait on downloads: the locks only guard the maps, and
/// reference counts are atomic. Code holding both maps locks `by_url`
/// before `by_hash`.
#[derive(Default)]
pub struct AssetTable {
    /// content hash -> stored asset
    by_hash: RwLock<HashMap<String, Arc<StoredAsset>>>,

    /// asset URL -> content hash
    by_url: RwLock<HashMap<String, String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AssetTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn stored_for_url(&self, url: &str) -> Option<Arc<StoredAsset>> {
        let hash = read(&self.by_url).get(url)?.clone();
        read(&self.by_hash).get(&hash).cloned()
    }

    /// Record already holding the content served at `url`
    pub fn lookup_url(&self, url: &str) -> Option<AssetRecord> {
        self.stored_for_url(url).map(|stored| stored.snapshot())
    }

    pub fn lookup_hash(&self, hash: &str) -> Option<AssetRecord> {
        read(&self.by_hash).get(hash).map(|stored| stored.snapshot())
    }

    /// Mirror path of the content served at `url`
    pub fn local_path(&self, url: &str) -> Option<String> {
        self.stored_for_url(url).map(|stored| stored.record.local_path.clone())
    }

    /// Count one more reference to the content at `url`; `None` if unknown.
    ///
    /// When a record of a previous run gains its first reference, the asset
    /// keys it points at are returned so they can be referenced in turn.
    pub fn add_reference(&self, url: &str) -> Option<Vec<String>> {
        let stored = self.stored_for_url(url)?;
        if stored.refs.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(stored.record.references.clone())
        } else {
            Some(Vec::new())
        }
    }

    /// Register content downloaded from `url`.
    ///
    /// If the hash is already stored the existing record gains a reference
    /// and `url` becomes an alias of it. Returns the record in effect and
    /// whether it was new.
    pub fn insert_or_ref(&self, url: &str, record: AssetRecord) -> (AssetRecord, bool) {
        let hash = record.content_hash.clone();

        let (stored, inserted) = {
            let mut by_hash = write(&self.by_hash);
            match by_hash.get(&hash) {
                Some(stored) => {
                    stored.refs.fetch_add(1, Ordering::SeqCst);
                    (Arc::clone(stored), false)
                }
                None => {
                    let stored = Arc::new(StoredAsset { record, refs: AtomicU32::new(1) });
                    by_hash.insert(hash.clone(), Arc::clone(&stored));
                    (stored, true)
                }
            }
        };

        write(&self.by_url).insert(url.to_string(), hash);
        (stored.snapshot(), inserted)
    }

    /// Load records saved by a checkpoint, keeping their reference counts
    pub fn restore(&self, records: Vec<AssetRecord>) {
        self.load(records, true);
    }

    /// Load records of a previous run as known files with no references yet.
    ///
    /// Content the table already holds is left untouched.
    /// Pages of the new run add their references as they are processed;
    /// records nobody references again are left out of `records`.
    pub fn rehydrate(&self, records: Vec<AssetRecord>) {
        self.load(records, false);
    }

    fn load(&self, records: Vec<AssetRecord>, keep_counts: bool) {
        let mut by_url = write(&self.by_url);
        let mut by_hash = write(&self.by_hash);

        for record in records {
            let hash = record.content_hash.clone();
            // Records of this run take precedence over a previous run's
            if !keep_counts && by_hash.contains_key(&hash) {
                continue;
            }

            by_url.insert(record.source_url.clone(), hash.clone());
            for alias in &record.aliases {
                by_url.insert(alias.clone(), hash.clone());
            }

            let refs = if keep_counts { record.ref_count } else { 0 };
            let record = AssetRecord { aliases: Vec::new(), ..record };
            by_hash.insert(hash, Arc::new(StoredAsset { record, refs: AtomicU32::new(refs) }));
        }
    }

    /// Referenced records, ordered by mirror path
    pub fn records(&self) -> Vec<AssetRecord> {
        let by_url = read(&self.by_url);
        let mut aliases: HashMap<&str, Vec<String>> = HashMap::new();
        for (url, hash) in by_url.iter() {
            aliases.entry(hash.as_str()).or_default().push(url.clone());
        }

        let mut records: Vec<AssetRecord> = read(&self.by_hash)
            .values()
            .map(|stored| stored.snapshot())
            .filter(|record| record.ref_count > 0)
            .map(|mut record| {
                let mut urls = aliases.remove(record.content_hash.as_str()).unwrap_or_default();
                urls.retain(|url| *url != record.source_url);
                urls.sort();
                record.aliases = urls;
                record
            })
            .collect();

        records.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        records
    }

    /// Distinct referenced assets
    pub fn len(&self) -> usize {
        read(&self.by_hash).values().filter(|s| s.refs.load(Ordering::SeqCst) > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, hash: &str) -> AssetRecord {
        AssetRecord {
            source_url: url.to_string(),
            content_hash: hash.to_string(),
            stored_hash: hash.to_string(),
            byte_size: 3,
            local_path: format!("assets/images/{}.png", hash),
            optimized: false,
            ref_count: 1,
            content_type: None,
            aliases: Vec::new(),
            references: Vec::new(),
        }
    }

    #[test]
    fn test_identical_content_collapses_to_one_record() {
        let table = AssetTable::new();
        let (_, first) = table.insert_or_ref("https://a.com/logo.png", record("https://a.com/logo.png", "h1"));
        let (shared, second) = table.insert_or_ref("https://cdn.a.com/logo.png", record("https://cdn.a.com/logo.png", "h1"));

        assert!(first);
        assert!(!second);
        assert_eq!(shared.source_url, "https://a.com/logo.png");
        assert_eq!(shared.ref_count, 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.local_path("https://cdn.a.com/logo.png").unwrap(), "assets/images/h1.png");

        let records = table.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].aliases, vec!["https://cdn.a.com/logo.png".to_string()]);
    }

    #[test]
    fn test_add_reference_by_url() {
        let table = AssetTable::new();
        assert!(table.add_reference("https://a.com/x.css").is_none());

        table.insert_or_ref("https://a.com/x.css", record("https://a.com/x.css", "h2"));
        assert_eq!(table.add_reference("https://a.com/x.css"), Some(Vec::new()));
        assert_eq!(table.lookup_url("https://a.com/x.css").unwrap().ref_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_references_are_counted_exactly() {
        let table = Arc::new(AssetTable::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let url = format!("https://a.com/copy-{}.png", i % 4);
                table.insert_or_ref(&url, record(&url, "same"));
                table.add_reference(&url);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup_hash("same").unwrap().ref_count, 64);
    }

    #[test]
    fn test_loading_while_listing_records_completes() {
        let table = Arc::new(AssetTable::new());
        table.insert_or_ref("https://a.com/live.png", record("https://a.com/live.png", "live"));

        let loader = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for i in 0..500 {
                    let url = format!("https://a.com/old-{}.png", i);
                    table.restore(vec![record(&url, &format!("old{}", i))]);
                }
            })
        };
        let lister = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    assert!(!table.records().is_empty());
                }
            })
        };
        loader.join().unwrap();
        lister.join().unwrap();

        assert_eq!(table.len(), 501);
    }

    #[test]
    fn test_rehydrated_records_need_new_references() {
        let table = AssetTable::new();
        let mut old = record("https://a.com/a.png", "h3");
        old.ref_count = 5;
        old.aliases = vec!["https://a.com/b.png".to_string()];
        old.references = vec!["https://a.com/bg.png".to_string()];
        table.rehydrate(vec![old.clone(), record("https://a.com/gone.png", "h4")]);

        assert!(table.records().is_empty());
        assert_eq!(table.add_reference("https://a.com/b.png"), Some(vec!["https://a.com/bg.png".to_string()]));
        assert_eq!(table.add_reference("https://a.com/a.png"), Some(Vec::new()));

        let records = table.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ref_count, 2);
        assert_eq!(records[0].aliases, vec!["https://a.com/b.png".to_string()]);

        let resumed = AssetTable::new();
        resumed.restore(vec![old]);
        assert_eq!(resumed.lookup_url("https://a.com/a.png").unwrap().ref_count, 5);
    }
}
