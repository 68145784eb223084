use crossbeam_skiplist::SkipMap;

/// The indexed location of a key's most recent value.
///
/// `value_offset` locates the value bytes inside the data file named by
/// `file_id`; `total_size` is the full record length, so the whole record
/// can be re-read and checksummed starting at
/// `value_offset - header - key length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeydirEntry {
    pub file_id: u64,
    pub total_size: u64,
    pub value_offset: u64,
    pub tstamp: u32,
    pub tombstone: bool,
}

impl KeydirEntry {
    /// Whether this entry is at least as recent as `other`: newer timestamp
    /// wins, ties fall to the larger file ID and then the larger offset.
    pub fn supersedes(&self, other: &KeydirEntry) -> bool {
        (self.tstamp, self.file_id, self.value_offset)
            >= (other.tstamp, other.file_id, other.value_offset)
    }
}

/// Concurrent mapping from key to the location of its most recent value.
///
/// `put` enforces most-recent-wins: an entry is only installed when it
/// supersedes whatever is already present, so scans and merges can feed the
/// map in any order without losing the correct winner. Individual
/// operations are atomic; no ordering is promised across distinct keys.
pub(crate) struct KeyDir {
    map: SkipMap<Vec<u8>, KeydirEntry>,
}

impl KeyDir {
    pub fn new() -> KeyDir {
        KeyDir {
            map: SkipMap::new(),
        }
    }

    /// Install `entry` for `key` unless a more recent entry is present.
    pub fn put(&self, key: Vec<u8>, entry: KeydirEntry) {
        self.map
            .compare_insert(key, entry, |current| entry.supersedes(current));
    }

    pub fn get(&self, key: &[u8]) -> Option<KeydirEntry> {
        self.map.get(key).map(|e| *e.value())
    }

    pub fn remove(&self, key: &[u8]) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (Vec<u8>, KeydirEntry)> + '_ {
        self.map.iter().map(|e| (e.key().clone(), *e.value()))
    }
}
