//! Server statistics.
//!
//! Counters are kept per thread, each set behind its own lock, and summed on
//! demand when a client asks for them. The dispatcher owns slot 0; workers
//! own slot `1 + worker_id`. Per-prefix detail stats (the `-D` flag and
//! `stats detail`) live in a single shared table since they are off by
//! default and only touched when enabled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Counters tracked per thread.
#[derive(Debug, Default, Clone)]
pub struct ThreadStats {
    pub curr_conns: u64,
    pub total_conns: u64,
    pub conn_structs: u64,
    pub get_cmds: u64,
    pub set_cmds: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub get_bytes: u64,
    pub arith_cmds: u64,
    pub arith_hits: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl ThreadStats {
    fn add(&mut self, other: &ThreadStats) {
        self.curr_conns += other.curr_conns;
        self.total_conns += other.total_conns;
        self.conn_structs += other.conn_structs;
        self.get_cmds += other.get_cmds;
        self.set_cmds += other.set_cmds;
        self.get_hits += other.get_hits;
        self.get_misses += other.get_misses;
        self.get_bytes += other.get_bytes;
        self.arith_cmds += other.arith_cmds;
        self.arith_hits += other.arith_hits;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }

    fn reset_counters(&mut self) {
        // connection gauges survive a reset; everything else clears
        let curr_conns = self.curr_conns;
        let conn_structs = self.conn_structs;
        *self = ThreadStats::default();
        self.curr_conns = curr_conns;
        self.conn_structs = conn_structs;
    }
}

/// One stats slot per thread (dispatcher + workers), aggregated on demand.
pub struct StatsSet {
    threads: Vec<Mutex<ThreadStats>>,
    prefixes: Mutex<HashMap<Vec<u8>, PrefixStats>>,
}

impl StatsSet {
    /// `num_threads` includes the dispatcher.
    pub fn new(num_threads: usize) -> Arc<Self> {
        let threads = (0..num_threads)
            .map(|_| Mutex::new(ThreadStats::default()))
            .collect();
        Arc::new(StatsSet {
            threads,
            prefixes: Mutex::new(HashMap::new()),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Lock one thread's slot for updating.
    pub fn slot(&self, thread: usize) -> MutexGuard<'_, ThreadStats> {
        self.threads[thread].lock().unwrap()
    }

    /// Sum all per-thread counters.
    pub fn aggregate(&self) -> ThreadStats {
        let mut total = ThreadStats::default();
        for slot in &self.threads {
            total.add(&slot.lock().unwrap());
        }
        total
    }

    /// Snapshot every thread's counters, for the per-thread stat lines.
    pub fn per_thread(&self) -> Vec<ThreadStats> {
        self.threads
            .iter()
            .map(|slot| slot.lock().unwrap().clone())
            .collect()
    }

    /// Reset command counters on every thread (`stats reset`).
    pub fn reset(&self) {
        for slot in &self.threads {
            slot.lock().unwrap().reset_counters();
        }
        self.prefixes.lock().unwrap().clear();
    }

    fn prefix_of(key: &[u8], delimiter: u8) -> Option<Vec<u8>> {
        key.iter()
            .position(|&b| b == delimiter)
            .map(|pos| key[..pos].to_vec())
    }

    pub fn prefix_record_get(&self, key: &[u8], delimiter: u8, hit: bool) {
        if let Some(prefix) = Self::prefix_of(key, delimiter) {
            let mut prefixes = self.prefixes.lock().unwrap();
            let entry = prefixes.entry(prefix).or_default();
            entry.num_gets += 1;
            if hit {
                entry.num_hits += 1;
            }
        }
    }

    pub fn prefix_record_set(&self, key: &[u8], delimiter: u8) {
        if let Some(prefix) = Self::prefix_of(key, delimiter) {
            let mut prefixes = self.prefixes.lock().unwrap();
            prefixes.entry(prefix).or_default().num_sets += 1;
        }
    }

    pub fn prefix_record_delete(&self, key: &[u8], delimiter: u8) {
        if let Some(prefix) = Self::prefix_of(key, delimiter) {
            let mut prefixes = self.prefixes.lock().unwrap();
            prefixes.entry(prefix).or_default().num_deletes += 1;
        }
    }

    /// Render the per-prefix table for `stats detail dump`.
    pub fn prefix_dump(&self) -> Vec<u8> {
        let prefixes = self.prefixes.lock().unwrap();
        let mut entries: Vec<_> = prefixes.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = Vec::new();
        for (prefix, st) in entries {
            out.extend_from_slice(b"PREFIX ");
            out.extend_from_slice(prefix);
            out.extend_from_slice(
                format!(
                    " get {} hit {} set {} del {}\r\n",
                    st.num_gets, st.num_hits, st.num_sets, st.num_deletes
                )
                .as_bytes(),
            );
        }
        out.extend_from_slice(b"END\r\n");
        out
    }
}

/// Counters kept per key prefix when detail stats are enabled.
#[derive(Debug, Default)]
pub struct PrefixStats {
    pub num_gets: u64,
    pub num_hits: u64,
    pub num_sets: u64,
    pub num_deletes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_threads() {
        let stats = StatsSet::new(3);
        stats.slot(0).get_cmds = 1;
        stats.slot(1).get_cmds = 2;
        stats.slot(2).get_cmds = 4;
        assert_eq!(stats.aggregate().get_cmds, 7);
    }

    #[test]
    fn reset_keeps_connection_gauges() {
        let stats = StatsSet::new(1);
        {
            let mut slot = stats.slot(0);
            slot.curr_conns = 3;
            slot.conn_structs = 5;
            slot.get_cmds = 10;
            slot.bytes_read = 100;
        }
        stats.reset();
        let total = stats.aggregate();
        assert_eq!(total.curr_conns, 3);
        assert_eq!(total.conn_structs, 5);
        assert_eq!(total.get_cmds, 0);
        assert_eq!(total.bytes_read, 0);
    }

    #[test]
    fn prefix_stats_key_up_to_delimiter() {
        let stats = StatsSet::new(1);
        stats.prefix_record_get(b"user:1", b':', true);
        stats.prefix_record_get(b"user:2", b':', false);
        stats.prefix_record_set(b"user:1", b':');
        stats.prefix_record_delete(b"session:9", b':');
        stats.prefix_record_get(b"nodelimiter", b':', true);

        let dump = String::from_utf8(stats.prefix_dump()).unwrap();
        assert!(dump.contains("PREFIX session get 0 hit 0 set 0 del 1\r\n"));
        assert!(dump.contains("PREFIX user get 2 hit 1 set 1 del 0\r\n"));
        assert!(!dump.contains("nodelimiter"));
        assert!(dump.ends_with("END\r\n"));
    }
}
