//! Command dispatch and handlers for the text protocol.
//!
//! `process_command` is handed one complete command line; handlers queue
//! their reply through the connection's assembler and pick the next state.
//! Error replies leave the connection reading.

use crate::clock;
use crate::protocol::parser::{
    parse_i64, parse_u64, tokenize_command, Token, KEY_TOKEN, MAX_TOKENS, SUBCOMMAND_TOKEN,
};
use crate::protocol::{KEY_MAX_LENGTH, MAX_BUCKETS};
use crate::runtime::connection::{ConnState, Connection};
use crate::runtime::event_loop::WorkerCtx;
use crate::runtime::reply::Segment;
use crate::storage::{DeferError, DeltaResult, Item, StorePolicy, StoreResult};
use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;
use tracing::trace;

fn bad_format(conn: &mut Connection) {
    conn.out_string("CLIENT_ERROR bad command line format");
}

/// Managed-mode gate: every data command must carry a fresh (bucket,
/// generation) tag matching the ownership table.
fn bucket_check(conn: &mut Connection, w: &WorkerCtx<'_>) -> bool {
    if !w.srv.settings.managed {
        return true;
    }
    let bucket = conn.bucket;
    if bucket < 0 {
        conn.out_string("CLIENT_ERROR no BG data in managed mode");
        return false;
    }
    conn.bucket = -1;
    if w.srv.buckets.generation(bucket as usize) != conn.gen {
        conn.out_string("ERROR_NOT_OWNER");
        return false;
    }
    true
}

/// Dispatch one command line.
pub fn process_command(conn: &mut Connection, w: &mut WorkerCtx<'_>, line: &[u8]) {
    if w.srv.settings.verbosity() > 1 {
        trace!(cmd = %String::from_utf8_lossy(line), "<- command");
    }

    /* entering the reading state cleared the reply assembly */
    debug_assert_eq!(conn.msgcurr, 0);
    debug_assert!(conn.msgs.is_empty());
    debug_assert_eq!(conn.iovused, 0);
    conn.add_msghdr();

    let (tokens, rest) = tokenize_command(line, MAX_TOKENS);
    let ntokens = tokens.len() + 1;
    let cmd = tokens.first().map(|t| t.bytes).unwrap_or(b"");

    if ntokens >= 3 && (cmd == b"get" || cmd == b"bget") {
        process_get(conn, w, &tokens, rest);
    } else if ntokens == 3 && cmd == b"metaget" {
        process_metaget(conn, w, &tokens);
    } else if ntokens == 6 && cmd == b"add" {
        process_update(conn, w, &tokens, StorePolicy::Add);
    } else if ntokens == 6 && cmd == b"set" {
        process_update(conn, w, &tokens, StorePolicy::Set);
    } else if ntokens == 6 && cmd == b"replace" {
        process_update(conn, w, &tokens, StorePolicy::Replace);
    } else if ntokens == 4 && cmd == b"incr" {
        process_arithmetic(conn, w, &tokens, true);
    } else if ntokens == 4 && cmd == b"decr" {
        process_arithmetic(conn, w, &tokens, false);
    } else if (3..=4).contains(&ntokens) && cmd == b"delete" {
        process_delete(conn, w, &tokens, ntokens);
    } else if ntokens == 3 && cmd == b"own" {
        process_own(conn, w, &tokens);
    } else if ntokens == 3 && cmd == b"disown" {
        process_disown(conn, w, &tokens);
    } else if ntokens == 3 && cmd == b"bg" {
        process_bg(conn, w, &tokens);
    } else if ntokens >= 2 && cmd == b"stats" {
        process_stat(conn, w, &tokens, ntokens);
    } else if (2..=3).contains(&ntokens) && cmd == b"flush_all" {
        process_flush_all(conn, w, &tokens, ntokens);
    } else if ntokens == 3 && cmd == b"flush_regex" {
        process_flush_regex(conn, w, &tokens);
    } else if ntokens == 3 && cmd == b"verbosity" {
        let level = parse_u64(tokens[1].bytes).unwrap_or(u64::MAX);
        w.srv.settings.set_verbosity(level.min(usize::MAX as u64) as usize);
        conn.out_string("OK");
    } else if ntokens == 2 && cmd == b"version" {
        conn.out_string(concat!("VERSION ", env!("CARGO_PKG_VERSION")));
    } else if ntokens == 2 && cmd == b"quit" {
        conn.set_state(ConnState::Closing, w.pool);
    } else {
        conn.out_string("ERROR");
    }
}

/// Multi-key fetch: stream `VALUE key flags len\r\n<data>\r\n` per hit, then
/// `END\r\n`. Hits hold their item pinned through the reply segments.
fn process_get<'a>(
    conn: &mut Connection,
    w: &mut WorkerCtx<'_>,
    tokens: &[Token<'a>],
    rest: Option<&'a [u8]>,
) {
    if !bucket_check(conn, w) {
        return;
    }

    let now = clock::current_time();
    let detail = w.srv.settings.detail_enabled();
    let delimiter = w.srv.settings.prefix_delimiter;

    let mut keys: Vec<Token<'a>> = tokens[KEY_TOKEN..].to_vec();
    let mut rest = rest;

    'fanout: loop {
        for token in &keys {
            let key = token.bytes;
            if key.len() > KEY_MAX_LENGTH {
                bad_format(conn);
                return;
            }

            let it = w.srv.store.get(key, now);

            {
                let mut st = w.srv.stats.slot(w.thread);
                st.get_cmds += 1;
                st.get_bytes += it.as_ref().map_or(0, |it| it.data().len()) as u64;
            }
            if detail {
                w.srv.stats.prefix_record_get(key, delimiter, it.is_some());
            }

            match it {
                Some(it) => {
                    /* each hit queues four segments:
                     *   "VALUE " + key + " flags len\r\n" + data + "\r\n" */
                    let off = conn.wbuf.len();
                    let _ = write!(conn.wbuf, " {} {}\r\n", it.flags(), it.data().len());
                    let flen = conn.wbuf.len() - off;

                    if conn.add_iov(Segment::fixed(b"VALUE "), true).is_err()
                        || conn.add_iov(Segment::item_key(Arc::clone(&it)), false).is_err()
                        || conn.add_iov(Segment::WriteBuf { off, len: flen }, false).is_err()
                        || conn.add_iov(Segment::item_value(it), false).is_err()
                        || conn.add_iov(Segment::fixed(b"\r\n"), false).is_err()
                    {
                        break 'fanout;
                    }
                    w.srv.stats.slot(w.thread).get_hits += 1;
                }
                None => {
                    w.srv.stats.slot(w.thread).get_misses += 1;
                }
            }
        }

        /* command line longer than one tokenizer pass; pick up where it
         * stopped */
        match rest.take() {
            Some(more) => {
                let (more_tokens, more_rest) = tokenize_command(more, MAX_TOKENS);
                keys = more_tokens;
                rest = more_rest;
            }
            None => break,
        }
    }

    let _ = conn.add_iov(Segment::fixed(b"END\r\n"), true);
    if conn.is_datagram() {
        conn.build_udp_headers();
    }
    conn.set_state(ConnState::WriteMulti, w.pool);
    conn.msgcurr = 0;
}

/// One line of item metadata: age, expiration, origin address.
fn process_metaget(conn: &mut Connection, w: &mut WorkerCtx<'_>, tokens: &[Token<'_>]) {
    let key = tokens[KEY_TOKEN].bytes;
    if key.len() > KEY_MAX_LENGTH {
        bad_format(conn);
        return;
    }

    let now = clock::current_time();
    if let Some(it) = w.srv.store.get(key, now) {
        let age = now.saturating_sub(it.stored_at());
        let from = match it.origin() {
            Some(ip) => ip.to_string(),
            None => "unknown".to_string(),
        };

        let off = conn.wbuf.len();
        let _ = write!(
            conn.wbuf,
            " age: {}; exptime: {}; from: {}\r\n",
            age,
            it.exptime(),
            from
        );
        let len = conn.wbuf.len() - off;

        let _ = conn.add_iov(Segment::fixed(b"META "), true);
        let _ = conn.add_iov(Segment::item_key(it), false);
        let _ = conn.add_iov(Segment::WriteBuf { off, len }, false);
    }

    if conn.add_iov(Segment::fixed(b"END\r\n"), false).is_err() {
        conn.out_string("SERVER_ERROR out of memory");
        return;
    }
    if conn.is_datagram() {
        conn.build_udp_headers();
    }
    conn.set_state(ConnState::WriteMulti, w.pool);
    conn.msgcurr = 0;
}

/// `add`/`set`/`replace`: parse the header line, then switch to reading the
/// value body.
fn process_update(
    conn: &mut Connection,
    w: &mut WorkerCtx<'_>,
    tokens: &[Token<'_>],
    policy: StorePolicy,
) {
    if tokens[KEY_TOKEN].len() > KEY_MAX_LENGTH {
        bad_format(conn);
        return;
    }
    let key = tokens[KEY_TOKEN].bytes;

    let (flags, exptime, vlen) = match (
        parse_u64(tokens[2].bytes),
        parse_i64(tokens[3].bytes),
        parse_i64(tokens[4].bytes),
    ) {
        (Ok(flags), Ok(exptime), Ok(vlen)) => (flags, exptime, vlen),
        _ => {
            bad_format(conn);
            return;
        }
    };
    if vlen < 0 {
        bad_format(conn);
        return;
    }
    let vlen = vlen as usize;

    if w.srv.settings.detail_enabled() {
        w.srv
            .stats
            .prefix_record_set(key, w.srv.settings.prefix_delimiter);
    }
    if !bucket_check(conn, w) {
        return;
    }

    if !w.srv.store.size_ok(key.len(), vlen) {
        conn.out_string("SERVER_ERROR object too large for cache");
        /* swallow the data line */
        conn.write_and_go = ConnState::Swallow;
        conn.sbytes = vlen + 2;
        return;
    }

    /* a datagram carries its whole request; a short body can never be
     * completed by another read */
    if conn.is_datagram() && conn.rbytes < vlen + 2 {
        conn.out_string("CLIENT_ERROR bad data chunk");
        return;
    }

    conn.pending = Some(crate::runtime::connection::PendingStore {
        policy,
        key: key.to_vec(),
        flags: flags as u32,
        exptime: clock::realtime(exptime),
        vlen,
        body: vec![0u8; vlen + 2],
        filled: 0,
    });
    conn.set_state(ConnState::ReadValue, w.pool);
}

/// The value body has arrived; verify its terminator and store it.
pub fn complete_nread(conn: &mut Connection, w: &mut WorkerCtx<'_>) {
    w.srv.stats.slot(w.thread).set_cmds += 1;

    let p = match conn.pending.take() {
        Some(p) => p,
        None => {
            conn.set_state(ConnState::Closing, w.pool);
            return;
        }
    };

    if &p.body[p.vlen..] != b"\r\n" {
        conn.out_string("CLIENT_ERROR bad data chunk");
        return;
    }

    let mut body = p.body;
    body.truncate(p.vlen);
    let now = clock::current_time();
    let it = Item::new(&p.key, p.flags, p.exptime, body, now, conn.peer_ip());

    match w.srv.store.store(it, p.policy, now) {
        StoreResult::Stored => conn.out_string("STORED"),
        StoreResult::NotStored => conn.out_string("NOT_STORED"),
        StoreResult::OutOfMemory => conn.out_string("SERVER_ERROR out of memory"),
    }
}

fn process_arithmetic(
    conn: &mut Connection,
    w: &mut WorkerCtx<'_>,
    tokens: &[Token<'_>],
    incr: bool,
) {
    if tokens[KEY_TOKEN].len() > KEY_MAX_LENGTH {
        bad_format(conn);
        return;
    }
    let key = tokens[KEY_TOKEN].bytes;

    if !bucket_check(conn, w) {
        return;
    }

    let delta = match parse_u64(tokens[2].bytes) {
        Ok(delta) => delta as u32,
        Err(_) => {
            bad_format(conn);
            return;
        }
    };

    let now = clock::current_time();
    let detail = w.srv.settings.detail_enabled();
    let delimiter = w.srv.settings.prefix_delimiter;
    w.srv.stats.slot(w.thread).arith_cmds += 1;

    match w.srv.store.add_delta(key, incr, delta, now) {
        DeltaResult::NotFound => {
            if detail {
                w.srv.stats.prefix_record_get(key, delimiter, false);
            }
            conn.out_string("NOT_FOUND");
        }
        DeltaResult::Value(value) => {
            let text = value.to_string();
            {
                let mut st = w.srv.stats.slot(w.thread);
                st.arith_hits += 1;
                st.get_bytes += text.len() as u64;
            }
            if detail {
                /* an arithmetic op is essentially a set+get */
                w.srv.stats.prefix_record_set(key, delimiter);
                w.srv.stats.prefix_record_get(key, delimiter, true);
            }
            conn.out_string(&text);
        }
    }
}

/// Immediate unlink, or a deferred delete with a grace window.
fn process_delete(
    conn: &mut Connection,
    w: &mut WorkerCtx<'_>,
    tokens: &[Token<'_>],
    ntokens: usize,
) {
    if !bucket_check(conn, w) {
        return;
    }

    let key = tokens[KEY_TOKEN].bytes;
    if key.len() > KEY_MAX_LENGTH {
        bad_format(conn);
        return;
    }

    let mut exptime = 0i64;
    if ntokens == 4 {
        exptime = match parse_i64(tokens[2].bytes) {
            Ok(t) => t,
            Err(_) => {
                bad_format(conn);
                return;
            }
        };
    }

    if w.srv.settings.detail_enabled() {
        w.srv
            .stats
            .prefix_record_delete(key, w.srv.settings.prefix_delimiter);
    }

    let now = clock::current_time();
    match w.srv.store.get(key, now) {
        None => conn.out_string("NOT_FOUND"),
        Some(it) => {
            if exptime == 0 {
                w.srv.store.unlink(&it);
                conn.out_string("DELETED");
            } else {
                /* our reference is transferred to the delete queue */
                match w.srv.store.defer_delete(it, clock::realtime(exptime)) {
                    Ok(()) => conn.out_string("DELETED"),
                    Err(DeferError::OutOfMemory) => {
                        conn.out_string("SERVER_ERROR out of memory")
                    }
                }
            }
        }
    }
}

fn process_flush_all(
    conn: &mut Connection,
    w: &mut WorkerCtx<'_>,
    tokens: &[Token<'_>],
    ntokens: usize,
) {
    clock::set_current_time();

    let horizon = if ntokens == 2 {
        clock::current_time().wrapping_sub(1)
    } else {
        match parse_i64(tokens[1].bytes) {
            Ok(exptime) => clock::realtime(exptime).wrapping_sub(1),
            Err(_) => {
                bad_format(conn);
                return;
            }
        }
    };

    w.srv.store.flush_before(horizon);
    conn.out_string("OK");
}

fn process_flush_regex(conn: &mut Connection, w: &mut WorkerCtx<'_>, tokens: &[Token<'_>]) {
    let ok = std::str::from_utf8(tokens[1].bytes)
        .ok()
        .and_then(|pattern| w.srv.store.flush_regex(pattern).ok())
        .is_some();
    if ok {
        conn.out_string("DELETED");
    } else {
        conn.out_string("CLIENT_ERROR Bad regular expression (or regex not supported)");
    }
}

fn parse_bucket_gen(token: &[u8]) -> Option<(u32, u32)> {
    let sep = token.iter().position(|&b| b == b':')?;
    let bucket = parse_exact_u32(&token[..sep])?;
    let gen = parse_exact_u32(&token[sep + 1..])?;
    Some((bucket, gen))
}

fn parse_exact_u32(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn process_own(conn: &mut Connection, w: &mut WorkerCtx<'_>, tokens: &[Token<'_>]) {
    if !w.srv.settings.managed {
        conn.out_string("CLIENT_ERROR not a managed instance");
        return;
    }
    match parse_bucket_gen(tokens[1].bytes) {
        Some((bucket, gen)) => {
            if bucket as usize >= MAX_BUCKETS {
                conn.out_string("CLIENT_ERROR bucket number out of range");
                return;
            }
            w.srv.buckets.set_generation(bucket as usize, gen);
            conn.out_string("OWNED");
        }
        None => conn.out_string("CLIENT_ERROR bad format"),
    }
}

fn process_disown(conn: &mut Connection, w: &mut WorkerCtx<'_>, tokens: &[Token<'_>]) {
    if !w.srv.settings.managed {
        conn.out_string("CLIENT_ERROR not a managed instance");
        return;
    }
    match parse_exact_u32(tokens[1].bytes) {
        Some(bucket) => {
            if bucket as usize >= MAX_BUCKETS {
                conn.out_string("CLIENT_ERROR bucket number out of range");
                return;
            }
            w.srv.buckets.set_generation(bucket as usize, 0);
            conn.out_string("DISOWNED");
        }
        None => conn.out_string("CLIENT_ERROR bad format"),
    }
}

/// Tag the connection's next data command. Valid input gets no reply at all.
fn process_bg(conn: &mut Connection, w: &mut WorkerCtx<'_>, tokens: &[Token<'_>]) {
    if !w.srv.settings.managed {
        conn.out_string("CLIENT_ERROR not a managed instance");
        return;
    }
    match parse_bucket_gen(tokens[1].bytes) {
        Some((bucket, gen)) => {
            /* we never write anything back, even if input's wrong */
            if (bucket as usize) < MAX_BUCKETS && gen > 0 {
                conn.bucket = bucket as i32;
                conn.gen = gen;
            }
            conn.reset_reply();
        }
        None => conn.out_string("CLIENT_ERROR bad format"),
    }
}

fn rusage_seconds() -> ((i64, i64), (i64, i64)) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if res != 0 {
        return ((0, 0), (0, 0));
    }
    (
        (usage.ru_utime.tv_sec, usage.ru_utime.tv_usec),
        (usage.ru_stime.tv_sec, usage.ru_stime.tv_usec),
    )
}

fn process_stat(
    conn: &mut Connection,
    w: &mut WorkerCtx<'_>,
    tokens: &[Token<'_>],
    ntokens: usize,
) {
    let now = clock::current_time();

    if ntokens == 2 {
        let totals = w.srv.stats.aggregate();
        let store_stats = w.srv.store.stats();
        let ((user_sec, user_usec), (sys_sec, sys_usec)) = rusage_seconds();
        let hit_rate = if totals.get_hits + totals.get_misses == 0 {
            0.0
        } else {
            totals.get_hits as f64 * 100.0 / (totals.get_hits + totals.get_misses) as f64
        };

        let mut out = String::with_capacity(2048);
        let _ = write!(out, "STAT pid {}\r\n", std::process::id());
        let _ = write!(out, "STAT uptime {now}\r\n");
        let _ = write!(out, "STAT time {}\r\n", clock::started() + now as i64);
        let _ = write!(out, "STAT version {}\r\n", env!("CARGO_PKG_VERSION"));
        let _ = write!(out, "STAT pointer_size {}\r\n", 8 * std::mem::size_of::<usize>());
        let _ = write!(out, "STAT rusage_user {user_sec}.{user_usec:06}\r\n");
        let _ = write!(out, "STAT rusage_system {sys_sec}.{sys_usec:06}\r\n");
        let _ = write!(out, "STAT curr_items {}\r\n", store_stats.curr_items);
        let _ = write!(out, "STAT total_items {}\r\n", store_stats.total_items);
        let _ = write!(out, "STAT bytes {}\r\n", store_stats.mem_used);
        let _ = write!(out, "STAT curr_connections {}\r\n", totals.curr_conns);
        let _ = write!(out, "STAT total_connections {}\r\n", totals.total_conns);
        let _ = write!(out, "STAT connection_structures {}\r\n", totals.conn_structs);
        let _ = write!(out, "STAT cmd_get {}\r\n", totals.get_cmds);
        let _ = write!(out, "STAT cmd_set {}\r\n", totals.set_cmds);
        let _ = write!(out, "STAT get_hits {}\r\n", totals.get_hits);
        let _ = write!(out, "STAT get_misses {}\r\n", totals.get_misses);
        let _ = write!(out, "STAT cmd_arith {}\r\n", totals.arith_cmds);
        let _ = write!(out, "STAT arith_hits {}\r\n", totals.arith_hits);
        let _ = write!(out, "STAT hit_rate {hit_rate}%\r\n");
        let _ = write!(out, "STAT evictions {}\r\n", store_stats.evictions);
        let _ = write!(out, "STAT bytes_read {}\r\n", totals.bytes_read);
        let _ = write!(out, "STAT bytes_written {}\r\n", totals.bytes_written);
        let _ = write!(out, "STAT limit_maxbytes {}\r\n", store_stats.maxbytes);
        let _ = write!(out, "STAT get_bytes {}\r\n", totals.get_bytes);
        let _ = write!(out, "STAT threads {}\r\n", w.srv.stats.thread_count());
        for (i, t) in w.srv.stats.per_thread().iter().enumerate() {
            let _ = write!(
                out,
                "STAT thread_{i} gets {} sets {} bytes_read {} bytes_written {}\r\n",
                t.get_cmds, t.set_cmds, t.bytes_read, t.bytes_written
            );
        }
        out.push_str("END");
        conn.out_string(&out);
        return;
    }

    let sub = tokens[SUBCOMMAND_TOKEN].bytes;

    if sub == b"reset" {
        w.srv.stats.reset();
        conn.out_string("RESET");
    } else if sub == b"malloc" {
        let store_stats = w.srv.store.stats();
        let mut out = String::new();
        let _ = write!(out, "STAT arena_size {}\r\n", store_stats.maxbytes);
        let _ = write!(out, "STAT total_alloc {}\r\n", store_stats.mem_used);
        let _ = write!(
            out,
            "STAT total_free {}\r\n",
            store_stats.maxbytes.saturating_sub(store_stats.mem_used)
        );
        let _ = write!(out, "STAT releasable_space 0\r\n");
        out.push_str("END");
        conn.out_string(&out);
    } else if sub == b"maps" {
        match std::fs::read("/proc/self/maps") {
            Ok(mut maps) => {
                maps.extend_from_slice(b"END\r\n");
                conn.out_scratch(maps);
            }
            Err(_) => conn.out_string("SERVER_ERROR cannot open the maps file"),
        }
    } else if sub == b"cachedump" {
        if ntokens < 5 {
            conn.out_string("CLIENT_ERROR bad command line");
            return;
        }
        let (id, limit) = match (parse_u64(tokens[2].bytes), parse_u64(tokens[3].bytes)) {
            (Ok(id), Ok(limit)) => (id, limit),
            _ => {
                bad_format(conn);
                return;
            }
        };
        let _ = id; // single storage class
        let mut out = Vec::new();
        for (key, nbytes, exptime) in w.srv.store.cachedump(limit as usize) {
            out.extend_from_slice(b"ITEM ");
            out.extend_from_slice(&key);
            let _ = write!(out, " [{nbytes} b; {exptime} s]\r\n");
        }
        out.extend_from_slice(b"END\r\n");
        conn.out_scratch(out);
    } else if sub == b"slabs" {
        let store_stats = w.srv.store.stats();
        let mut out = String::new();
        let _ = write!(out, "STAT 1:used_chunks {}\r\n", store_stats.curr_items);
        let _ = write!(out, "STAT 1:total_bytes {}\r\n", store_stats.mem_used);
        let _ = write!(out, "STAT active_slabs 1\r\n");
        let _ = write!(out, "STAT total_malloced {}\r\n", store_stats.mem_used);
        out.push_str("END");
        conn.out_string(&out);
    } else if sub == b"items" {
        let store_stats = w.srv.store.stats();
        let mut out = String::new();
        let _ = write!(out, "STAT items:number {}\r\n", store_stats.curr_items);
        let _ = write!(out, "STAT items:total {}\r\n", store_stats.total_items);
        let _ = write!(out, "STAT items:evictions {}\r\n", store_stats.evictions);
        let _ = write!(
            out,
            "STAT items:pending_deletes {}\r\n",
            store_stats.pending_deletes
        );
        out.push_str("END");
        conn.out_string(&out);
    } else if sub == b"detail" {
        let mode = if ntokens < 4 { &b""[..] } else { tokens[2].bytes };
        if mode == b"on" {
            w.srv.settings.set_detail_enabled(true);
            conn.out_string("OK");
        } else if mode == b"off" {
            w.srv.settings.set_detail_enabled(false);
            conn.out_string("OK");
        } else if mode == b"dump" {
            conn.out_scratch(w.srv.stats.prefix_dump());
        } else {
            conn.out_string("CLIENT_ERROR usage: stats detail on|off|dump");
        }
    } else if sub == b"sizes" {
        let mut out = Vec::new();
        for (size, count) in w.srv.store.size_histogram() {
            let _ = write!(out, "{size} {count}\r\n");
        }
        out.extend_from_slice(b"END\r\n");
        conn.out_scratch(out);
    } else if sub == b"buckets" {
        let mut out = Vec::new();
        for (bucket, gen) in w.srv.buckets.owned() {
            let _ = write!(out, "STAT bucket:{bucket} gen {gen}\r\n");
        }
        out.extend_from_slice(b"END\r\n");
        conn.out_scratch(out);
    } else if sub == b"conn_buffer" {
        let mut out = w.srv.pools.render();
        out.push_str("END");
        conn.out_string(&out);
    } else {
        conn.out_string("ERROR");
    }
}
