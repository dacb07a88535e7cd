//! scattercache: a memcached-compatible cache server.
//!
//! Startup order matters: resource limits and privileges are settled before
//! the runtime binds its sockets, and daemonization happens before any
//! threads exist.

use scattercache::config::{self, Settings, StartupOptions};
use scattercache::storage::Store;
use scattercache::{daemon, runtime};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

const LICENSE: &str = "\
Copyright (c) scattercache authors. All rights reserved.

Redistribution and use in source and binary forms, with or without
modification, are permitted provided that the following conditions are
met:

    * Redistributions of source code must retain the above copyright
notice, this list of conditions and the following disclaimer.

    * Redistributions in binary form must reproduce the above copyright
notice, this list of conditions and the following disclaimer in the
documentation and/or other materials provided with the distribution.

    * The name of the copyright holder may not be used to endorse or
promote products derived from this software without specific prior
written permission.

THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
\"AS IS\" AND ANY EXPRESS OR IMPLIED WARRANTIES ARE DISCLAIMED.
";

fn main() -> ExitCode {
    let (settings, startup) = match config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if startup.license {
        print!("{LICENSE}");
        return ExitCode::SUCCESS;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match serve(settings, &startup) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(settings: Settings, startup: &StartupOptions) -> Result<(), Box<dyn std::error::Error>> {
    if startup.maxcore {
        daemon::raise_core_limit()?;
    }
    daemon::raise_fd_limit(settings.maxconns)?;
    daemon::drop_privileges(startup.username.as_deref())?;

    if startup.daemonize {
        /* keep the cwd when core dumps are wanted; keep stderr when verbose */
        daemon::daemonize(startup.maxcore, settings.verbosity() > 0)?;
    }
    if startup.lock_memory {
        daemon::lock_memory();
    }

    let pidfile = if startup.daemonize {
        startup.pidfile.clone()
    } else {
        None
    };
    if let Some(path) = &pidfile {
        daemon::save_pid(path);
    }

    let store = Store::new(settings.maxbytes, settings.evict_to_free);
    let shutdown = Arc::new(AtomicBool::new(false));
    let result = runtime::run(Arc::new(settings), store, shutdown);

    if let Some(path) = &pidfile {
        daemon::remove_pidfile(path);
    }

    if let Err(e) = &result {
        error!(error = %e, "server exited with error");
    }
    result.map_err(Into::into)
}
