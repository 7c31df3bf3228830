// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sets up a `tracing` subscriber per the `LIGHTNVR_LOG`/`LIGHTNVR_FORMAT`
//! environment variables, and a panic hook that logs through `tracing`
//! rather than writing straight to stderr (so a worker-thread panic gets
//! the same timestamp/thread-name treatment as everything else, and shows
//! up wherever the operator's log sink is, even though it never crosses a
//! worker boundary as a propagated error).

use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("LIGHTNVR_LOG")
        .from_env_lossy()
}

fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = p
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| p.payload().downcast_ref::<String>().map(String::as_str));
    error!(
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        "panic",
    );
}

pub fn install() {
    let filter = env_filter();
    match std::env::var("LIGHTNVR_FORMAT").as_deref() {
        Ok("json") => {
            let sub = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .with_thread_names(true)
                    .json()
                    .with_filter(filter),
            );
            tracing::subscriber::set_global_default(sub).unwrap();
        }
        _ => {
            let sub = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .with_thread_names(true)
                    .with_filter(filter),
            );
            tracing::subscriber::set_global_default(sub).unwrap();
        }
    }

    let use_panic_hook = std::env::var("LIGHTNVR_PANIC_HOOK")
        .map(|s| s != "false" && s != "0")
        .unwrap_or(true);
    if use_panic_hook {
        std::panic::set_hook(Box::new(&panic_hook));
    }
}

pub fn install_for_tests() {
    let filter = env_filter();
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_test_writer()
            .with_thread_names(true)
            .with_filter(filter),
    );
    let _ = tracing::subscriber::set_global_default(sub);
}
