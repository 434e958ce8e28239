//! Logging setup for hosts and the demo binary

use std::io::Write;

/// Initialize `env_logger` for the streaming pipeline.
///
/// Default filter is `info`; `RUST_LOG` overrides it (e.g.
/// `RUST_LOG=procgen_stream::streaming::transfer=trace` for per-block
/// output). Each line carries the thread name, so compute lane work
/// (`procgen-compute`) can be told apart from the worker pool.
/// Calling it twice is harmless.
///
/// # Example
/// ```
/// procgen_stream::core::logging::init();
/// log::info!("Streamer started");
/// ```
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{} {:<5} {} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                thread.name().unwrap_or("-"),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
