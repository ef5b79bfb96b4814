#![allow(clippy::too_many_arguments, clippy::many_single_char_names)]

pub mod api;
pub mod callbacks;
pub mod driver;
mod error;
pub mod graph;
pub mod planner;
mod prelude;
pub mod store;
pub mod types;
pub mod worker;

pub use crate::api::{Array, Context};
pub use crate::error::{Error, Result};

pub fn hostname() -> &'static str {
    lazy_static::lazy_static! {
        static ref HOSTNAME: String = {
            match ::hostname::get() {
                Ok(s) => s.to_string_lossy().into_owned(),
                Err(_) => "<anonymous>".into(),
            }
        };
    };

    &*HOSTNAME
}

/// Installs a logger that prefixes every line with the host name and the seconds since
/// the logger was initialized. The level is taken from `RUST_LOG`.
pub fn initialize_logger() {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref START_TIMING: Instant = Instant::now();
    }

    let _ = *START_TIMING;

    let _ = env_logger::Builder::from_default_env()
        .format(|formatter, record| {
            use std::io::Write;
            let duration = START_TIMING.elapsed();

            writeln!(
                formatter,
                "[{} {} {:.06}] {}: {}",
                hostname(),
                record.module_path().unwrap_or("?"),
                duration.as_secs_f64(),
                record.level(),
                record.args(),
            )
        })
        .try_init();
}
