//! `spated`: load configuration from the environment and run the media
//! driver until signalled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spate_driver::{DriverConfig, MediaDriver};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match DriverConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("spated: {e}");
            std::process::exit(1);
        }
    };

    let mut driver = match MediaDriver::launch(config) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("spated: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [libc::SIGINT, libc::SIGTERM] {
        let shutdown = Arc::clone(&shutdown);
        unsafe {
            install_handler(signal, shutdown);
        }
    }

    tracing::info!(dir = %driver.config().dir.display(), "spated running");
    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    tracing::info!("signal received, shutting down");
    driver.close();
}

static SHUTDOWN_FLAG: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

unsafe fn install_handler(signal: libc::c_int, flag: Arc<AtomicBool>) {
    let _ = SHUTDOWN_FLAG.set(flag);
    extern "C" fn handle(_: libc::c_int) {
        if let Some(flag) = SHUTDOWN_FLAG.get() {
            flag.store(true, Ordering::Release);
        }
    }
    unsafe {
        libc::signal(signal, handle as libc::sighandler_t);
    }
}
