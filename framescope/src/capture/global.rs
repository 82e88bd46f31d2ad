//! Process-wide engine accessor.
//!
//! The engine is created on first use by [`get_or_init`] and stays installed
//! until [`shutdown`] stops the capture and removes it. Handles obtained
//! earlier keep the engine alive until they are dropped.

use crate::capture::engine::CaptureEngine;
use crate::capture::status::CaptureStatus;
use arc_swap::ArcSwapOption;
use std::sync::{Arc, LazyLock, Mutex};

static ENGINE: LazyLock<ArcSwapOption<CaptureEngine>> =
    LazyLock::new(|| ArcSwapOption::from(None));
static INIT: Mutex<()> = Mutex::new(());

/// The installed engine, if any.
pub fn get() -> Option<Arc<CaptureEngine>> {
    ENGINE.load_full()
}

/// The installed engine, creating it with `init` if there is none.
/// Concurrent callers wait for the first initialization to finish.
pub fn get_or_init(
    init: impl FnOnce() -> std::io::Result<CaptureEngine>,
) -> std::io::Result<Arc<CaptureEngine>> {
    if let Some(engine) = get() {
        return Ok(engine);
    }
    let _init = INIT.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(engine) = get() {
        return Ok(engine);
    }
    let engine = Arc::new(init()?);
    ENGINE.store(Some(engine.clone()));
    Ok(engine)
}

/// Stop any running capture and uninstall the engine.
///
/// Returns the status of the final stop, or `None` if no engine was installed.
pub fn shutdown() -> Option<CaptureStatus> {
    let _init = INIT.lock().unwrap_or_else(|e| e.into_inner());
    let engine = ENGINE.swap(None)?;
    Some(engine.stop_capture())
}
