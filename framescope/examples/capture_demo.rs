//! Record a few frames of a fake game loop with worker threads and async
//! jobs, then write them to `capture_demo.0.bin`.
//!
//! Run with `RUST_LOG=framescope=debug` to see the engine's own logging.

use framescope::capture::{
    CaptureEngine, CaptureStatus, Color, EventDescription, RotatingWriter, global, scope,
    sync_scope,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let engine = global::get_or_init(|| {
        let writer = RotatingWriter::new("capture_demo", 16 * 1024 * 1024, 64 * 1024 * 1024)?;
        CaptureEngine::builder().build(Box::new(writer))
    })?;
    engine
        .register_current_thread()
        .map_err(std::io::Error::other)?;

    let frame = EventDescription::here("Frame", Color::BLUE);
    let physics = EventDescription::here("Physics", Color::ORANGE);
    let lock_wait = EventDescription::here("Wait for job", Color::NULL);
    let job = EventDescription::here("Streaming job", Color::GREEN);

    if engine.start_capture() != CaptureStatus::Ok {
        eprintln!("capture did not start");
        return Ok(());
    }

    let running = AtomicBool::new(true);
    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                if engine.register_current_thread().is_err() {
                    return;
                }
                while running.load(Ordering::Relaxed) {
                    let _physics = scope(physics);
                    std::thread::sleep(Duration::from_micros(300));
                }
                engine.unregister_current_thread();
            });
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        for _ in 0..30 {
            let _frame = scope(frame);
            let streaming = engine.fiber_scoped(async {
                let _job = scope(job);
                tokio::time::sleep(Duration::from_micros(200)).await;
            });
            if let Ok(streaming) = streaming {
                let _wait = sync_scope(lock_wait, 1);
                runtime.block_on(streaming);
            }
            drop(_frame);
            engine.next_frame();
        }
        running.store(false, Ordering::Relaxed);
    });

    let status = global::shutdown();
    println!("capture finished: {status:?}, written to capture_demo.0.bin");
    Ok(())
}
