use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framebridge_client::{BridgeContext, BridgeSettings, ConnectionState};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, StreamArgs};
use crate::exit::{client_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_status, OutputFormat};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run(args: StreamArgs, format: OutputFormat) -> CliResult<i32> {
    if args.width == 0 || args.height == 0 {
        return Err(CliError::new(USAGE, "--width and --height must be positive"));
    }
    if args.fps == 0 {
        return Err(CliError::new(USAGE, "--fps must be positive"));
    }
    let connect_timeout = parse_duration(&args.connect_timeout)?;

    let settings = BridgeSettings::from_env().map_err(|err| client_error("bad settings", err))?;
    let ctx = BridgeContext::new(BridgeSettings {
        port: args.port,
        enable: true,
        connect_now: true,
        ..settings
    });
    ctx.start()
        .map_err(|err| client_error("configure failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    if !wait_for(connect_timeout, &running, || {
        ctx.status().state == ConnectionState::Streaming
    }) {
        let status = ctx.status();
        print_status(&status, format);
        ctx.shutdown();
        let detail = status
            .last_error
            .map(|err| format!(" ({}: {})", err.code, err.message))
            .unwrap_or_default();
        return Err(CliError::new(
            TIMEOUT,
            format!("consumer did not accept within {connect_timeout:?}{detail}"),
        ));
    }

    let period = Duration::from_secs(1) / args.fps;
    let mut pixels = vec![0u8; args.width as usize * args.height as usize * 4];
    let mut sent = 0u64;

    for index in 0..args.frames {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let tick = Instant::now();
        paint_pattern(&mut pixels, args.width, args.height, index);
        match ctx.push_frame(args.width, args.height, &pixels, None) {
            Ok(Some(_)) => sent += 1,
            Ok(None) => warn!(index, "frame dropped: bridge not streaming"),
            Err(err) => warn!(index, error = %err, "frame rejected"),
        }
        if let Some(rest) = period.checked_sub(tick.elapsed()) {
            thread::sleep(rest);
        }
    }

    if let Err(err) = ctx.stop_producer(Some("done")) {
        warn!(error = %err, "stop_stream failed");
    }
    wait_for(DRAIN_TIMEOUT, &running, || ctx.client().queued_len() == 0);

    let status = ctx.status();
    info!(sent, requested = args.frames, "stream finished");
    print_status(&status, format);
    ctx.shutdown();

    if sent == 0 && args.frames > 0 {
        return Err(CliError::new(FAILURE, "no frames were sent"));
    }
    Ok(SUCCESS)
}

/// Moving gradient: red follows x and the frame index, green follows y.
fn paint_pattern(pixels: &mut [u8], width: u32, height: u32, index: u64) {
    let (w, h) = (width as usize, height as usize);
    let shift = (index % 256) as usize;
    for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
        let (x, y) = (i % w, i / w);
        px[0] = ((x * 255 / w.max(1) + shift) % 256) as u8;
        px[1] = (y * 255 / h.max(1)) as u8;
        px[2] = (shift * 4 % 256) as u8;
        px[3] = 255;
    }
}

fn wait_for(timeout: Duration, running: &AtomicBool, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline && running.load(Ordering::SeqCst) {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}
