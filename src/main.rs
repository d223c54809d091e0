//! TR Router binary entry point: loads the config, opens the MIDI ports,
//! installs the single-instance lock and signal handlers, and runs the
//! worker loop that owns the [`EngineCoordinator`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::thread_rng;
use thread_priority::{set_current_thread_priority, ThreadPriority};

use tr_router::config;
use tr_router::engine::{EngineCoordinator, Pattern};
use tr_router::lock::{self, InstanceLock};
use tr_router::model::PatternConfig;
use tr_router::port::{MidiOutputPort, VirtualMidiInput, VirtualMidiOutput};

const CLIENT_NAME: &str = "TR Router";
const INPUT_PORT_NAME: &str = "TR Router In";

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

fn main() {
    env_logger::init();

    let config_path = config_path_from_args();
    let (input_channel, pattern_configs) = match config::load(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("failed to load config at {config_path:?}: {e}");
            std::process::exit(1);
        }
    };

    let _lock = InstanceLock::acquire(&lock::default_lock_path());

    if let Err(e) = ctrlc::set_handler(|| {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }) {
        log::warn!("failed to install Ctrl-C handler: {e}");
    }
    install_reload_signal_handler();

    let mut input = match VirtualMidiInput::open(CLIENT_NAME, INPUT_PORT_NAME) {
        Ok(port) => port,
        Err(e) => {
            log::error!("failed to open input port: {e}");
            std::process::exit(1);
        }
    };

    let patterns = match open_patterns(pattern_configs) {
        Ok(patterns) => patterns,
        Err(e) => {
            log::error!("failed to open output ports: {e}");
            std::process::exit(1);
        }
    };

    let mut coordinator = EngineCoordinator::new(input_channel, patterns);

    match set_current_thread_priority(ThreadPriority::Max) {
        Ok(()) => log::info!("worker thread priority set to Max"),
        Err(e) => log::warn!("failed to raise worker thread priority: {e:?}"),
    }

    let mut rng = thread_rng();
    log::info!("TR Router engine running (input channel {})", input_channel + 1);

    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            log::info!("shutdown requested, releasing notes and exiting");
            break;
        }

        if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
            match reload(&config_path, &mut coordinator) {
                Ok(()) => log::info!("configuration reloaded from {config_path:?}"),
                Err(e) => log::error!("reload failed, keeping prior config: {e}"),
            }
        }

        match input.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(msg)) => coordinator.handle_message(msg, &mut rng),
            Ok(None) => continue,
            Err(e) => {
                log::error!("MIDI input error, shutting down: {e}");
                break;
            }
        }
    }

    coordinator.shutdown();
}

fn config_path_from_args() -> PathBuf {
    std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.json"))
}

fn open_patterns(configs: Vec<PatternConfig>) -> Result<Vec<Pattern>, tr_router::error::PortError> {
    let mut patterns = Vec::with_capacity(configs.len());
    for config in configs {
        let output = VirtualMidiOutput::open(CLIENT_NAME, &config.name)?;
        patterns.push(Pattern::new(config, Box::new(output)));
    }
    Ok(patterns)
}

/// Reload the config from `path` and rebuild the whole pattern set, each
/// with a freshly opened output port. The coordinator releases every
/// sounding/pending note on the old configuration before swapping it out,
/// so a reload never leaves a note stuck on a port that's about to close.
fn reload(path: &Path, coordinator: &mut EngineCoordinator) -> Result<(), tr_router::error::EngineError> {
    let (input_channel, new_configs) = config::load(path)?;

    let mut rebuilt = Vec::with_capacity(new_configs.len());
    for config in new_configs {
        let port = VirtualMidiOutput::open(CLIENT_NAME, &config.name)?;
        rebuilt.push((config, Box::new(port) as Box<dyn MidiOutputPort>));
    }

    coordinator.reload(input_channel, rebuilt);
    Ok(())
}

#[cfg(unix)]
fn install_reload_signal_handler() {
    extern "C" fn handle_sighup(_: libc::c_int) {
        RELOAD_REQUESTED.store(true, Ordering::SeqCst);
    }
    // SAFETY: installs a signal-safe handler that only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGHUP, handle_sighup as usize);
    }
}

#[cfg(not(unix))]
fn install_reload_signal_handler() {
    log::warn!("no portable reload signal on this platform; config changes require a restart");
}
