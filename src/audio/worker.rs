//! Named worker threads with optional core pinning and priority

use super::WorkerConfig;
use std::io;
use std::thread::{self, JoinHandle};
use thread_priority::{set_current_thread_priority, ThreadPriority};

/// Spawn `f` on a named thread placed according to `config`.
///
/// Pinning or priority requests the platform refuses are logged and ignored,
/// so the same configuration runs on a workstation and on the target.
pub fn spawn_worker<F, T>(config: &WorkerConfig, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = config.name.clone();
    let core = config.core;
    let high_priority = config.high_priority;

    thread::Builder::new().name(config.name.clone()).spawn(move || {
        if let Some(core) = core {
            pin_to_core(&name, core);
        }
        if high_priority {
            if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
                log::warn!("Could not raise priority of {}: {:?}", name, e);
            }
        }
        f()
    })
}

fn pin_to_core(name: &str, core: usize) {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        log::warn!("Core pinning unsupported here; {} runs unpinned", name);
        return;
    };

    match core_ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            log::debug!("{} pinned to core {}", name, core);
        }
        Some(_) => log::warn!("Could not pin {} to core {}", name, core),
        None => log::warn!("Core {} does not exist; {} runs unpinned", core, name),
    }
}
