//! Background threads: the bucket GC / lock ticker and the send-queue
//! proof-of-work worker.
//!
//! Both are plain OS threads polling the shared enabled flag. Sleeps
//! happen in short slices so `shutdown()` joins promptly — the
//! configured grace period is an upper bound, not a wait.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use secmsg_protocol::SMSG_THREAD_DELAY;
use secmsg_types::{unix_time, Result, SmsgError};

use crate::node::SecureMsgNode;

/// Slice length for interruptible sleeping.
const SLEEP_SLICE_MS: u64 = 250;

/// Spawns both workers, returning their join handles.
pub(crate) fn spawn_workers(node: &Arc<SecureMsgNode>) -> Result<Vec<JoinHandle<()>>> {
    let spawn_err = |e: std::io::Error| SmsgError::IoError {
        reason: format!("thread spawn failed: {e}"),
    };

    let gc = {
        let node = Arc::clone(node);
        thread::Builder::new()
            .name("smsg".into())
            .spawn(move || gc_loop(node))
            .map_err(spawn_err)?
    };
    let pow = {
        let node = Arc::clone(node);
        thread::Builder::new()
            .name("smsg-pow".into())
            .spawn(move || pow_loop(node))
            .map_err(spawn_err)?
    };
    Ok(vec![gc, pow])
}

/// Sleeps up to `total_ms`, returning early once the node disables.
fn sleep_while_enabled(node: &SecureMsgNode, total_ms: u64) {
    let mut remaining = total_ms;
    while remaining > 0 && node.is_enabled() {
        let step = remaining.min(SLEEP_SLICE_MS);
        thread::sleep(Duration::from_millis(step));
        remaining -= step;
    }
}

/// Bucket management thread: accumulates poll ticks up to
/// `SMSG_THREAD_DELAY`, then runs one maintenance pass.
fn gc_loop(node: Arc<SecureMsgNode>) {
    let mut delay: u32 = 0;
    loop {
        sleep_while_enabled(&node, node.config.worker_poll_ms);
        if !node.is_enabled() {
            break;
        }

        delay += 1;
        if delay < SMSG_THREAD_DELAY {
            continue;
        }
        delay = 0;

        node.run_bucket_maintenance(unix_time());
    }
    tracing::debug!("bucket maintenance thread exited");
}

/// Proof-of-work thread: drains the send queue each wake. The abort
/// flag is checked inside the search, so an in-flight item survives
/// shutdown in the queue and resumes on next start.
fn pow_loop(node: Arc<SecureMsgNode>) {
    loop {
        sleep_while_enabled(&node, node.config.worker_poll_ms);
        if !node.is_enabled() {
            break;
        }

        node.run_send_queue();
    }
    tracing::debug!("proof-of-work thread exited");
}
