//! Self-regulating worker thread pool for one worker process.
//!
//! Threads accept connections and hand them to the connection processor;
//! the pool grows and shrinks itself between `min_spare_threads` and
//! `max_spare_threads` idle threads. A shared request budget bounds how
//! many connections the process serves before retiring, and a single exit
//! flag, latched by budget exhaustion, poison byte or terminate signal,
//! winds every thread down after its current connection.

#![allow(dead_code)] // Some methods are for monitoring and embedding

use crate::config::ThreadPoolConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::processor::ConnectionProcessor;
use crate::routing::RoutingTable;
use crate::worker::accept::{self, CrossProcessLock, WaitEvent};
use crate::worker::handoff;
use crate::worker::router::{ConnectionRouter, RouteOutcome};
use crate::worker::shutdown::ShutdownChannel;
use std::net::TcpListener;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Back-off after a failed thread spawn, so a resource-starved box is not
/// hammered with creation attempts while the pool winds down.
const THREAD_SPAWN_BACKOFF: Duration = Duration::from_secs(10);

/// Everything a worker thread needs that outlives the pool itself.
pub struct PoolContext {
    pub listeners: Arc<Vec<TcpListener>>,
    pub routing: Arc<RoutingTable>,
    /// Routing entry this process is authorized to serve.
    pub entry_index: usize,
    pub shutdown: Arc<ShutdownChannel>,
    pub cross_lock: Arc<CrossProcessLock>,
    pub processor: Arc<dyn ConnectionProcessor>,
    /// Latched by the terminate-signal handler for this process.
    pub term_flag: Arc<AtomicBool>,
}

/// Counters shared by every thread of the pool, each under its own lock.
struct PoolShared {
    active: Mutex<usize>,
    idle: Mutex<usize>,
    all_done: Condvar,
    exit: AtomicBool,
    budget: AtomicI64,
    /// Serializes consumption of the fleet-wide shutdown channel.
    poison: Mutex<()>,
    /// Kicked when the exit flag latches so a thread blocked in the
    /// multiplexed wait notices without needing another wire event.
    wake: ShutdownChannel,
    max_threads_reported: AtomicBool,
}

impl PoolShared {
    fn exit_latched(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    fn latch_exit(&self) {
        if !self.exit.swap(true, Ordering::AcqRel) {
            let _ = self.wake.broadcast(1);
        }
    }

    fn budget_spent(&self) -> bool {
        self.budget.load(Ordering::Acquire) <= 0
    }

    fn consume_budget(&self) {
        self.budget.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time pool counters, for logs and tests.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub active_threads: usize,
    pub idle_threads: usize,
    pub remaining_budget: i64,
}

struct PoolInner {
    cfg: ThreadPoolConfig,
    ctx: PoolContext,
    /// Intra-process accept turn: one thread in the wait/accept window.
    accept_turn: Mutex<()>,
    shared: PoolShared,
    next_thread_id: AtomicUsize,
}

/// The per-process worker thread pool.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(cfg: ThreadPoolConfig, ctx: PoolContext) -> Result<Self> {
        let budget = if cfg.request_budget == 0 {
            i64::MAX
        } else {
            cfg.request_budget as i64
        };
        Ok(Self {
            inner: Arc::new(PoolInner {
                cfg,
                ctx,
                accept_turn: Mutex::new(()),
                shared: PoolShared {
                    active: Mutex::new(0),
                    idle: Mutex::new(0),
                    all_done: Condvar::new(),
                    exit: AtomicBool::new(false),
                    budget: AtomicI64::new(budget),
                    poison: Mutex::new(()),
                    wake: ShutdownChannel::new()?,
                    max_threads_reported: AtomicBool::new(false),
                },
                next_thread_id: AtomicUsize::new(0),
            }),
        })
    }

    /// Launch the initial threads and serve until the pool winds down.
    ///
    /// The calling thread participates as the designated signal-watcher
    /// worker; `run` returns once every thread has exited and pending
    /// handoffs have been drained.
    pub fn run(&self) -> Result<()> {
        let inner = &self.inner;
        let initial = inner.cfg.start_threads.min(inner.cfg.max_threads);

        *inner.shared.idle.lock().expect("idle counter poisoned") = initial;
        for _ in 0..initial {
            if !start_thread(inner) {
                break;
            }
        }

        {
            let mut active = inner.shared.active.lock().expect("active counter poisoned");
            *active += 1;
        }
        let id = inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
        worker_loop(inner.clone(), id);

        let mut active = inner.shared.active.lock().expect("active counter poisoned");
        while *active > 0 {
            active = inner
                .shared
                .all_done
                .wait(active)
                .expect("active counter poisoned");
        }
        drop(active);

        // Reject handoffs that raced with the wind-down so no forwarding
        // peer stays blocked.
        let entry = inner.ctx.routing.entry(inner.ctx.entry_index);
        handoff::drain_rejected(entry.recv_stream());

        info!("worker pool drained");
        Ok(())
    }

    /// Latch the exit flag from outside (tests, embedding code).
    pub fn stop(&self) {
        self.inner.shared.latch_exit();
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.inner.shared;
        // Counters are read one at a time; taking both locks here could
        // invert the idle-then-active order the worker loop uses.
        let active_threads = *shared.active.lock().expect("active counter poisoned");
        let idle_threads = *shared.idle.lock().expect("idle counter poisoned");
        PoolStats {
            active_threads,
            idle_threads,
            remaining_budget: shared.budget.load(Ordering::Acquire),
        }
    }
}

/// Start one worker thread if the pool is below its hard cap.
///
/// Fails closed: a spawn error winds the whole pool down rather than
/// retrying in a storm.
fn start_thread(inner: &Arc<PoolInner>) -> bool {
    let mut active = inner.shared.active.lock().expect("active counter poisoned");
    if *active >= inner.cfg.max_threads {
        if !inner
            .shared
            .max_threads_reported
            .swap(true, Ordering::Relaxed)
        {
            error!(
                max_threads = inner.cfg.max_threads,
                "reached max_threads, consider raising max_threads or max_processes"
            );
        }
        return false;
    }

    let id = inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
    let clone = inner.clone();
    match std::thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || worker_loop(clone, id))
    {
        Ok(_) => {
            *active += 1;
            true
        }
        Err(e) => {
            drop(active);
            error!(error = %e, "unable to create worker thread, winding down pool");
            std::thread::sleep(THREAD_SPAWN_BACKOFF);
            inner.shared.latch_exit();
            false
        }
    }
}

/// What the wait/accept window produced for this iteration.
enum Pending {
    Exit,
    Accepted(Connection),
    Routed,
}

fn worker_loop(inner: Arc<PoolInner>, id: usize) {
    let shared = &inner.shared;
    let cfg = &inner.cfg;
    let ctx = &inner.ctx;
    let router = ConnectionRouter::new(ctx.routing.clone(), ctx.entry_index);
    let routing_entry = ctx.routing.entry(ctx.entry_index);
    let mut last_listener = 0usize;
    let mut just_started = true;

    debug!(thread = id, "worker thread started");

    loop {
        if ctx.term_flag.load(Ordering::Relaxed) && !shared.exit_latched() {
            info!("terminate observed, winding down after in-flight connections");
            shared.latch_exit();
        }
        if shared.budget_spent() {
            shared.latch_exit();
        }
        if shared.exit_latched() {
            break;
        }

        if just_started {
            just_started = false;
        } else {
            let mut idle = shared.idle.lock().expect("idle counter poisoned");
            if *idle < cfg.max_spare_threads {
                *idle += 1;
            } else {
                // Enough spares already; retire.
                break;
            }
        }

        let turn = inner.accept_turn.lock().expect("accept turn poisoned");
        let mut pending = Pending::Exit;
        if !shared.exit_latched() {
            match ctx.cross_lock.acquire() {
                Ok(cross) => {
                    pending = wait_for_connection(
                        &inner,
                        routing_entry.recv_stream(),
                        &mut last_listener,
                    );
                    // Free the fleet-wide accept window before anything
                    // else; a peer process can start waiting while we
                    // process.
                    drop(cross);
                }
                Err(e) => {
                    error!(error = %e, "cross-process accept lock failed, winding down");
                    shared.latch_exit();
                }
            }
        }
        drop(turn);

        match pending {
            Pending::Exit => {
                let mut idle = shared.idle.lock().expect("idle counter poisoned");
                *idle = idle.saturating_sub(1);
                break;
            }
            Pending::Accepted(_) | Pending::Routed => {
                // This thread is now busy; keep the spare count healthy by
                // replacing ourselves when the pool is at or below the
                // minimum.
                let mut idle = shared.idle.lock().expect("idle counter poisoned");
                if *idle > cfg.min_spare_threads {
                    *idle = idle.saturating_sub(1);
                } else if !start_thread(&inner) {
                    *idle = idle.saturating_sub(1);
                }
            }
        }

        let conn = match pending {
            Pending::Accepted(conn) => match router.route(conn, ctx.processor.as_ref()) {
                RouteOutcome::Local(conn) => Some(conn),
                RouteOutcome::Forwarded | RouteOutcome::Aborted => None,
            },
            Pending::Routed => match router.receive() {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(error = %e, "dropping malformed handoff");
                    None
                }
            },
            Pending::Exit => unreachable!("exit handled above"),
        };

        if let Some(mut conn) = conn {
            if let Err(e) = ctx.processor.process(&mut conn) {
                warn!(error = %e, "connection processor failed");
            }
        }
        shared.consume_budget();
    }

    debug!(thread = id, "worker thread exiting");
    let mut active = shared.active.lock().expect("active counter poisoned");
    *active = active.saturating_sub(1);
    if *active == 0 {
        shared.all_done.notify_all();
    }
}

/// Sit in the serialized accept window until there is a connection to take
/// or a reason to exit. Both accept-turn locks are held by the caller.
fn wait_for_connection(
    inner: &Arc<PoolInner>,
    routing_stream: &std::os::unix::net::UnixStream,
    last_listener: &mut usize,
) -> Pending {
    let shared = &inner.shared;
    let ctx = &inner.ctx;

    loop {
        if ctx.term_flag.load(Ordering::Relaxed) {
            shared.latch_exit();
        }
        if shared.exit_latched() {
            return Pending::Exit;
        }

        let event = match accept::wait_for_event(
            ctx.shutdown.read_fd(),
            shared.wake.read_fd(),
            routing_stream.as_fd(),
            &ctx.listeners,
            last_listener,
        ) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "multiplexed wait failed, winding down");
                shared.latch_exit();
                return Pending::Exit;
            }
        };

        match event {
            WaitEvent::Shutdown => {
                let _poison = shared.poison.lock().expect("poison mutex poisoned");
                if shared.exit_latched() {
                    // A sibling already observed shutdown.
                    return Pending::Exit;
                }
                match ctx.shutdown.try_consume() {
                    Ok(true) => {
                        info!("poison byte claimed, winding down after in-flight connections");
                        shared.latch_exit();
                        return Pending::Exit;
                    }
                    Ok(false) => {
                        // A peer process won the byte; keep serving.
                    }
                    Err(e) => {
                        warn!(error = %e, "shutdown channel read failed");
                    }
                }
            }
            WaitEvent::LocalWake => {
                let _ = shared.wake.try_consume();
                // Loop around; the exit check sees the latched flag.
            }
            WaitEvent::Routed => return Pending::Routed,
            WaitEvent::Listener(idx) => match ctx.listeners[idx].accept() {
                Ok((stream, peer)) => {
                    return Pending::Accepted(Connection::accepted(stream, peer));
                }
                Err(e) => {
                    warn!(listener = idx, error = %e, "accept failed");
                }
            },
        }
    }
}
