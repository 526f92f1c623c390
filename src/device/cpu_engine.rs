use super::{
    DeviceEngine, DeviceEngineEvent, DeviceId, DeviceInfo, DeviceLost, DeviceOptions,
    ProfilingNotEnabled,
};
use crate::{
    kernel::{error::KernelPanicked, KernelFn},
    timing::{Clock, ProfilingInfo},
};
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::{
    num::NonZeroUsize,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use vecadd_core::kernel::ExecutionRange;

static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(1);

static CPU_NAME: Lazy<String> = Lazy::new(|| {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|cpuinfo| {
            cpuinfo.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                if key.trim() == "model name" {
                    Some(value.trim().to_string())
                } else {
                    None
                }
            })
        })
        .unwrap_or_else(|| format!("{} cpu", std::env::consts::ARCH))
});

pub(super) struct Engine {
    id: DeviceId,
    info: Arc<DeviceInfo>,
    epoch: Instant,
    op_sender: Sender<Arc<Dispatch>>,
    // Tail of the queue. Each dispatch waits on the one before it.
    last: Mutex<Option<Arc<Dispatch>>>,
    exited: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    fn now(&self) -> u64 {
        nanos_since(self.epoch)
    }
    fn device_lost(&self) -> DeviceLost {
        DeviceLost(self.id)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.op_sender = crossbeam_channel::bounded(0).0;
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        log::debug!("dropped {:?}", self.id);
    }
}

impl DeviceEngine for Engine {
    type Event = Event;
    fn new(options: DeviceOptions) -> Result<Arc<Self>> {
        let DeviceOptions {
            index,
            compute_units,
            profiling,
        } = options;
        let compute_units = compute_units
            .or_else(|| std::thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get);
        let id = DeviceId {
            index,
            handle: NEXT_HANDLE.fetch_add(1, Ordering::SeqCst),
        };
        let epoch = Instant::now();
        let (op_sender, op_receiver) = crossbeam_channel::unbounded();
        let exited = Arc::new(AtomicUsize::default());
        let mut workers = Vec::with_capacity(compute_units);
        for worker_index in 0..compute_units {
            let worker = Worker {
                id,
                index: worker_index,
                op_receiver: op_receiver.clone(),
                epoch,
                guard: WorkerDropGuard {
                    exited: exited.clone(),
                },
            };
            let handle = std::thread::Builder::new()
                .name(format!("vecadd-device-{index}-worker-{worker_index}"))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }
        let info = Arc::new(DeviceInfo {
            index,
            name: CPU_NAME.clone(),
            compute_units,
            profiling,
        });
        Ok(Arc::new(Self {
            id,
            info,
            epoch,
            op_sender,
            last: Mutex::default(),
            exited,
            workers,
        }))
    }
    fn devices() -> usize {
        1
    }
    fn id(&self) -> DeviceId {
        self.id
    }
    fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    fn wait(&self) -> Result<(), DeviceLost> {
        let last = self.last.lock().clone();
        if let Some(last) = last {
            if !last.wait(&self.exited) {
                return Err(self.device_lost());
            }
        }
        Ok(())
    }
    fn dispatch(&self, range: ExecutionRange, kernel: Arc<dyn KernelFn>) -> Result<Event> {
        let submit = self.now();
        // An empty range still goes through a worker, to keep its place in the queue.
        let workers = self.workers.len().min(range.groups().max(1) as usize);
        let mut last = self.last.lock();
        let dispatch = Arc::new(Dispatch {
            kernel,
            range,
            previous: Mutex::new(last.take()),
            next_group: AtomicU32::default(),
            workers: AtomicUsize::new(workers),
            command_start: AtomicU64::new(u64::MAX),
            command_end: AtomicU64::default(),
            panicked: AtomicBool::default(),
            done: Mutex::new(false),
            condvar: Condvar::new(),
        });
        *last = Some(dispatch.clone());
        log::debug!(
            "{:?} dispatch {} {range:?} on {workers} workers",
            self.id,
            dispatch.kernel.name()
        );
        // Sent under the lock so the queue order matches the chain of dispatches.
        for _ in 0..workers {
            self.op_sender
                .send(dispatch.clone())
                .map_err(|_| self.device_lost())?;
        }
        drop(last);
        Ok(Event {
            id: self.id,
            dispatch,
            submit,
            profiling: self.info.profiling,
            exited: self.exited.clone(),
        })
    }
}

fn nanos_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_nanos() as u64
}

struct Dispatch {
    kernel: Arc<dyn KernelFn>,
    range: ExecutionRange,
    previous: Mutex<Option<Arc<Dispatch>>>,
    next_group: AtomicU32,
    workers: AtomicUsize,
    command_start: AtomicU64,
    command_end: AtomicU64,
    panicked: AtomicBool,
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Dispatch {
    fn run(&self, epoch: Instant, exited: &AtomicUsize) {
        let previous = self.previous.lock().clone();
        if let Some(previous) = previous {
            if !previous.wait(exited) {
                return;
            }
        }
        let groups = self.range.groups();
        let mut started = false;
        let result = catch_unwind(AssertUnwindSafe(|| loop {
            let group_id = self.next_group.fetch_add(1, Ordering::Relaxed);
            if group_id >= groups {
                break;
            }
            if !started {
                started = true;
                self.command_start
                    .fetch_min(nanos_since(epoch), Ordering::SeqCst);
            }
            for kernel in self.range.group(group_id) {
                self.kernel.call(kernel);
            }
        }));
        if result.is_err() {
            self.panicked.store(true, Ordering::SeqCst);
            // Remaining groups are skipped.
            self.next_group.store(groups, Ordering::SeqCst);
        }
        if started {
            self.command_end
                .fetch_max(nanos_since(epoch), Ordering::SeqCst);
        }
        if self.workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish(epoch);
        }
    }
    fn finish(&self, epoch: Instant) {
        if self.command_start.load(Ordering::SeqCst) == u64::MAX {
            let now = nanos_since(epoch);
            self.command_start.store(now, Ordering::SeqCst);
            self.command_end.store(now, Ordering::SeqCst);
        }
        // The previous dispatch is done, unlink it so the chain does not grow.
        self.previous.lock().take();
        let mut done = self.done.lock();
        *done = true;
        self.condvar.notify_all();
    }
    /// Blocks until finished. Returns false if a worker exited first.
    fn wait(&self, exited: &AtomicUsize) -> bool {
        let mut done = self.done.lock();
        while !*done {
            if exited.load(Ordering::SeqCst) > 0 {
                return false;
            }
            self.condvar.wait_for(&mut done, Duration::from_millis(1));
        }
        true
    }
}

pub(super) struct Event {
    id: DeviceId,
    dispatch: Arc<Dispatch>,
    submit: u64,
    profiling: bool,
    exited: Arc<AtomicUsize>,
}

impl DeviceEngineEvent for Event {
    fn wait(&self) -> Result<()> {
        if !self.dispatch.wait(&self.exited) {
            return Err(DeviceLost(self.id).into());
        }
        if self.dispatch.panicked.load(Ordering::SeqCst) {
            return Err(KernelPanicked {
                kernel: self.dispatch.kernel.name(),
            }
            .into());
        }
        Ok(())
    }
    fn is_complete(&self) -> bool {
        *self.dispatch.done.lock()
    }
    fn profiling(&self) -> Result<ProfilingInfo, ProfilingNotEnabled> {
        if !self.profiling {
            return Err(ProfilingNotEnabled);
        }
        // A lost device leaves the stamps of whatever ran.
        self.dispatch.wait(&self.exited);
        let command_start = self.dispatch.command_start.load(Ordering::SeqCst);
        let command_end = self.dispatch.command_end.load(Ordering::SeqCst);
        Ok(ProfilingInfo {
            clock: Clock::Device,
            command_submit: self.submit,
            command_start: command_start.min(command_end),
            command_end,
        })
    }
}

struct Worker {
    id: DeviceId,
    index: usize,
    op_receiver: Receiver<Arc<Dispatch>>,
    epoch: Instant,
    guard: WorkerDropGuard,
}

impl Worker {
    fn run(self) {
        while let Ok(dispatch) = self.op_receiver.recv() {
            log::trace!(
                "{:?} worker {} running {}",
                self.id,
                self.index,
                dispatch.kernel.name()
            );
            dispatch.run(self.epoch, &self.guard.exited);
        }
    }
}

struct WorkerDropGuard {
    exited: Arc<AtomicUsize>,
}

impl Drop for WorkerDropGuard {
    fn drop(&mut self) {
        self.exited.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, GlobalSlice, GlobalSliceMut};
    use vecadd_core::kernel::Kernel;

    struct CountGroups {
        items: AtomicUsize,
    }

    impl KernelFn for CountGroups {
        fn name(&self) -> &'static str {
            "count_groups"
        }
        fn call(&self, kernel: Kernel) {
            if kernel.item_id().is_some() {
                self.items.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Writes `1.0`, stalling on the first item.
    struct SlowFill {
        x: GlobalSliceMut<f32>,
    }

    impl KernelFn for SlowFill {
        fn name(&self) -> &'static str {
            "slow_fill"
        }
        fn call(&self, kernel: Kernel) {
            if let Some(i) = kernel.item_id() {
                if i == 0 {
                    std::thread::sleep(Duration::from_millis(200));
                }
                unsafe { self.x.store(i, 1.0) }
            }
        }
    }

    struct CopyKernel {
        x: GlobalSlice<f32>,
        y: GlobalSliceMut<f32>,
    }

    impl KernelFn for CopyKernel {
        fn name(&self) -> &'static str {
            "copy"
        }
        fn call(&self, kernel: Kernel) {
            if let Some(i) = kernel.item_id() {
                unsafe { self.y.store(i, self.x.load(i)) }
            }
        }
    }

    fn engine(compute_units: usize, profiling: bool) -> Arc<Engine> {
        Engine::new(DeviceOptions {
            index: 0,
            compute_units: NonZeroUsize::new(compute_units),
            profiling,
        })
        .unwrap()
    }

    fn slow_fill(engine: &Engine, x: &mut Buffer<f32>) -> Event {
        let range = ExecutionRange::new(x.len(), 64).unwrap();
        let kernel = Arc::new(SlowFill { x: x.global_mut() });
        engine.dispatch(range, kernel).unwrap()
    }

    #[test_log::test]
    fn dispatch_runs_every_group() {
        let engine = engine(4, true);
        let kernel = Arc::new(CountGroups {
            items: AtomicUsize::default(),
        });
        let range = ExecutionRange::new(10_000, 256).unwrap();
        let event = engine.dispatch(range, kernel.clone()).unwrap();
        event.wait().unwrap();
        assert!(event.is_complete());
        assert_eq!(kernel.items.load(Ordering::SeqCst), 10_000);
        let info = event.profiling().unwrap();
        assert!(info.command_submit() <= info.command_start());
        assert!(info.command_start() <= info.command_end());
        engine.wait().unwrap();
    }

    #[test_log::test]
    fn empty_dispatch_completes() {
        let engine = engine(2, true);
        let kernel = Arc::new(CountGroups {
            items: AtomicUsize::default(),
        });
        let event = engine
            .dispatch(ExecutionRange::new(0, 256).unwrap(), kernel)
            .unwrap();
        event.wait().unwrap();
        assert!(event.is_complete());
        assert_eq!(event.profiling().unwrap().sample().secs(), 0.0);
    }

    #[test_log::test]
    fn dispatches_run_in_order() {
        let engine = engine(4, true);
        let n = 1024;
        let mut x = Buffer::<f32>::zeros(crate::device::Device::host(), n).unwrap();
        let mut y = Buffer::<f32>::zeros(crate::device::Device::host(), n).unwrap();
        let fill = slow_fill(&engine, &mut x);
        let copy = engine
            .dispatch(
                ExecutionRange::new(n, 64).unwrap(),
                Arc::new(CopyKernel {
                    x: x.global(),
                    y: y.global_mut(),
                }),
            )
            .unwrap();
        copy.wait().unwrap();
        assert!(fill.is_complete());
        assert!(y.to_vec().unwrap().iter().all(|y| *y == 1.0));
        let fill = fill.profiling().unwrap();
        let copy = copy.profiling().unwrap();
        assert!(fill.command_end() <= copy.command_start());
    }

    #[test]
    fn wait_blocks_until_done() {
        let engine = engine(2, false);
        let mut x = Buffer::<f32>::zeros(crate::device::Device::host(), 256).unwrap();
        let events: Vec<Event> = (0..3).map(|_| slow_fill(&engine, &mut x)).collect();
        engine.wait().unwrap();
        assert!(events.iter().all(Event::is_complete));
        assert!(x.to_vec().unwrap().iter().all(|x| *x == 1.0));
    }

    #[test]
    fn profiling_waits_for_completion() {
        let engine = engine(2, true);
        let mut x = Buffer::<f32>::zeros(crate::device::Device::host(), 256).unwrap();
        let event = slow_fill(&engine, &mut x);
        let info = event.profiling().unwrap();
        assert!(event.is_complete());
        assert!(info.sample().elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn profiling_disabled() {
        let engine = engine(1, false);
        let kernel = Arc::new(CountGroups {
            items: AtomicUsize::default(),
        });
        let event = engine
            .dispatch(ExecutionRange::new(1, 256).unwrap(), kernel)
            .unwrap();
        event.wait().unwrap();
        assert!(event.profiling().is_err());
    }

    #[test]
    fn drop_joins_workers() {
        let engine = engine(3, false);
        let exited = engine.exited.clone();
        drop(engine);
        assert_eq!(exited.load(Ordering::SeqCst), 3);
    }
}
