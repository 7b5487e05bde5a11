//! Allocating resources and turning them into ready devices.

use {
    crate::{
        device::{Device, POLL_INTERVAL},
        dispatcher::Dispatcher,
        error::{Error, Result},
        events::{EventKind, Flag, Matcher, Subscription, SubscriptionId},
        options::RunOptions,
        resource::{
            AllocationContext, AllocationContextList, Allocator, CopyFlasher, DeviceConstructor,
            DeviceRequirement, Flasher, default_constructors, flash_needed,
        },
    },
    log::{debug, error, info, warn},
    parking_lot::Mutex,
    std::{collections::HashMap, sync::Arc, thread, time::Instant},
};

/// Owns the allocator, the constructor registry and the flasher for runs.
pub struct ResourceProvider {
    allocator: Mutex<Box<dyn Allocator>>,
    constructors: HashMap<String, DeviceConstructor>,
    flasher: Arc<dyn Flasher>,
    flash_cache: Mutex<HashMap<String, String>>,
}

impl ResourceProvider {
    /// Provider with the default constructors and a [`CopyFlasher`].
    pub fn new(allocator: impl Allocator + 'static) -> Self {
        Self {
            allocator: Mutex::new(Box::new(allocator)),
            constructors: default_constructors(),
            flasher: Arc::new(CopyFlasher),
            flash_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the constructor for a device type.
    #[must_use]
    pub fn with_constructor<F>(mut self, kind: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&AllocationContext, &RunOptions) -> Result<Device> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    /// Use `flasher` for hardware devices.
    #[must_use]
    pub fn with_flasher(mut self, flasher: impl Flasher + 'static) -> Self {
        self.flasher = Arc::new(flasher);
        self
    }

    /// Reserve resources for `requirements`.
    pub fn allocate(&self, requirements: &[DeviceRequirement]) -> Result<AllocationContextList> {
        for requirement in requirements {
            if !self.constructors.contains_key(&requirement.kind) {
                return Err(Error::Allocation(format!(
                    "unknown device type '{}'",
                    requirement.kind
                )));
            }
        }
        let contexts = self.allocator.lock().allocate(requirements)?;
        Ok(AllocationContextList::new(contexts, self.constructors.clone()))
    }

    /// Return the reservations in `contexts`.
    pub fn release(&self, contexts: &AllocationContextList) {
        self.allocator.lock().release(contexts.contexts());
    }

    /// Flash (when needed) and construct one device per context.
    ///
    /// With `parallel_flash` each context gets its own worker, otherwise one
    /// worker handles them in order. If any device fails, every device built
    /// so far is closed, the reservations are released, and the error names
    /// each failing index.
    pub fn init_duts(
        &self,
        contexts: &AllocationContextList,
        options: &RunOptions,
    ) -> Result<Vec<Arc<Device>>> {
        let workers = if options.parallel_flash {
            contexts.len().max(1)
        } else {
            1
        };
        debug!("Initializing {} device(s) on {workers} worker(s)", contexts.len());

        let (job_tx, job_rx) = flume::unbounded::<&AllocationContext>();
        for context in contexts.contexts() {
            let _ = job_tx.send(context);
        }
        drop(job_tx);
        let (result_tx, result_rx) = flume::unbounded();

        let spawned = thread::scope(|scope| -> Result<()> {
            for worker in 0..workers {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                thread::Builder::new()
                    .name(format!("dut-init-{worker}"))
                    .spawn_scoped(scope, move || {
                        for context in jobs.iter() {
                            let built = self.init_one(contexts, context, options);
                            let _ = results.send((context.index, built));
                        }
                    })?;
            }
            Ok(())
        });
        drop(result_tx);

        let mut results: Vec<(usize, Result<Device>)> = result_rx.try_iter().collect();
        results.sort_by_key(|(index, _)| *index);

        let mut devices = Vec::with_capacity(results.len());
        let mut reasons = Vec::new();
        if let Err(e) = spawned {
            reasons.push(format!("worker - {e}"));
        }
        for (index, built) in results {
            match built {
                Ok(device) => devices.push(Arc::new(device)),
                Err(e) => reasons.push(format!("DUT index {index} - {e}")),
            }
        }
        if devices.len() < contexts.len() && reasons.is_empty() {
            reasons.push("not every device was initialized".to_string());
        }

        if reasons.is_empty() {
            return Ok(devices);
        }
        for device in &devices {
            if let Err(e) = device.close() {
                warn!("Closing {} after failed init: {e}", device.name());
            }
        }
        self.release(contexts);
        let message = format!(
            "Device initialization failed, reason(s):\n{}",
            reasons.join("\n")
        );
        error!("{message}");
        Err(Error::Allocation(message))
    }

    fn init_one(
        &self,
        contexts: &AllocationContextList,
        context: &AllocationContext,
        options: &RunOptions,
    ) -> Result<Device> {
        self.flash_if_needed(context, options)?;
        contexts.build(context, options)
    }

    fn flash_if_needed(&self, context: &AllocationContext, options: &RunOptions) -> Result<()> {
        if options.skip_flash || context.requirement.kind != "hardware" {
            return Ok(());
        }
        let (Some(binary), Some(resource)) =
            (context.requirement.application.bin.as_deref(), context.resource.as_ref())
        else {
            return Ok(());
        };
        if !binary.is_file() {
            return Err(Error::ResourceInit(format!(
                "binary {} not found",
                binary.display()
            )));
        }
        let hash = self.flasher.content_hash(binary)?;
        let last = self.flash_cache.lock().get(&resource.resource_id).cloned();
        if !flash_needed(last.as_deref(), &hash, options.force_flash) {
            debug!("{} already holds {}", resource.resource_id, binary.display());
            return Ok(());
        }
        if !self.flasher.flash(binary, resource)? {
            return Err(Error::ResourceInit(format!(
                "flashing {} to {} failed",
                binary.display(),
                resource.resource_id
            )));
        }
        self.flash_cache
            .lock()
            .insert(resource.resource_id.clone(), hash);
        Ok(())
    }

    /// Open each device, register it, and wait for its ready line.
    ///
    /// On failure every device is unregistered and closed.
    pub fn open_devices(
        &self,
        devices: &[Arc<Device>],
        dispatcher: &Dispatcher,
        options: &RunOptions,
    ) -> Result<()> {
        let result = open_and_wait(devices, dispatcher, options);
        if result.is_err() {
            for device in devices {
                dispatcher.unregister(device);
                if let Err(e) = device.close() {
                    warn!("Closing {}: {e}", device.name());
                }
            }
        }
        result
    }
}

struct ReadyWait {
    id: SubscriptionId,
    flag: Arc<Flag>,
    matcher: Matcher,
    trigger: String,
}

fn open_and_wait(devices: &[Arc<Device>], dispatcher: &Dispatcher, options: &RunOptions) -> Result<()> {
    let events = dispatcher.events();
    let mut waits: Vec<(&Arc<Device>, Option<ReadyWait>)> = Vec::with_capacity(devices.len());
    let mut outcome = Ok(());
    for device in devices {
        let wait = match ready_subscription(dispatcher, device) {
            Ok(wait) => wait,
            Err(e) => {
                outcome = Err(e);
                break;
            },
        };
        let id = wait.as_ref().map(|w| w.id);
        waits.push((device, wait));
        if let Err(e) = device.open() {
            error!("{} failed to open: {e}", device.name());
            outcome = Err(e);
            break;
        }
        dispatcher.register(device);
        debug!("{} registered (ready wait: {})", device.name(), id.is_some());
    }

    for (device, wait) in waits {
        let Some(wait) = wait else {
            continue;
        };
        if outcome.is_ok() {
            let timeout = device.requirement().ready_timeout(options.ready_timeout());
            info!("Waiting for {} to print '{}'", device.name(), wait.trigger);
            outcome = wait_ready(device, &wait, timeout);
        }
        events.unsubscribe(wait.id);
    }
    outcome
}

fn ready_subscription(dispatcher: &Dispatcher, device: &Device) -> Result<Option<ReadyWait>> {
    let Some(trigger) = device.requirement().application.cli_ready_trigger.clone() else {
        return Ok(None);
    };
    let matcher = Matcher::parse(&trigger)?;
    let flag = Arc::new(Flag::default());
    let id = dispatcher.events().subscribe(
        Subscription::new(EventKind::LineReceived, matcher.clone())
            .with_source(device.index())
            .with_flag(Arc::clone(&flag)),
    );
    Ok(Some(ReadyWait {
        id,
        flag,
        matcher,
        trigger,
    }))
}

fn wait_ready(device: &Device, wait: &ReadyWait, timeout: std::time::Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if wait.flag.wait(POLL_INTERVAL) || device.traces_contain(&wait.matcher) {
            info!("{} is ready", device.name());
            return Ok(());
        }
        if crate::is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        if !device.is_alive() {
            return Err(Error::DeviceConnection(format!(
                "{} died before printing '{}'",
                device.name(),
                wait.trigger
            )));
        }
        if Instant::now() >= deadline {
            return Err(Error::DeviceConnection(format!(
                "{} did not print '{}' within {:.1}s",
                device.name(),
                wait.trigger,
                timeout.as_secs_f64()
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::DeviceInfo,
            resource::{LocalAllocator, ResourceInfo},
            transport::{ScriptedControl, ScriptedTransport},
        },
        std::{
            fs,
            path::Path,
            sync::atomic::{AtomicUsize, Ordering},
        },
    };

    fn scripted(context: &AllocationContext, _: &RunOptions) -> Result<Device> {
        let transport = ScriptedTransport::echo(format!("sim{}", context.index));
        transport.control().emit("booted");
        Ok(Device::new(context.device_info(), context.requirement.clone(), transport))
    }

    fn requirements(count: usize) -> Vec<DeviceRequirement> {
        (0..count)
            .map(|_| DeviceRequirement {
                kind: "scripted".into(),
                ..DeviceRequirement::default()
            })
            .collect()
    }

    #[test]
    fn test_init_failure_closes_and_names_index() {
        let built = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&built);
        let inventory = (1..=5).map(|n| ResourceInfo::new(format!("board{n}"))).collect();
        let provider = ResourceProvider::new(LocalAllocator::new(inventory)).with_constructor(
            "hardware",
            move |context: &AllocationContext, _: &RunOptions| {
                if context.index == 3 {
                    return Err(Error::ResourceInit("board did not enumerate".into()));
                }
                let transport = ScriptedTransport::echo(format!("sim{}", context.index));
                recorded.lock().push(transport.control());
                Ok(Device::new(context.device_info(), context.requirement.clone(), transport))
            },
        );
        let requirements = vec![DeviceRequirement::default(); 5];
        let contexts = provider.allocate(&requirements).unwrap();
        assert!(provider.allocate(&requirements[..1]).is_err());

        let err = provider
            .init_duts(&contexts, &RunOptions::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("DUT index 3 - "), "{message}");
        assert!(!message.contains("DUT index 2"), "{message}");

        let built = built.lock();
        assert_eq!(built.len(), 4);
        assert!(built.iter().all(ScriptedControl::is_closed));
        assert_eq!(provider.allocate(&requirements).unwrap().contexts().len(), 5);
    }

    #[test]
    fn test_parallel_init_keeps_index_order() {
        let provider = ResourceProvider::new(LocalAllocator::default())
            .with_constructor("scripted", scripted);
        let contexts = provider.allocate(&requirements(4)).unwrap();
        let options = RunOptions {
            parallel_flash: true,
            ..RunOptions::default()
        };
        let devices = provider.init_duts(&contexts, &options).unwrap();
        let indexes: Vec<_> = devices.iter().map(|d| d.index()).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_type_is_allocation_error() {
        let provider = ResourceProvider::new(LocalAllocator::default());
        assert!(matches!(
            provider.allocate(&requirements(1)),
            Err(Error::Allocation(_))
        ));
    }

    #[test]
    fn test_open_devices_waits_for_ready_line() {
        let provider = ResourceProvider::new(LocalAllocator::default())
            .with_constructor("scripted", scripted);
        let mut reqs = requirements(2);
        for req in &mut reqs {
            req.application.cli_ready_trigger = Some("booted".into());
        }
        let contexts = provider.allocate(&reqs).unwrap();
        let devices = provider.init_duts(&contexts, &RunOptions::default()).unwrap();
        let dispatcher = Dispatcher::new().unwrap();
        provider
            .open_devices(&devices, &dispatcher, &RunOptions::default())
            .unwrap();
        assert_eq!(dispatcher.devices().len(), 2);
        assert!(dispatcher.events().is_empty());
    }

    #[test]
    fn test_open_devices_ready_timeout_closes_all() {
        let provider = ResourceProvider::new(LocalAllocator::default())
            .with_constructor("scripted", scripted);
        let mut reqs = requirements(2);
        reqs[1].application.cli_ready_trigger = Some("never".into());
        reqs[1].application.cli_ready_trigger_timeout = Some(0);
        let contexts = provider.allocate(&reqs).unwrap();
        let devices = provider.init_duts(&contexts, &RunOptions::default()).unwrap();
        let dispatcher = Dispatcher::new().unwrap();
        let err = provider
            .open_devices(&devices, &dispatcher, &RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::DeviceConnection(_)));
        assert!(devices.iter().all(|d| d.is_closed()));
        assert!(dispatcher.devices().is_empty());
    }

    struct CountingFlasher(Arc<AtomicUsize>);

    impl Flasher for CountingFlasher {
        fn flash(&self, _: &Path, _: &ResourceInfo) -> Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[test]
    fn test_flash_skipped_when_hash_matches() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fw.bin");
        fs::write(&bin, b"image").unwrap();
        let flashes = Arc::new(AtomicUsize::new(0));
        let provider = ResourceProvider::new(LocalAllocator::new(vec![
            ResourceInfo::new("0240").with_platform("K64F"),
        ]))
        .with_flasher(CountingFlasher(Arc::clone(&flashes)))
        .with_constructor("hardware", scripted);
        let mut requirement = DeviceRequirement::default();
        requirement.application.bin = Some(bin);

        for _ in 0..2 {
            let contexts = provider.allocate(std::slice::from_ref(&requirement)).unwrap();
            provider.init_duts(&contexts, &RunOptions::default()).unwrap();
            provider.release(&contexts);
        }
        assert_eq!(flashes.load(Ordering::SeqCst), 1);

        let contexts = provider.allocate(std::slice::from_ref(&requirement)).unwrap();
        let forced = RunOptions {
            force_flash: true,
            ..RunOptions::default()
        };
        provider.init_duts(&contexts, &forced).unwrap();
        assert_eq!(flashes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_flash_binary_fails_init() {
        let provider = ResourceProvider::new(LocalAllocator::new(vec![ResourceInfo::new("0240")]))
            .with_constructor("hardware", scripted);
        let mut requirement = DeviceRequirement::default();
        requirement.application.bin = Some("/nonexistent/fw.bin".into());
        let contexts = provider.allocate(&[requirement]).unwrap();
        let err = provider
            .init_duts(&contexts, &RunOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        // released on failure
        assert!(provider.allocate(&[DeviceRequirement::default()]).is_ok());
    }
}
