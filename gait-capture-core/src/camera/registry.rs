use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::camera::source::CameraSource;
use crate::models::config::CaptureConfig;
use crate::models::error::CaptureError;
use crate::traits::device::{DeviceBackend, DeviceDescriptor};

/// Snapshot of enumerated devices keyed by physical index.
///
/// Refreshed only by explicit operator action (`refresh_detection`,
/// `restart_all`), never implicitly: many consumers calling `start`
/// concurrently must not be able to stampede USB enumeration.
pub struct DetectionCache {
    devices: Mutex<BTreeMap<usize, DeviceDescriptor>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn descriptor(&self, physical_id: usize) -> Option<DeviceDescriptor> {
        self.devices.lock().get(&physical_id).cloned()
    }

    pub fn contains(&self, physical_id: usize) -> bool {
        self.devices.lock().contains_key(&physical_id)
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(usize, DeviceDescriptor)> {
        self.devices
            .lock()
            .iter()
            .map(|(id, descriptor)| (*id, descriptor.clone()))
            .collect()
    }

    /// Replace the cache with a fresh enumeration, assigning physical
    /// indices in enumeration order (index 0 is the first detected
    /// device).
    pub fn replace(&self, devices: Vec<DeviceDescriptor>) {
        let mut map = self.devices.lock();
        map.clear();
        for (physical_id, descriptor) in devices.into_iter().enumerate() {
            map.insert(physical_id, descriptor);
        }
    }
}

impl Default for DetectionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide table of camera sources keyed by physical index.
///
/// Owns startup/shutdown/hard-restart sequencing and the logical-to-
/// physical swap table. Lookups never start hardware: device starts run
/// on detached threads so registry access stays non-blocking.
pub struct CameraRegistry<B: DeviceBackend> {
    backend: Arc<B>,
    config: CaptureConfig,
    detection: Arc<DetectionCache>,
    sources: Mutex<BTreeMap<usize, Arc<CameraSource<B>>>>,
    swapped: AtomicBool,
}

impl<B: DeviceBackend> CameraRegistry<B> {
    /// Build a registry and perform the initial device detection.
    pub fn new(backend: Arc<B>, config: CaptureConfig) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        let registry = Self {
            backend,
            config,
            detection: Arc::new(DetectionCache::new()),
            sources: Mutex::new(BTreeMap::new()),
            swapped: AtomicBool::new(false),
        };
        registry.refresh_detection();
        Ok(registry)
    }

    /// Force re-enumeration of connected devices.
    pub fn refresh_detection(&self) {
        log::info!("refreshing camera detection");
        match self.backend.enumerate() {
            Ok(devices) => {
                for descriptor in &devices {
                    log::info!(
                        "found device {} ({}, USB {})",
                        descriptor.serial,
                        descriptor.model,
                        descriptor.usb_descriptor
                    );
                }
                if devices.is_empty() {
                    log::info!("no cameras detected");
                }
                self.detection.replace(devices);
            }
            Err(e) => {
                log::error!("device enumeration failed: {}", e);
                self.detection.replace(Vec::new());
            }
        }
    }

    pub fn detected(&self) -> Vec<(usize, DeviceDescriptor)> {
        self.detection.snapshot()
    }

    /// Lookup-or-construct; never starts the camera, so callers on a
    /// request path are never blocked by slow hardware initialization.
    pub fn get_or_create(&self, physical_id: usize) -> Arc<CameraSource<B>> {
        let mut sources = self.sources.lock();
        Arc::clone(sources.entry(physical_id).or_insert_with(|| {
            Arc::new(CameraSource::new(
                physical_id,
                Arc::clone(&self.backend),
                Arc::clone(&self.detection),
                self.config.clone(),
            ))
        }))
    }

    /// Start every detected camera, each on its own thread so one
    /// camera's initialization delay never blocks another.
    pub fn startup_all(&self) {
        let detected = self.detection.snapshot();
        if detected.is_empty() {
            log::info!("no cameras detected, nothing to start");
            return;
        }

        log::info!("starting {} camera(s)", detected.len());
        for (physical_id, _) in detected {
            let source = self.get_or_create(physical_id);
            thread::Builder::new()
                .name(format!("camera-start-{physical_id}"))
                .spawn(move || {
                    source.start(None);
                })
                .expect("failed to spawn camera startup thread");
        }
    }

    /// Disruptive recovery: stop every camera, wait for the USB bus to
    /// settle, force re-detection, then start everything again.
    /// Triggered only by explicit operator action.
    pub fn restart_all(&self) {
        log::info!("hard restart: stopping all cameras");

        let sources: Vec<_> = {
            let mut map = self.sources.lock();
            let sources = map.values().cloned().collect();
            map.clear();
            sources
        };
        for source in sources {
            source.stop();
        }

        thread::sleep(self.config.usb_settle);
        self.refresh_detection();
        self.startup_all();

        log::info!("hard restart complete");
    }

    /// Stop every camera and clear the table. Process shutdown only.
    pub fn shutdown_all(&self) {
        log::info!("shutting down all cameras");
        let sources: Vec<_> = {
            let mut map = self.sources.lock();
            let sources = map.values().cloned().collect();
            map.clear();
            sources
        };
        for source in sources {
            source.stop();
        }
        log::info!("all cameras shut down");
    }

    /// Swap the logical-to-physical mapping of the two rig cameras, so a
    /// cabling mix-up can be corrected without touching file naming.
    pub fn set_swapped(&self, swapped: bool) {
        self.swapped.store(swapped, Ordering::SeqCst);
    }

    pub fn is_swapped(&self) -> bool {
        self.swapped.load(Ordering::SeqCst)
    }

    /// Map a logical camera id (determines file naming and view label)
    /// to the physical device index.
    pub fn physical_for(&self, logical_id: usize) -> usize {
        if self.is_swapped() && logical_id < 2 {
            1 - logical_id
        } else {
            logical_id
        }
    }
}
