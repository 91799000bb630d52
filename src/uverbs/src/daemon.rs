use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::Config;
use crate::control::ControlChannel;
use crate::device::Device;
use crate::driver::Driver;
use crate::log;
use crate::Error;

/// Owns the driver and the devices for the lifetime of the process. Every context created by the
/// control channel borrows one of these devices.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    driver: Arc<Driver>,
    devices: Vec<Device>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let driver = Arc::new(Driver::new(&config.driver)?);
        let devices: Vec<_> = config
            .devices
            .iter()
            .map(|dev| Device::new(&dev.name, Arc::clone(&driver), &config.driver))
            .collect();
        log::info!(
            "{} driver with {} workers, devices: {:?}",
            driver.name(),
            config.driver.workers,
            devices.iter().map(Device::name).collect::<Vec<_>>()
        );
        Ok(Daemon {
            config,
            driver,
            devices,
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Serves clients until `exit_flag` is raised. All client resources are released before this
    /// returns.
    pub fn run(&self, exit_flag: &AtomicBool) -> Result<(), Error> {
        fs::create_dir_all(&self.config.control.prefix)?;
        let path = self.config.socket_path();
        let mut control =
            ControlChannel::bind(&path, &self.devices, self.config.control.request_timeout())?;
        log::info!("[Daemon] Listening on {}", path.display());
        control.mainloop(exit_flag)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.driver.shutdown();
    }
}
