//! Refcounted launch/shutdown of a process-shared embedded driver.

use crate::control_plane::delete_driver_directory;
use crate::driver::MediaDriver;
use crate::error::AeronError;
use crate::observability::events;
use std::sync::{Arc, Mutex};
use tracing::info;

enum DriverState {
    NotStarted,
    Started {
        count: usize,
        driver: Arc<dyn MediaDriver>,
    },
    ShuttingDown,
}

/// Serializes embedded-driver lifecycle across every user in one process.
///
/// `launch_with` hands out the shared driver, counting users; `shutdown`
/// counts them back down and performs the real shutdown (close plus
/// directory deletion) only when the last user leaves. Launching while the
/// final shutdown is in flight fails rather than racing it.
pub struct DriverManager {
    state: Mutex<DriverState>,
}

impl DriverManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DriverState::NotStarted),
        }
    }

    /// Returns the shared driver, launching it through `factory` on first
    /// use.
    pub fn launch_with(
        &self,
        factory: impl FnOnce() -> Result<Arc<dyn MediaDriver>, AeronError>,
    ) -> Result<Arc<dyn MediaDriver>, AeronError> {
        let mut state = self.state.lock().expect("driver manager state poisoned");
        match &mut *state {
            DriverState::NotStarted => {
                let driver = factory()?;
                info!(event = events::DRIVER_LAUNCHED, "embedded driver launched");
                *state = DriverState::Started {
                    count: 1,
                    driver: driver.clone(),
                };
                Ok(driver)
            }
            DriverState::Started { count, driver } => {
                *count += 1;
                Ok(driver.clone())
            }
            DriverState::ShuttingDown => Err(AeronError::Driver(
                "embedded driver is shutting down".to_string(),
            )),
        }
    }

    /// Releases one launch. Returns `true` when this call performed the
    /// final shutdown.
    pub fn shutdown(&self) -> bool {
        let driver = {
            let mut state = self.state.lock().expect("driver manager state poisoned");
            match &mut *state {
                DriverState::Started { count, driver } => {
                    *count -= 1;
                    if *count > 0 {
                        return false;
                    }
                    let driver = driver.clone();
                    *state = DriverState::ShuttingDown;
                    driver
                }
                _ => return false,
            }
        };

        driver.close();
        if let Some(directory) = driver.directory() {
            delete_driver_directory(&directory);
        }
        info!(event = events::DRIVER_SHUTDOWN, "embedded driver shut down");

        let mut state = self.state.lock().expect("driver manager state poisoned");
        *state = DriverState::NotStarted;
        true
    }
}

impl Default for DriverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DriverManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("driver manager state poisoned");
        if let DriverState::Started { driver, .. } = &*state {
            driver.close();
            if let Some(directory) = driver.directory() {
                delete_driver_directory(&directory);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DriverManager;
    use crate::channel_uri::ChannelUri;
    use crate::driver::{DriverPublication, DriverSubscription, MediaDriver};
    use crate::error::AeronError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingDriver {
        closes: AtomicUsize,
    }

    impl MediaDriver for CountingDriver {
        fn add_publication(
            &self,
            _channel: &ChannelUri,
            _stream_id: i32,
        ) -> Result<Box<dyn DriverPublication>, AeronError> {
            Err(AeronError::Driver("not used in tests".to_string()))
        }

        fn add_subscription(
            &self,
            _channel: &ChannelUri,
            _stream_id: i32,
        ) -> Result<Box<dyn DriverSubscription>, AeronError> {
            Err(AeronError::Driver("not used in tests".to_string()))
        }

        fn directory(&self) -> Option<PathBuf> {
            None
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn launches_are_refcounted_and_shutdown_is_final_only_at_zero() {
        let manager = DriverManager::new();
        let driver = Arc::new(CountingDriver::default());
        let probe = driver.clone();

        let first = manager.launch_with(|| Ok(driver)).unwrap();
        let second = manager.launch_with(|| panic!("factory re-run")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(!manager.shutdown());
        assert_eq!(probe.closes.load(Ordering::Relaxed), 0);

        assert!(manager.shutdown());
        assert_eq!(probe.closes.load(Ordering::Relaxed), 1);

        // back to a launchable state
        assert!(!manager.shutdown());
        let relaunched = manager.launch_with(|| Ok(Arc::new(CountingDriver::default())));
        assert!(relaunched.is_ok());
    }
}
