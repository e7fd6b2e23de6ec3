//! Process-lifetime cache of open controller connections.
//!
//! A [`Registry`] is created once by the composition root and handed to the
//! pin factory. Every pin addressing the same chip or bus/address shares the
//! handle stored here; nothing is ever closed before process exit.

use std::hash::Hash;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::ads1015::Ads1015;
use crate::backend::chardev::GpioChip;
use crate::config::HardwareConfig;
use crate::error::GatewayError;

pub struct ConnectionCache<K, V> {
    entries: Mutex<FxHashMap<K, Arc<V>>>,
}

impl<K, V> Default for ConnectionCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<K: Eq + Hash, V> ConnectionCache<K, V> {
    /// Returns the cached handle for `key`, calling `open` only when none exists.
    ///
    /// The lock is held across `open` so two racing callers can never open the
    /// same key twice.
    pub fn get_or_open<F>(&self, key: K, open: F) -> Result<Arc<V>, GatewayError>
    where
        F: FnOnce() -> Result<V, GatewayError>,
    {
        let mut entries = self.entries.lock();
        if let Some(handle) = entries.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(open()?);
        entries.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Registry {
    settings: HardwareConfig,
    chips: ConnectionCache<u32, GpioChip>,
    converters: ConnectionCache<(u32, u8), Ads1015>,
}

impl Registry {
    pub fn new(settings: HardwareConfig) -> Self {
        Self {
            settings,
            chips: ConnectionCache::default(),
            converters: ConnectionCache::default(),
        }
    }

    pub fn settings(&self) -> &HardwareConfig {
        &self.settings
    }

    pub fn gpio_chip(&self, chip: u32) -> Result<Arc<GpioChip>, GatewayError> {
        self.chips.get_or_open(chip, || {
            let path = self.settings.dev_root.join(format!("gpiochip{chip}"));
            let handle = GpioChip::open(&path)?;
            info!(
                "Opened {} ({}, {} lines, {:?} ABI)",
                path.display(),
                handle.label(),
                handle.lines(),
                handle.abi()
            );
            Ok(handle)
        })
    }

    pub fn converter(&self, address: u8) -> Result<Arc<Ads1015>, GatewayError> {
        let bus = self.settings.i2c_bus;
        self.converters.get_or_open((bus, address), || {
            let path = self.settings.dev_root.join(format!("i2c-{bus}"));
            let handle = Ads1015::open(&path, address)?;
            info!("Claimed I2C address {address:#04x} on {}", path.display());
            Ok(handle)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn same_key_shares_one_handle() {
        let cache: ConnectionCache<(u32, u8), String> = ConnectionCache::default();
        let opens = Cell::new(0);
        let open = || {
            opens.set(opens.get() + 1);
            Ok("bus".to_string())
        };

        let first = cache.get_or_open((1, 0x48), open).unwrap();
        let second = cache.get_or_open((1, 0x48), open).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opens.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_keys_open_separately() {
        let cache: ConnectionCache<u32, u32> = ConnectionCache::default();
        let a = cache.get_or_open(0, || Ok(0)).unwrap();
        let b = cache.get_or_open(1, || Ok(1)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_open_is_not_cached() {
        let cache: ConnectionCache<u32, u32> = ConnectionCache::default();
        let err = cache.get_or_open(3, || Err(GatewayError::Config("no bus".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_open(3, || Ok(7)).unwrap(), 7);
    }
}
