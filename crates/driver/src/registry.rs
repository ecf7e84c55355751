//! Process-wide adapter registry
//!
//! Maps a device's bus location to its shared state so the power dispatch
//! filter can find the owning session from any thread. Entries are removed
//! when the [`Registration`] guard returned by [`register`] drops.

use crate::error::{DriverError, Result};
use crate::power::{PowerDisposition, PowerRequest};
use crate::state::DeviceState;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterKey {
    pub bus: u8,
    pub address: u8,
    pub interface: u8,
}

type AdapterMap = HashMap<AdapterKey, Arc<DeviceState>>;

static ADAPTERS: LazyLock<RwLock<AdapterMap>> = LazyLock::new(|| RwLock::new(HashMap::new()));

/// Removes its adapter from the registry on drop
#[derive(Debug)]
pub struct Registration {
    key: AdapterKey,
}

impl Registration {
    pub fn key(&self) -> AdapterKey {
        self.key
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = ADAPTERS
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        if removed.is_some() {
            debug!("Deregistered adapter {:?}", self.key);
        }
    }
}

/// Register `state` under `key`; a key can only be registered once
pub fn register(key: AdapterKey, state: Arc<DeviceState>) -> Result<Registration> {
    let mut adapters = ADAPTERS.write().unwrap_or_else(PoisonError::into_inner);
    if adapters.contains_key(&key) {
        warn!("Adapter {:?} already registered", key);
        return Err(DriverError::DeviceBusy);
    }
    adapters.insert(key, state);
    debug!("Registered adapter {:?}", key);
    Ok(Registration { key })
}

pub fn lookup(key: AdapterKey) -> Option<Arc<DeviceState>> {
    ADAPTERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .cloned()
}

/// Classify a power request arriving for `key`
///
/// A set-device-power that matches a pending self-originated record
/// consumes that record.
pub fn filter_power_request(key: AdapterKey, request: &PowerRequest) -> PowerDisposition {
    let Some(state) = lookup(key) else {
        return PowerDisposition::NotOurs;
    };

    match request {
        PowerRequest::SetDevice(level) if state.power_requests().match_and_release(*level) => {
            debug!("Self-originated {:?} request for {:?}", level, key);
            PowerDisposition::SelfOriginated
        }
        _ => PowerDisposition::Forward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MuxConfig;
    use common::DevicePower;

    fn key(address: u8) -> AdapterKey {
        AdapterKey {
            bus: 200,
            address,
            interface: 0,
        }
    }

    fn state() -> Arc<DeviceState> {
        Arc::new(DeviceState::new(MuxConfig::default(), "modem0", 2))
    }

    #[test]
    fn test_registration_removed_on_drop() {
        let k = key(1);
        {
            let _reg = register(k, state()).unwrap();
            assert!(lookup(k).is_some());
            assert!(matches!(register(k, state()), Err(DriverError::DeviceBusy)));
        }
        assert!(lookup(k).is_none());
        let _again = register(k, state()).unwrap();
    }

    #[test]
    fn test_filter_unknown_adapter() {
        assert_eq!(
            filter_power_request(key(2), &PowerRequest::SetDevice(DevicePower::D2)),
            PowerDisposition::NotOurs
        );
    }

    #[test]
    fn test_filter_self_originated() {
        let k = key(3);
        let s = state();
        let _reg = register(k, s.clone()).unwrap();

        s.power_requests().push_pending(DevicePower::D2).unwrap();
        assert_eq!(s.power_requests().free_count(), 1);

        assert_eq!(
            filter_power_request(k, &PowerRequest::SetDevice(DevicePower::D3)),
            PowerDisposition::Forward
        );
        assert_eq!(
            filter_power_request(k, &PowerRequest::SetDevice(DevicePower::D2)),
            PowerDisposition::SelfOriginated
        );
        assert_eq!(s.power_requests().free_count(), 2);
        assert_eq!(
            filter_power_request(k, &PowerRequest::SetDevice(DevicePower::D2)),
            PowerDisposition::Forward
        );
    }
}
