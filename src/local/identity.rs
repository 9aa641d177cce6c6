//! Device identity: one persisted random token per installation

use super::LocalStore;
use crate::types::DeviceId;
use rand::RngCore;

/// Bytes of randomness in a generated device id (128 bits)
const DEVICE_ID_BYTES: usize = 16;

/// The current device's identity and whether it survives a restart
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    id: DeviceId,
    persisted: bool,
}

impl DeviceIdentity {
    /// Return the persisted id, or generate, persist and return a new one
    ///
    /// When storage is unusable the id is volatile: duplicate votes are then
    /// only prevented within this session.
    pub fn get_or_create(store: &dyn LocalStore) -> Self {
        match store.load() {
            Ok(Some(record)) => {
                if let Some(id) = record.device_id {
                    return Self {
                        id,
                        persisted: true,
                    };
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Local storage unavailable, using volatile device id: {}", e);
                return Self::volatile();
            }
        }

        let id = Self::generate();
        match store.update(&mut |record| record.device_id = Some(id.clone())) {
            Ok(_) => {
                tracing::info!("New device id generated: {}", id.short());
                Self {
                    id,
                    persisted: true,
                }
            }
            Err(e) => {
                tracing::warn!("Cannot persist device id, it will not survive restart: {}", e);
                Self {
                    id,
                    persisted: false,
                }
            }
        }
    }

    /// A fresh id that is never written anywhere
    pub fn volatile() -> Self {
        Self {
            id: Self::generate(),
            persisted: false,
        }
    }

    /// Generate a new random hex id
    pub fn generate() -> DeviceId {
        let mut bytes = [0u8; DEVICE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        DeviceId::from_trusted(hex::encode(bytes))
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}
