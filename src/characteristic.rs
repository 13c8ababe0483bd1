use btleplug::api::{CharPropFlags, WriteType};
use uuid::Uuid;

use crate::radio::{GattRequest, Generation};

/// A characteristic reported by characteristic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

impl DiscoveredCharacteristic {
    pub fn new(uuid: Uuid, properties: CharPropFlags) -> Self {
        Self { uuid, properties }
    }
}

/// A discovered characteristic bound to the connection that found it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CharacteristicHandle {
    characteristic: DiscoveredCharacteristic,
    generation: Generation,
}

impl CharacteristicHandle {
    pub(crate) fn new(characteristic: DiscoveredCharacteristic, generation: Generation) -> Self {
        Self {
            characteristic,
            generation,
        }
    }

    #[inline]
    pub(crate) fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    #[inline]
    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.characteristic.properties.contains(CharPropFlags::READ)
    }

    pub(crate) fn is_notifiable(&self) -> bool {
        self.characteristic.properties.contains(CharPropFlags::NOTIFY)
    }

    /// Preferred write mode: acknowledged writes win over unacknowledged ones.
    pub(crate) fn write_type(&self) -> Option<WriteType> {
        let properties = self.characteristic.properties;
        if properties.contains(CharPropFlags::WRITE) {
            Some(WriteType::WithResponse)
        } else if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            Some(WriteType::WithoutResponse)
        } else {
            None
        }
    }

    pub(crate) fn read(&self) -> GattRequest {
        GattRequest::Read {
            characteristic: self.uuid(),
        }
    }

    pub(crate) fn write(&self, value: &[u8], write_type: WriteType) -> GattRequest {
        GattRequest::Write {
            characteristic: self.uuid(),
            value: value.to_vec(),
            write_type,
        }
    }

    pub(crate) fn subscribe(&self) -> GattRequest {
        GattRequest::SetNotify {
            characteristic: self.uuid(),
            enable: true,
        }
    }
}

/// Single byte payload of the LED characteristic.
pub fn encode_flag(on: bool) -> [u8; 1] {
    [if on { 0x01 } else { 0x00 }]
}

/// Decodes an LED or button payload. Only `0x01` in the first byte means on/pressed.
pub fn decode_flag(value: &[u8]) -> bool {
    value.first() == Some(&0x01)
}
