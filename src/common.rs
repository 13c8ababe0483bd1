use uuid::Uuid;

const THINGY_BASE_UUID: u128 = 0xEF680000_9B35_4933_9B10_52FFA9740042;

/// Builds a UUID from the Thingy base format `EF68XXXX-9B35-4933-9B10-52FFA9740042`,
/// where `XXXX` is the given 16-bit identifier.
pub const fn thingy_uuid(identifier: u16) -> Uuid {
    Uuid::from_u128(THINGY_BASE_UUID | ((identifier as u128) << 96))
}

pub mod services {
    use super::thingy_uuid;
    use uuid::Uuid;

    /// Thingy user interface service.
    pub const USER_INTERFACE: Uuid = thingy_uuid(0x0300);
}

pub mod characteristics {
    use super::thingy_uuid;
    use uuid::Uuid;

    pub const LED: Uuid = thingy_uuid(0x0301);
    pub const BUTTON: Uuid = thingy_uuid(0x0302);
}
