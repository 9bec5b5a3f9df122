use serde::Serialize;
use serde_with::skip_serializing_none;

/// A peripheral seen during a discovery sweep.
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DeviceIdentity {
    device_id: String,
    local_name: Option<String>,
    rssi: Option<i16>,
}

impl DeviceIdentity {
    /// Creates a discovered-device record.
    #[must_use]
    pub fn new(device_id: impl Into<String>, local_name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            device_id: device_id.into(),
            local_name,
            rssi,
        }
    }

    /// Returns the backend-specific device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the signal strength observed with the advertisement, if present.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns whether the advertised name is exactly `name`.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.local_name.as_deref() == Some(name)
    }
}

/// Addresses one characteristic inside one service.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct CharacteristicRef {
    service_uuid: String,
    uuid: String,
}

impl CharacteristicRef {
    #[must_use]
    pub fn new(service_uuid: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            service_uuid: service_uuid.into().to_ascii_lowercase(),
            uuid: uuid.into().to_ascii_lowercase(),
        }
    }

    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// A characteristic description discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicInfo {
    uuid: String,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    /// Creates a characteristic description from lowercase property labels.
    #[must_use]
    pub fn new(uuid: impl Into<String>, properties: Vec<String>) -> Self {
        Self {
            uuid: uuid.into(),
            properties,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub(crate) fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }
}

/// A GATT service with discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceInfo {
    uuid: String,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    #[must_use]
    pub fn new(uuid: impl Into<String>, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid: uuid.into(),
            characteristics,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }
}
