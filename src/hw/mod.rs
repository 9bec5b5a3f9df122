mod btleplug_backend;
mod discovery;
mod fake_backend;
mod model;
mod transport;

pub use self::btleplug_backend::BtleplugTransport;
pub(crate) use self::discovery::resolve_channels;
pub(crate) use self::fake_backend::parse_box;
pub use self::fake_backend::{
    FakeTransport, FakeTransportConfig, FakeUpdate, FakeUpdates, ScanFixture,
};
pub use self::model::{CharacteristicInfo, CharacteristicRef, DeviceIdentity, ServiceInfo};
pub use self::transport::{AdvertisementStream, DisconnectStream, NotificationStream, Transport};
