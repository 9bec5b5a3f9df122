mod channel;
mod device;
mod observed;
mod state;

pub use self::channel::{CharacteristicChannel, SubscriptionHandle, Subscriptions};
pub use self::device::{DeviceSession, SessionConfig};
pub use self::observed::{CharacteristicHandle, DEFAULT_MESSAGE, ObservedValue, SessionSnapshot};
pub use self::state::{SessionEvent, SessionState};
