use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// Advertised local name of the peripheral firmware.
pub const DEFAULT_DEVICE_NAME: &str = "BLEExample";

/// Service that owns every synchronised characteristic.
pub const SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";
/// Text-valued characteristic pushed by the peripheral.
pub const MESSAGE_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";
/// Boolean characteristic written by the central and echoed by the peripheral.
pub const BOX_UUID: &str = "beb5483e-36e1-4689-b7f5-ea07361b26a8";

/// Remote values synchronised with the peripheral.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    /// Free-form text published by the peripheral.
    #[strum(to_string = "message")]
    Message,
    /// Two-state checkbox value.
    #[strum(to_string = "box")]
    Box,
}

/// GATT properties a channel needs from its characteristic.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct RequiredProperties {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) notify: bool,
}

/// Descriptive metadata for one channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct ChannelMetadata {
    name: &'static str,
    service_uuid: &'static str,
    characteristic_uuid: &'static str,
    subscription_name: &'static str,
    required: RequiredProperties,
}

impl ChannelMetadata {
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    pub(crate) fn service_uuid(self) -> &'static str {
        self.service_uuid
    }

    pub(crate) fn characteristic_uuid(self) -> &'static str {
        self.characteristic_uuid
    }

    /// Name under which the observation subscription is registered and cancelled.
    pub(crate) fn subscription_name(self) -> &'static str {
        self.subscription_name
    }

    pub(crate) fn required(self) -> RequiredProperties {
        self.required
    }
}

/// Returns all synchronised channels in a stable order.
pub(crate) fn known_channels() -> impl Iterator<Item = ChannelId> {
    ChannelId::iter()
}

/// Finds the channel bound to a characteristic UUID.
pub(crate) fn channel_for_uuid(uuid: &str) -> Option<ChannelId> {
    known_channels().find(|channel| {
        channel_metadata(*channel)
            .characteristic_uuid()
            .eq_ignore_ascii_case(uuid)
    })
}

/// Returns metadata for one channel.
pub(crate) const fn channel_metadata(channel: ChannelId) -> ChannelMetadata {
    match channel {
        ChannelId::Message => ChannelMetadata {
            name: "message",
            service_uuid: SERVICE_UUID,
            characteristic_uuid: MESSAGE_UUID,
            subscription_name: "messagetransaction",
            required: RequiredProperties {
                read: true,
                write: false,
                notify: true,
            },
        },
        ChannelId::Box => ChannelMetadata {
            name: "box value",
            service_uuid: SERVICE_UUID,
            characteristic_uuid: BOX_UUID,
            subscription_name: "boxtransaction",
            required: RequiredProperties {
                read: true,
                write: true,
                notify: true,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ChannelId::Message, "messagetransaction")]
    #[case(ChannelId::Box, "boxtransaction")]
    fn each_channel_has_a_distinct_subscription_name(
        #[case] channel: ChannelId,
        #[case] expected: &str,
    ) {
        assert_eq!(expected, channel_metadata(channel).subscription_name());
    }

    #[test]
    fn channel_lookup_ignores_uuid_case() {
        assert_eq!(
            Some(ChannelId::Box),
            channel_for_uuid("BEB5483E-36E1-4689-B7F5-EA07361B26A8")
        );
        assert_eq!(None, channel_for_uuid(SERVICE_UUID));
    }

    #[test]
    fn box_metadata_is_available_at_compile_time() {
        const BOX: ChannelMetadata = channel_metadata(ChannelId::Box);
        assert_eq!(BOX_UUID, BOX.characteristic_uuid());
        assert!(BOX.required().write);
    }

    #[test]
    fn all_channels_live_in_the_same_service() {
        for channel in known_channels() {
            assert_eq!(SERVICE_UUID, channel_metadata(channel).service_uuid());
        }
    }
}
