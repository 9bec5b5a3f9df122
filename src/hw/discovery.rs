use std::collections::HashMap;

use tracing::instrument;

use super::model::{CharacteristicInfo, CharacteristicRef, ServiceInfo};
use crate::error::DiscoveryError;
use crate::protocol::{self, ChannelId, RequiredProperties};

/// Binds every known channel to a discovered characteristic.
///
/// A channel binds only when its service and characteristic are both present
/// and the characteristic carries every property the channel needs.
#[instrument(skip(services), level = "debug", fields(service_count = services.len()))]
pub(crate) fn resolve_channels(
    services: &[ServiceInfo],
) -> Result<HashMap<ChannelId, CharacteristicRef>, DiscoveryError> {
    let mut resolved = HashMap::new();
    let mut missing = Vec::new();

    for channel in protocol::known_channels() {
        let metadata = protocol::channel_metadata(channel);
        let bound = find_service(services, metadata.service_uuid())
            .and_then(|service| {
                find_characteristic(service, metadata.characteristic_uuid())
                    .map(|characteristic| (service, characteristic))
            })
            .filter(|(_service, characteristic)| supports(characteristic, metadata.required()));

        match bound {
            Some((service, characteristic)) => {
                resolved.insert(
                    channel,
                    CharacteristicRef::new(service.uuid(), characteristic.uuid()),
                );
            }
            None => missing.push(channel),
        }
    }

    if missing.is_empty() {
        return Ok(resolved);
    }

    Err(DiscoveryError::MissingChannels {
        missing: format_missing_channels(&missing),
    })
}

fn find_service<'a>(services: &'a [ServiceInfo], uuid: &str) -> Option<&'a ServiceInfo> {
    services
        .iter()
        .find(|service| service.uuid().eq_ignore_ascii_case(uuid))
}

fn find_characteristic<'a>(service: &'a ServiceInfo, uuid: &str) -> Option<&'a CharacteristicInfo> {
    service
        .characteristics()
        .iter()
        .find(|characteristic| characteristic.uuid().eq_ignore_ascii_case(uuid))
}

fn supports(characteristic: &CharacteristicInfo, required: RequiredProperties) -> bool {
    let readable = characteristic.has_property("read");
    let writable = characteristic.has_property("write");
    let notifiable =
        characteristic.has_property("notify") || characteristic.has_property("indicate");

    (!required.read || readable) && (!required.write || writable) && (!required.notify || notifiable)
}

fn format_missing_channels(channels: &[ChannelId]) -> String {
    channels
        .iter()
        .map(|channel| {
            let metadata = protocol::channel_metadata(*channel);
            format!("{} ({})", metadata.name(), metadata.characteristic_uuid())
        })
        .collect::<Vec<_>>()
        .join(", ")
}
