//! Full republish: discovery catalog first, then every state topic the
//! device can answer for.

use sma_proto::catalog;
use sma_proto::eq::BAND_COUNT;
use sma_proto::keys;
use sma_proto::protocol::{channel_object, channel_suffixed, eq_band_object, EntityKind};
use tracing::{debug, warn};

use crate::session::Session;

pub async fn republish_all(session: &Session) {
    publish_catalog(session).await;
    publish_settings(session).await;
    publish_mixer_state(session).await;
    publish_player_names(session).await;
}

pub async fn publish_catalog(session: &Session) {
    let entities = catalog::build(session.topics(), session.device.channel_count());
    for entity in &entities {
        let topic = entity.config_topic(session.topics());
        session.publish(&topic, &entity.doc.to_string(), true).await;
    }
    debug!("publish: {} catalog entries", entities.len());
}

/// Settings kept in the store, echoed back as text entity states.
pub async fn publish_settings(session: &Session) {
    let store = session.store();
    let mut states: Vec<(String, String)> = [
        ("gpio_psu_relay", psu_relay_state(session)),
        ("gpio_mute", store.read_or_empty(keys::GPIO_MUTE_LIST)),
        ("gpio_usb_dac", store.read_or_empty(keys::GPIO_USB_POWER)),
        ("gpio_sps", sps_state(session)),
        ("backup_host", backup_host_state(session)),
        ("backup_password", store.read_or_empty(keys::BACKUP_SSH_PASSWORD)),
        ("backup_folder", store.read_or_empty(keys::BACKUP_SSH_FOLDER)),
        ("hass_host", store.read_or_empty(keys::HASS_HOST)),
        ("hass_bearer", store.read_or_empty(keys::HASS_BEARER)),
        ("mqtt_host", mqtt_host_state(session)),
        ("mqtt_password", store.read_or_empty(keys::MQTT_PASSWORD)),
        ("lms_host", store.read_or_empty(keys::LMS_HOST)),
    ]
    .into_iter()
    .map(|(object, payload)| (object.to_string(), payload))
    .collect();

    for channel in 1..=session.device.channel_count() {
        states.push((
            channel_suffixed(channel, "hass_switch"),
            store.read_or_empty(&keys::hass_switch(channel)),
        ));
    }

    for (object, payload) in &states {
        session.publish_state(EntityKind::Text, object, payload).await;
    }
}

/// `relay;onDelay;downDelay`
pub fn psu_relay_state(session: &Session) -> String {
    let store = session.store();
    [
        keys::GPIO_PSU_RELAY,
        keys::PSU_POWER_ON_DELAY,
        keys::PSU_POWER_DOWN_DELAY,
    ]
    .iter()
    .map(|k| store.read_or_empty(k))
    .collect::<Vec<_>>()
    .join(";")
}

/// Per-channel speaker switch lines, `;`-joined.
pub fn sps_state(session: &Session) -> String {
    let store = session.store();
    (1..=session.device.channel_count())
        .map(|ch| store.read_or_empty(&keys::gpio_sps(ch)))
        .collect::<Vec<_>>()
        .join(";")
}

/// `user@host:port`, empty when no host is set.
pub fn backup_host_state(session: &Session) -> String {
    let store = session.store();
    match store.read(keys::BACKUP_SSH_HOST) {
        Some(host) => format!(
            "{}@{}:{}",
            store.read_or_empty(keys::BACKUP_SSH_USER),
            host,
            store.read(keys::BACKUP_SSH_PORT).unwrap_or_else(|| "22".to_string())
        ),
        None => String::new(),
    }
}

/// `[user@]host:port`
pub fn mqtt_host_state(session: &Session) -> String {
    let store = session.store();
    let host = store.read_or_empty(keys::MQTT_HOST);
    match store.read(keys::MQTT_USER) {
        Some(user) => format!("{}@{}", user, host),
        None => host,
    }
}

/// Volume and equalizer bands per channel, read from the mixer. A channel
/// whose mixer cannot be read keeps its topics untouched.
pub async fn publish_mixer_state(session: &Session) {
    let mixer = &session.services.mixer;
    let channels = &session.device.channels;

    for channel in 1..=session.device.channel_count() {
        match mixer.get_volume(channel).await {
            Ok(volume) => {
                channels.set_volume(channel, volume).await;
                session
                    .publish_state(
                        EntityKind::Number,
                        &channel_suffixed(channel, "volume"),
                        &volume.to_string(),
                    )
                    .await;
            }
            Err(e) => warn!("publish: volume of channel {}: {}", channel, e),
        }

        match mixer.get_equalizer(channel).await {
            Ok(values) => {
                channels.set_equalizer(channel, values).await;
                publish_equalizer(session, channel, &values).await;
            }
            Err(e) => warn!("publish: equalizer of channel {}: {}", channel, e),
        }
    }
}

pub async fn publish_equalizer(session: &Session, channel: u8, values: &[i32; BAND_COUNT]) {
    for (band, value) in values.iter().enumerate() {
        session
            .publish_state(
                EntityKind::Number,
                &eq_band_object(channel, band as u8),
                &value.to_string(),
            )
            .await;
    }
}

pub async fn publish_player_names(session: &Session) {
    for ch in session.device.channels.snapshot().await {
        if let Some(name) = &ch.player_name {
            session
                .publish_state(
                    EntityKind::Text,
                    &channel_suffixed(ch.number, "player_name"),
                    name,
                )
                .await;
        }
    }
}

pub async fn publish_containers_off(session: &Session) {
    session
        .publish_state(EntityKind::BinarySensor, "supervisor", "OFF")
        .await;
    for channel in 1..=session.device.channel_count() {
        session
            .publish_state(EntityKind::BinarySensor, &channel_object(channel), "OFF")
            .await;
    }
}
