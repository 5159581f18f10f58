//! Command handlers, one per `<verb>_<action>` key.
//!
//! Each handler applies the command through the collaborators, persists
//! what needs persisting and publishes the resulting state. Errors bubble up
//! to the router, which logs and drops them.

use anyhow::{anyhow, bail, Context};
use sma_proto::eq::{self, BAND_COUNT, BAND_MAX, BAND_MIN};
use sma_proto::keys;
use sma_proto::protocol::{channel_suffixed, eq_band_object, Command, EntityKind};
use sma_proto::state::container_name;
use tracing::{debug, info, warn};

use crate::gpio;
use crate::publish;
use crate::session::Session;

/// Whether a handler actually did its work; follow-up actions only run for
/// applied commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Skipped,
}

pub type HandlerResult = anyhow::Result<Outcome>;

const DEFAULT_LMS_PORT: &str = "9000";
const DEFAULT_MQTT_PORT: &str = "1883";
const DEFAULT_HASS_PORT: &str = "8123";
const DEFAULT_SSH_PORT: &str = "22";

// ── do ────────────────────────────────────────────────────────────────────────

pub async fn do_shutdown(s: &Session, _cmd: &Command) -> HandlerResult {
    info!("handlers: shutting down the host");
    quiesce(s).await;
    s.services.power.power_off().await?;
    Ok(Outcome::Applied)
}

pub async fn do_restart(s: &Session, _cmd: &Command) -> HandlerResult {
    info!("handlers: rebooting the host");
    quiesce(s).await;
    s.services.power.reboot().await?;
    Ok(Outcome::Applied)
}

/// Players off and every container reported down before the host goes away.
async fn quiesce(s: &Session) {
    s.power_off_players().await;
    publish::publish_containers_off(s).await;
}

pub async fn do_compose_recreate(s: &Session, _cmd: &Command) -> HandlerResult {
    s.power_off_players().await;
    recreate(s, None).await?;
    Ok(Outcome::Applied)
}

pub async fn do_remote_backup(s: &Session, _cmd: &Command) -> HandlerResult {
    let backup = &s.services.backup;
    let archive = backup.create_local().await?;
    let copied = backup.copy_to_remote(&archive).await;
    if let Err(e) = backup.delete_local(&archive).await {
        warn!("handlers: {}", e);
    }
    copied?;
    info!("handlers: backup {:?} copied", archive);
    Ok(Outcome::Applied)
}

pub async fn do_update_supervisor(s: &Session, _cmd: &Command) -> HandlerResult {
    trigger_update(s, "supervisor", keys::WATCHTOWER_SUPERVISOR_PORT).await
}

pub async fn do_update_squeezelite(s: &Session, _cmd: &Command) -> HandlerResult {
    trigger_update(s, "squeezelite", keys::WATCHTOWER_SQUEEZELITE_PORT).await
}

async fn trigger_update(s: &Session, logical: &str, port_key: &str) -> HandlerResult {
    let store = s.store();
    let port = match store.read(port_key) {
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("{} = {:?}", port_key, raw))?,
        None => {
            debug!("handlers: {} not set, no update agent for {}", port_key, logical);
            return Ok(Outcome::Skipped);
        }
    };

    let service = s
        .device
        .config
        .compose
        .watched_services
        .iter()
        .find(|w| w.logical == logical)
        .map(|w| w.service.as_str())
        .unwrap_or(logical);
    if s.services.runtime.is_local_build(service).await? {
        info!("handlers: {} is a local build, not updating", service);
        return Ok(Outcome::Skipped);
    }

    s.power_off_players().await;
    let token = store.read(keys::WATCHTOWER_API_TOKEN);
    s.services.updater.trigger(port, token.as_deref()).await?;
    info!("handlers: update of {} triggered", logical);
    Ok(Outcome::Applied)
}

// ── set: endpoints and credentials ────────────────────────────────────────────

pub async fn set_lms_host(s: &Session, cmd: &Command) -> HandlerResult {
    let host = with_default_port(&cmd.payload, DEFAULT_LMS_PORT);
    s.store().write(keys::LMS_HOST, &host)?;
    // The stored host is what the next session connects to, recreated or not.
    if let Err(e) = recreate(s, None).await {
        warn!("handlers: recreate after lms host change: {:#}", e);
    }
    s.publish_state(EntityKind::Text, "lms_host", &host).await;
    Ok(Outcome::Applied)
}

/// `[user@]host[:port]`
pub async fn set_mqtt_host(s: &Session, cmd: &Command) -> HandlerResult {
    let (user, host) = match cmd.payload.split_once('@') {
        Some((user, host)) => (user, host),
        None => ("", cmd.payload.as_str()),
    };
    let host = with_default_port(host, DEFAULT_MQTT_PORT);
    let store = s.store();
    store.write(keys::MQTT_HOST, &host)?;
    store.write(keys::MQTT_USER, user)?;
    s.publish_state(EntityKind::Text, "mqtt_host", &publish::mqtt_host_state(s))
        .await;
    Ok(Outcome::Applied)
}

pub async fn set_mqtt_password(s: &Session, cmd: &Command) -> HandlerResult {
    store_and_echo(s, keys::MQTT_PASSWORD, "mqtt_password", &cmd.payload).await
}

pub async fn set_hass_host(s: &Session, cmd: &Command) -> HandlerResult {
    let host = with_default_port(&cmd.payload, DEFAULT_HASS_PORT);
    s.store().write(keys::HASS_HOST, &host)?;
    recreate(s, None).await?;
    s.publish_state(EntityKind::Text, "hass_host", &host).await;
    Ok(Outcome::Applied)
}

pub async fn set_hass_bearer(s: &Session, cmd: &Command) -> HandlerResult {
    s.store().write(keys::HASS_BEARER, &cmd.payload)?;
    recreate(s, None).await?;
    s.publish_state(EntityKind::Text, "hass_bearer", &cmd.payload)
        .await;
    Ok(Outcome::Applied)
}

/// `user@host[:port]`
pub async fn set_backup_host(s: &Session, cmd: &Command) -> HandlerResult {
    let (user, rest) = cmd
        .payload
        .split_once('@')
        .ok_or_else(|| anyhow!("backup host {:?} is not user@host[:port]", cmd.payload))?;
    let (host, port) = rest.split_once(':').unwrap_or((rest, DEFAULT_SSH_PORT));
    if user.is_empty() || host.is_empty() {
        bail!("backup host {:?} is not user@host[:port]", cmd.payload);
    }
    let store = s.store();
    store.write(keys::BACKUP_SSH_HOST, host)?;
    store.write(keys::BACKUP_SSH_PORT, port)?;
    store.write(keys::BACKUP_SSH_USER, user)?;
    s.publish_state(EntityKind::Text, "backup_host", &publish::backup_host_state(s))
        .await;
    Ok(Outcome::Applied)
}

pub async fn set_backup_password(s: &Session, cmd: &Command) -> HandlerResult {
    store_and_echo(s, keys::BACKUP_SSH_PASSWORD, "backup_password", &cmd.payload).await
}

pub async fn set_backup_folder(s: &Session, cmd: &Command) -> HandlerResult {
    store_and_echo(s, keys::BACKUP_SSH_FOLDER, "backup_folder", &cmd.payload).await
}

// ── set: per channel ──────────────────────────────────────────────────────────

pub async fn set_player_name(s: &Session, cmd: &Command) -> HandlerResult {
    let channel = channel(s, cmd)?;
    s.media.set_player_name(channel, &cmd.payload).await?;
    s.device
        .channels
        .set_player_name(channel, &cmd.payload)
        .await;
    s.publish_state(
        EntityKind::Text,
        &channel_suffixed(channel, "player_name"),
        &cmd.payload,
    )
    .await;
    Ok(Outcome::Applied)
}

pub async fn set_eqsetting(s: &Session, cmd: &Command) -> HandlerResult {
    let channel = channel(s, cmd)?;
    let band = cmd
        .eq_channel
        .filter(|b| (*b as usize) < BAND_COUNT)
        .ok_or_else(|| anyhow!("eqsetting for channel {} without a valid band", channel))?;
    let value: i32 = cmd
        .payload
        .trim()
        .parse()
        .with_context(|| format!("equalizer value {:?}", cmd.payload))?;
    if !(BAND_MIN..=BAND_MAX).contains(&value) {
        bail!("equalizer value {} outside {}..={}", value, BAND_MIN, BAND_MAX);
    }

    check_and_enable_eq(s, channel).await?;
    s.services
        .mixer
        .set_equalizer_band(channel, band, value)
        .await?;
    s.device.channels.set_band(channel, band, value).await;
    s.publish_state(
        EntityKind::Number,
        &eq_band_object(channel, band),
        &value.to_string(),
    )
    .await;
    Ok(Outcome::Applied)
}

pub async fn set_eqpreset(s: &Session, cmd: &Command) -> HandlerResult {
    let channel = channel(s, cmd)?;
    let name = cmd.payload.trim();
    let values = eq::preset(name).ok_or_else(|| anyhow!("unknown equalizer preset {:?}", name))?;

    check_and_enable_eq(s, channel).await?;
    let applied = s
        .services
        .mixer
        .set_equalizer_preset(channel, values)
        .await?;
    s.device.channels.set_equalizer(channel, applied).await;
    publish::publish_equalizer(s, channel, &applied).await;
    info!("handlers: channel {} equalizer preset {}", channel, name);
    Ok(Outcome::Applied)
}

pub async fn set_volume(s: &Session, cmd: &Command) -> HandlerResult {
    let channel = channel(s, cmd)?;
    let volume: i32 = cmd
        .payload
        .trim()
        .parse()
        .with_context(|| format!("volume {:?}", cmd.payload))?;
    let mixer = &s.services.mixer;
    mixer.set_volume(channel, volume).await?;
    // Survives power loss and lands in the next backup.
    mixer.persist().await?;
    s.device.channels.set_volume(channel, volume).await;
    s.publish_state(
        EntityKind::Number,
        &channel_suffixed(channel, "volume"),
        &volume.to_string(),
    )
    .await;
    Ok(Outcome::Applied)
}

pub async fn set_hass_switch(s: &Session, cmd: &Command) -> HandlerResult {
    let channel = channel(s, cmd)?;
    s.store().write(&keys::hass_switch(channel), &cmd.payload)?;
    s.device.channels.load_from_store(s.store()).await;
    recreate(s, Some(&container_name(channel))).await?;
    s.publish_state(
        EntityKind::Text,
        &channel_suffixed(channel, "hass_switch"),
        &cmd.payload,
    )
    .await;
    Ok(Outcome::Applied)
}

/// The channel's player must be routed through the equalizer device before
/// bands mean anything; switching it over recreates that player.
pub async fn check_and_enable_eq(s: &Session, channel: u8) -> anyhow::Result<()> {
    let key = keys::output(channel);
    let store = s.store();
    if store.read(&key).map_or(false, |o| o.ends_with("_eq")) {
        return Ok(());
    }
    let output = format!("ch{}_eq", channel);
    info!("handlers: routing channel {} through {}", channel, output);
    store.write(&key, &output)?;
    recreate(s, Some(&container_name(channel))).await
}

// ── set: GPIO assignment ──────────────────────────────────────────────────────

/// `relay;onDelay;downDelay`
pub async fn set_gpio_psu_relay(s: &Session, cmd: &Command) -> HandlerResult {
    let fields = fit_list(&cmd.payload, 3);
    let store = s.store();
    store.write(keys::GPIO_PSU_RELAY, &fields[0])?;
    store.write(keys::PSU_POWER_ON_DELAY, &fields[1])?;
    store.write(keys::PSU_POWER_DOWN_DELAY, &fields[2])?;
    recreate(s, None).await?;
    s.publish_state(EntityKind::Text, "gpio_psu_relay", &cmd.payload)
        .await;
    Ok(Outcome::Applied)
}

pub async fn set_gpio_mute(s: &Session, cmd: &Command) -> HandlerResult {
    let count = s.device.channel_count();
    let lines = fit_list(&cmd.payload, count as usize);
    let store = s.store();
    store.write(keys::GPIO_MUTE_LIST, &cmd.payload)?;
    for (channel, line) in (1..=count).zip(&lines) {
        store.write(&keys::gpio_mute(channel), line)?;
    }
    s.device.channels.load_from_store(store).await;
    for channel in 1..=count {
        gpio::init_mute_line(s.services.gpio.as_ref(), store, channel).await;
    }
    recreate(s, None).await?;
    s.publish_state(EntityKind::Text, "gpio_mute", &lines.join(";"))
        .await;
    Ok(Outcome::Applied)
}

pub async fn set_gpio_usb_dac(s: &Session, cmd: &Command) -> HandlerResult {
    store_and_echo(s, keys::GPIO_USB_POWER, "gpio_usb_dac", &cmd.payload).await
}

pub async fn set_gpio_sps(s: &Session, cmd: &Command) -> HandlerResult {
    let count = s.device.channel_count();
    let lines = fit_list(&cmd.payload, count as usize);
    let store = s.store();
    for (channel, line) in (1..=count).zip(&lines) {
        store.write(&keys::gpio_sps(channel), line)?;
    }
    s.device.channels.load_from_store(store).await;
    recreate(s, None).await?;
    s.publish_state(EntityKind::Text, "gpio_sps", &lines.join(";"))
        .await;
    Ok(Outcome::Applied)
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn channel(s: &Session, cmd: &Command) -> anyhow::Result<u8> {
    match cmd.channel {
        Some(ch) if ch >= 1 && ch <= s.device.channel_count() => Ok(ch),
        Some(ch) => bail!("channel {} out of range", ch),
        None => bail!("{} needs a channel", cmd.handler_key()),
    }
}

async fn store_and_echo(s: &Session, key: &str, object: &str, value: &str) -> HandlerResult {
    s.store().write(key, value)?;
    s.publish_state(EntityKind::Text, object, value).await;
    Ok(Outcome::Applied)
}

async fn recreate(s: &Session, service: Option<&str>) -> anyhow::Result<()> {
    s.services
        .runtime
        .up(&s.device.config.compose.profile, true, service)
        .await?;
    Ok(())
}

/// `host` → `host:<port>`; an explicit port is kept.
fn with_default_port(raw: &str, port: &str) -> String {
    let raw = raw.trim();
    if raw.contains(':') {
        raw.to_string()
    } else {
        format!("{}:{}", raw, port)
    }
}

/// Split a `;`-list and pad with empty fields or truncate to `len`.
fn fit_list(raw: &str, len: usize) -> Vec<String> {
    let mut fields: Vec<String> = raw.split(';').take(len).map(str::to_string).collect();
    fields.resize(len, String::new());
    fields
}
