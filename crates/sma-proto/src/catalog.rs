//! Discovery documents describing every bus-addressable control point.

use serde_json::{json, Map, Value};

use crate::eq::{self, BAND_MAX, BAND_MIN};
use crate::protocol::{channel_object, channel_suffixed, eq_band_object, EntityKind, Topics};

/// One catalog entry: where it lives and the discovery document to publish.
#[derive(Debug, Clone)]
pub struct Entity {
    pub kind: EntityKind,
    pub object: String,
    pub doc: Value,
}

impl Entity {
    pub fn config_topic(&self, topics: &Topics) -> String {
        topics.config(self.kind, &self.object)
    }
}

struct Builder<'a> {
    topics: &'a Topics,
    device: Value,
    entities: Vec<Entity>,
}

impl<'a> Builder<'a> {
    /// `extra` is merged over the common fields.
    fn push(&mut self, kind: EntityKind, object: String, name: &str, extra: Value) {
        let mut doc = Map::new();
        doc.insert("~".into(), json!(self.topics.base(kind, &object)));
        doc.insert("unique_id".into(), json!(self.topics.object_id(&object)));
        doc.insert("object_id".into(), json!(self.topics.object_id(&object)));
        doc.insert("name".into(), json!(name));
        doc.insert("device".into(), self.device.clone());
        if let Value::Object(extra) = extra {
            doc.extend(extra);
        }
        self.entities.push(Entity {
            kind,
            object,
            doc: Value::Object(doc),
        });
    }
}

fn text_setting(icon: &str, description: Option<&str>, password: bool) -> Value {
    let mut v = json!({
        "entity_category": "config",
        "icon": icon,
        "cmd_t": "~/set",
        "stat_t": "~/state",
    });
    if let Some(d) = description {
        v["description"] = json!(d);
    }
    if password {
        v["mode"] = json!("password");
    }
    v
}

/// Build the full catalog for a device with `channels` amplifier channels.
pub fn build(topics: &Topics, channels: u8) -> Vec<Entity> {
    let node = topics.node_id().to_string();
    let mut b = Builder {
        topics,
        device: json!({ "name": "sMA", "identifiers": [node] }),
        entities: Vec::new(),
    };

    b.push(
        EntityKind::BinarySensor,
        "supervisor".into(),
        "Supervisor Container State",
        json!({ "entity_category": "diagnostic", "dev_cla": "running", "stat_t": "~/state" }),
    );

    for (object, name, icon, restart) in [
        ("shutdown", "Server Shutdown", "mdi:stop", false),
        ("restart", "Server Restart", "mdi:restart", true),
        ("compose_recreate", "Container Recreate", "mdi:autorenew", true),
        ("remote_backup", "Remote Backup", "mdi:cloud-upload", false),
    ] {
        let mut extra = json!({ "entity_category": "config", "icon": icon, "cmd_t": "~/do" });
        if restart {
            extra["dev_cla"] = json!("restart");
        }
        b.push(EntityKind::Button, object.into(), name, extra);
    }

    for (object, name, icon, description, password) in [
        ("lms_host", "Logitech Media Server Host", "mdi:server-network", Some("Format: host:port"), false),
        ("mqtt_host", "MQTT Host", "mdi:server-network", Some("Format: [user@]host:port (user is optional)"), false),
        ("mqtt_password", "MQTT Password", "mdi:lock", None, true),
        ("hass_host", "Home Assistant Host", "mdi:server-network", Some("Format: host:port"), false),
        ("hass_bearer", "Home Assistant bearer token", "mdi:lock", None, true),
        ("backup_host", "Remote Backup Host", "mdi:server-network", Some("Format: user@host:port"), false),
        ("backup_password", "Remote Backup Password", "mdi:lock", None, true),
        ("backup_folder", "Remote Backup Folder", "mdi:folder", None, false),
        ("gpio_psu_relay", "GPIO Power Supply Relay", "mdi:power-plug", Some("GPIO physical pin number (1-40);power on delay;power down delay"), false),
        ("gpio_mute", "GPIO Channel Mute", "mdi:volume-mute", Some("List of GPIO physical pin numbers (1-40)"), false),
        ("gpio_usb_dac", "GPIO USB DAC", "mdi:usb", Some("GPIO physical pin number (1-40)"), false),
        ("gpio_sps", "GPIO Speaker Switch", "mdi:ab-testing", Some("List of GPIO physical pin numbers (1-40)"), false),
    ] {
        b.push(
            EntityKind::Text,
            object.into(),
            name,
            text_setting(icon, description, password),
        );
    }

    for (object, name) in [
        ("update_supervisor", "Update Supervisor"),
        ("update_squeezelite", "Update Squeezelite"),
    ] {
        b.push(
            EntityKind::Update,
            object.into(),
            name,
            json!({ "entity_category": "config", "icon": "mdi:oci", "cmd_t": "~/do", "stat_t": "~/state" }),
        );
    }

    for channel in 1..=channels {
        let ch = channel_object(channel);
        b.device = json!({
            "name": format!("sMA Channel #{:02}", channel),
            "identifiers": [format!("{}-{}", node, ch)],
            "via_device": node,
        });

        b.push(
            EntityKind::BinarySensor,
            ch.clone(),
            "Container State",
            json!({ "entity_category": "diagnostic", "dev_cla": "running", "stat_t": "~/state" }),
        );
        b.push(
            EntityKind::Text,
            channel_suffixed(channel, "player_name"),
            "Player Name",
            text_setting("mdi:rename", None, false),
        );

        for (band, label) in eq::BANDS.iter().enumerate() {
            b.push(
                EntityKind::Number,
                eq_band_object(channel, band as u8),
                &format!("EQ {} Setting", label),
                json!({
                    "entity_category": "config",
                    "icon": "mdi:tune",
                    "cmd_t": "~/set",
                    "stat_t": "~/state",
                    "min": BAND_MIN,
                    "max": BAND_MAX,
                }),
            );
        }

        // All preset buttons of a channel share one command topic; the
        // preset name travels as the payload.
        let preset_cmd = topics.command(
            EntityKind::Button,
            &channel_suffixed(channel, "eqpreset"),
            crate::protocol::Verb::Set,
        );
        for (preset, _) in eq::PRESETS {
            b.push(
                EntityKind::Button,
                channel_suffixed(channel, &format!("eqpreset_{}", preset)),
                &format!("EQ Preset {}", preset),
                json!({
                    "entity_category": "config",
                    "icon": "mdi:folder-star",
                    "cmd_t": preset_cmd,
                    "pl_prs": preset,
                }),
            );
        }

        b.push(
            EntityKind::Number,
            channel_suffixed(channel, "volume"),
            "Volume",
            json!({
                "entity_category": "config",
                "icon": "mdi:volume-high",
                "cmd_t": "~/set",
                "stat_t": "~/state",
                "min": 0,
                "max": 100,
            }),
        );
        b.push(
            EntityKind::Text,
            channel_suffixed(channel, "hass_switch"),
            "Home Assistant Switch",
            text_setting(
                "mdi:electric-switch",
                Some("Home Assistant entity id that should be switched on/off based on player state"),
                false,
            ),
        );
    }

    b.entities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("homeassistant", "sma000000000001", "homeassistant/status")
    }

    #[test]
    fn catalog_size() {
        // 1 + 4 + 12 + 2 device entities, 1 + 1 + 10 + 5 + 1 + 1 per channel
        assert_eq!(build(&topics(), 8).len(), 19 + 8 * 19);
        assert_eq!(build(&topics(), 0).len(), 19);
    }

    #[test]
    fn object_ids_are_unique() {
        let entities = build(&topics(), 8);
        let mut ids: Vec<_> = entities.iter().map(|e| e.config_topic(&topics())).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), entities.len());
    }

    #[test]
    fn preset_buttons_route_to_channel_eqpreset() {
        let t = topics();
        let entities = build(&t, 2);
        let rock = entities
            .iter()
            .find(|e| e.object == "ch02_eqpreset_rock")
            .unwrap();
        let cmd_topic = rock.doc["cmd_t"].as_str().unwrap();
        let cmd = crate::protocol::Command::parse(cmd_topic, "rock", t.node_id()).unwrap();
        assert_eq!(cmd.handler_key(), "set_eqpreset");
        assert_eq!(cmd.channel, Some(2));
    }

    #[test]
    fn channel_entities_use_sub_device() {
        let entities = build(&topics(), 1);
        let volume = entities.iter().find(|e| e.object == "ch01_volume").unwrap();
        assert_eq!(volume.doc["device"]["via_device"], "sma000000000001");
        assert_eq!(
            volume.doc["~"],
            "homeassistant/number/sma000000000001/sma000000000001_ch01_volume"
        );
    }
}
