use std::collections::BTreeSet;

use sma_proto::catalog;
use sma_proto::protocol::{Command, Topics};

const NODE: &str = "smadca632112233";

fn topics() -> Topics {
    Topics::new("homeassistant", NODE, "homeassistant/status")
}

/// MQTT filter match with `+` single-level wildcards only.
fn matches(filter: &str, topic: &str) -> bool {
    let f: Vec<&str> = filter.split('/').collect();
    let t: Vec<&str> = topic.split('/').collect();
    f.len() == t.len() && f.iter().zip(&t).all(|(f, t)| *f == "+" || f == t)
}

/// Every command topic the catalog advertises, with `~` expanded.
fn command_topics(topics: &Topics, channels: u8) -> Vec<String> {
    catalog::build(topics, channels)
        .into_iter()
        .filter_map(|e| {
            let cmd = e.doc.get("cmd_t")?.as_str()?.to_string();
            let base = e.doc["~"].as_str()?.to_string();
            Some(cmd.replacen('~', &base, 1))
        })
        .collect()
}

#[test]
fn every_advertised_command_parses_to_a_known_handler() {
    let t = topics();
    let keys: BTreeSet<String> = command_topics(&t, 4)
        .iter()
        .map(|topic| {
            Command::parse(topic, "", NODE)
                .unwrap_or_else(|e| panic!("{}: {}", topic, e))
                .handler_key()
        })
        .collect();

    let expected: BTreeSet<String> = [
        "do_shutdown",
        "do_restart",
        "do_compose_recreate",
        "do_remote_backup",
        "do_update_supervisor",
        "do_update_squeezelite",
        "set_lms_host",
        "set_mqtt_host",
        "set_mqtt_password",
        "set_hass_host",
        "set_hass_bearer",
        "set_backup_host",
        "set_backup_password",
        "set_backup_folder",
        "set_gpio_psu_relay",
        "set_gpio_mute",
        "set_gpio_usb_dac",
        "set_gpio_sps",
        "set_player_name",
        "set_eqsetting",
        "set_eqpreset",
        "set_volume",
        "set_hass_switch",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(keys, expected);
}

#[test]
fn every_advertised_command_is_covered_by_a_subscription() {
    let t = topics();
    let subs = t.subscriptions();
    for topic in command_topics(&t, 8) {
        assert!(
            subs.iter().any(|s| matches(s, &topic)),
            "no subscription covers {}",
            topic
        );
    }
}

#[test]
fn channel_commands_carry_their_channel() {
    let t = topics();
    for topic in command_topics(&t, 8) {
        let cmd = Command::parse(&topic, "", NODE).unwrap();
        let object = topic.rsplit('/').nth(1).unwrap();
        let is_channel = object.starts_with(&format!("{}_ch", NODE));
        assert_eq!(cmd.channel.is_some(), is_channel, "{}", topic);
        if cmd.handler_key() == "set_eqsetting" {
            assert!(cmd.eq_channel.unwrap() < 10);
        } else {
            assert_eq!(cmd.eq_channel, None, "{}", topic);
        }
    }
}

#[test]
fn another_nodes_catalog_is_foreign() {
    let other = Topics::new("homeassistant", "sma000000000999", "homeassistant/status");
    for topic in command_topics(&other, 1) {
        assert!(Command::parse(&topic, "", NODE).is_err(), "{}", topic);
    }
}
