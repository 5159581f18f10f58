use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::eq::{EqVector, BAND_COUNT};
use crate::keys;
use crate::store::ConfigStore;

/// One amplifier channel and its last-known values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// 1-based channel number.
    pub number: u8,
    /// Compose service / container name of the channel's player.
    pub container: String,
    /// Player id (MAC) as known to the media server.
    pub player_id: String,
    pub volume: Option<i32>,
    pub equalizer: Option<EqVector>,
    pub player_name: Option<String>,
    /// Physical GPIO pin muting the channel's amplifier.
    pub mute_line: Option<u32>,
    /// Physical GPIO pin driving the channel's speaker switch.
    pub sps_line: Option<u32>,
    /// Automation-hub entity switched together with the player.
    pub hass_switch: Option<String>,
}

impl Channel {
    pub fn new(number: u8) -> Self {
        Self {
            number,
            container: container_name(number),
            player_id: player_id(number),
            volume: None,
            equalizer: None,
            player_name: None,
            mute_line: None,
            sps_line: None,
            hass_switch: None,
        }
    }
}

pub fn container_name(channel: u8) -> String {
    format!("squeezelite{}", channel)
}

pub fn player_id(channel: u8) -> String {
    format!("02:00:00:00:00:{:02}", channel)
}

/// All channels of the device; constructed once, mutated in place.
pub struct ChannelTable {
    channels: Arc<RwLock<Vec<Channel>>>,
}

impl ChannelTable {
    pub fn new(count: u8) -> Self {
        Self {
            channels: Arc::new(RwLock::new((1..=count).map(Channel::new).collect())),
        }
    }

    /// Build the table with GPIO assignments and hub switches already read
    /// from the store.
    pub fn from_store(count: u8, store: &dyn ConfigStore) -> Self {
        let channels = (1..=count)
            .map(|n| {
                let mut ch = Channel::new(n);
                apply_store(&mut ch, store);
                ch
            })
            .collect();
        Self {
            channels: Arc::new(RwLock::new(channels)),
        }
    }

    pub async fn count(&self) -> u8 {
        self.channels.read().await.len() as u8
    }

    pub async fn get(&self, channel: u8) -> Option<Channel> {
        let channels = self.channels.read().await;
        index(&channels, channel).map(|i| channels[i].clone())
    }

    pub async fn snapshot(&self) -> Vec<Channel> {
        self.channels.read().await.clone()
    }

    /// Reload GPIO assignments and hub switches from the store.
    pub async fn load_from_store(&self, store: &dyn ConfigStore) {
        let mut channels = self.channels.write().await;
        for ch in channels.iter_mut() {
            apply_store(ch, store);
        }
    }

    /// Seed player names from the per-channel name files the players write.
    pub async fn load_names_from_dir(&self, dir: &Path) {
        let mut channels = self.channels.write().await;
        for ch in channels.iter_mut() {
            let path = dir.join(format!("squeeze{}.name", ch.number));
            match tokio::fs::read_to_string(&path).await {
                Ok(name) => ch.player_name = Some(name.trim_end_matches(&['\r', '\n'][..]).to_string()),
                Err(e) => debug!("no player name file {:?}: {}", path, e),
            }
        }
    }

    pub async fn mute_lines(&self) -> Vec<(u8, u32)> {
        self.channels
            .read()
            .await
            .iter()
            .filter_map(|ch| ch.mute_line.map(|line| (ch.number, line)))
            .collect()
    }

    pub async fn set_volume(&self, channel: u8, volume: i32) {
        self.update(channel, |ch| ch.volume = Some(volume)).await;
    }

    pub async fn set_equalizer(&self, channel: u8, values: EqVector) {
        self.update(channel, |ch| ch.equalizer = Some(values)).await;
    }

    pub async fn set_band(&self, channel: u8, band: u8, value: i32) {
        if band as usize >= BAND_COUNT {
            return;
        }
        self.update(channel, |ch| {
            if let Some(eq) = ch.equalizer.as_mut() {
                eq[band as usize] = value;
            }
        })
        .await;
    }

    /// Returns true when the stored name changed.
    pub async fn set_player_name(&self, channel: u8, name: &str) -> bool {
        let mut changed = false;
        self.update(channel, |ch| {
            if ch.player_name.as_deref() != Some(name) {
                ch.player_name = Some(name.to_string());
                changed = true;
            }
        })
        .await;
        changed
    }

    async fn update(&self, channel: u8, f: impl FnOnce(&mut Channel)) {
        let mut channels = self.channels.write().await;
        match index(&channels, channel) {
            Some(i) => f(&mut channels[i]),
            None => warn!("channel {} out of range", channel),
        }
    }
}

fn apply_store(ch: &mut Channel, store: &dyn ConfigStore) {
    ch.mute_line = store.read_parsed(&keys::gpio_mute(ch.number));
    ch.sps_line = store.read_parsed(&keys::gpio_sps(ch.number));
    ch.hass_switch = store.read(&keys::hass_switch(ch.number));
}

fn index(channels: &[Channel], channel: u8) -> Option<usize> {
    let i = (channel as usize).checked_sub(1)?;
    (i < channels.len()).then_some(i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn loads_lines_from_store() {
        let table = ChannelTable::new(3);
        let store = MemoryStore::with(&[
            ("GPIO_CH1_MUTE", "29"),
            ("GPIO_CH3_MUTE", "31"),
            ("GPIO_CH2_SPS", "33"),
            ("HASS_SWITCH_CH2", "switch.kitchen"),
        ]);
        table.load_from_store(&store).await;

        assert_eq!(table.mute_lines().await, vec![(1, 29), (3, 31)]);
        let ch2 = table.get(2).await.unwrap();
        assert_eq!(ch2.sps_line, Some(33));
        assert_eq!(ch2.hass_switch.as_deref(), Some("switch.kitchen"));
        assert_eq!(ch2.container, "squeezelite2");
        assert_eq!(ch2.player_id, "02:00:00:00:00:02");
    }

    #[tokio::test]
    async fn out_of_range_channels_are_ignored() {
        let table = ChannelTable::new(2);
        assert!(table.get(0).await.is_none());
        assert!(table.get(3).await.is_none());
        assert!(!table.set_player_name(3, "x").await);
    }

    #[tokio::test]
    async fn player_name_change_detection() {
        let table = ChannelTable::new(1);
        assert!(table.set_player_name(1, "Kitchen").await);
        assert!(!table.set_player_name(1, "Kitchen").await);
        assert!(table.set_player_name(1, "Bath").await);
    }

    #[tokio::test]
    async fn names_from_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("squeeze1.name"), "Living Room\n").unwrap();
        let table = ChannelTable::new(2);
        table.load_names_from_dir(dir.path()).await;
        assert_eq!(table.get(1).await.unwrap().player_name.as_deref(), Some("Living Room"));
        assert_eq!(table.get(2).await.unwrap().player_name, None);
    }

    #[tokio::test]
    async fn band_update_needs_known_vector() {
        let table = ChannelTable::new(1);
        table.set_band(1, 2, 70).await;
        assert_eq!(table.get(1).await.unwrap().equalizer, None);
        table.set_equalizer(1, [66; 10]).await;
        table.set_band(1, 2, 70).await;
        assert_eq!(table.get(1).await.unwrap().equalizer.unwrap()[2], 70);
    }
}
