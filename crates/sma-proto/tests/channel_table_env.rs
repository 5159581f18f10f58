use sma_proto::keys;
use sma_proto::state::ChannelTable;
use sma_proto::store::{ConfigStore, EnvFileStore};

fn env_file(content: &str) -> (tempfile::TempDir, EnvFileStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(&path, content).unwrap();
    let store = EnvFileStore::new(&path);
    (dir, store)
}

#[tokio::test]
async fn table_reads_gpio_assignments_from_env_file() {
    let (_dir, store) = env_file(
        "# amplifier wiring\n\
         export GPIO_CH1_MUTE=11\n\
         GPIO_CH2_MUTE=\n\
         GPIO_CH3_MUTE=thirteen\n\
         GPIO_CH1_SPS=29\n\
         HASS_SWITCH_CH2=switch.kitchen_amp\n",
    );
    let table = ChannelTable::from_store(3, &store);

    assert_eq!(table.mute_lines().await, vec![(1, 11)]);
    let ch1 = table.get(1).await.unwrap();
    assert_eq!(ch1.sps_line, Some(29));
    let ch2 = table.get(2).await.unwrap();
    assert_eq!(ch2.mute_line, None);
    assert_eq!(ch2.hass_switch.as_deref(), Some("switch.kitchen_amp"));
}

#[tokio::test]
async fn reload_picks_up_written_assignments() {
    let (_dir, store) = env_file("GPIO_CH1_MUTE=11\n");
    let table = ChannelTable::from_store(2, &store);

    store.write(&keys::gpio_mute(1), "15").unwrap();
    store.write(&keys::gpio_mute(2), "16").unwrap();
    assert_eq!(table.mute_lines().await, vec![(1, 11)]);

    table.load_from_store(&store).await;
    assert_eq!(table.mute_lines().await, vec![(1, 15), (2, 16)]);

    let content = std::fs::read_to_string(store.path()).unwrap();
    assert_eq!(content, "GPIO_CH1_MUTE=15\nGPIO_CH2_MUTE=16\n");
}
