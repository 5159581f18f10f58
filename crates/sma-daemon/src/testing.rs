//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sma_proto::config::Config;
use sma_proto::eq::{EqVector, BAND_COUNT};
use sma_proto::platform::ImagePlatform;
use sma_proto::protocol::Topics;
use sma_proto::state::ChannelTable;
use sma_proto::store::MemoryStore;
use tokio::sync::mpsc;

use crate::backup::BackupService;
use crate::bus::{BrokerEndpoint, Bus, BusEvent, Connection, Connector};
use crate::compose::ContainerRuntime;
use crate::error::{BusError, CallError};
use crate::gpio::GpioService;
use crate::lms::{MediaServerClient, MediaServerFactory};
use crate::mixer::AudioMixer;
use crate::power::{PowerService, UsbId};
use crate::registry::ImageRef;
use crate::session::{Device, Services, Session};
use crate::updater::UpdateTrigger;

pub const NODE_ID: &str = "sma0123456789ab";

fn failed(what: &str) -> CallError {
    CallError::Exit {
        program: what.to_string(),
        status: 1,
        stderr: "scripted failure".to_string(),
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub bus: Arc<RecordingBus>,
    pub runtime: Arc<FakeRuntime>,
    pub gpio: Arc<FakeGpio>,
    pub power: Arc<FakePower>,
    pub mixer: Arc<FakeMixer>,
    pub media: Arc<FakeMedia>,
    pub backup: Arc<FakeBackup>,
    pub updater: Arc<FakeUpdater>,
    pub store: Arc<MemoryStore>,
    device: Arc<Device>,
}

impl Harness {
    pub fn new(channels: u8) -> Self {
        Self::with_store(channels, &[])
    }

    pub fn with_store(channels: u8, pairs: &[(&str, &str)]) -> Self {
        let store = Arc::new(MemoryStore::with(pairs));
        let mut config = Config::default();
        config.channels.count = channels;
        let topics = Topics::new(
            config.bus.discovery_prefix.clone(),
            NODE_ID,
            config.bus.presence_topic.clone(),
        );
        let device = Device {
            topics,
            channels: ChannelTable::from_store(channels, store.as_ref()),
            config,
            platform: ImagePlatform::for_arch("aarch64"),
        };
        Self {
            bus: Arc::new(RecordingBus::default()),
            runtime: Arc::new(FakeRuntime::new()),
            gpio: Arc::new(FakeGpio::new()),
            power: Arc::new(FakePower::new(2)),
            mixer: Arc::new(FakeMixer::default()),
            media: Arc::new(FakeMedia::default()),
            backup: Arc::new(FakeBackup::default()),
            updater: Arc::new(FakeUpdater::default()),
            store,
            device: Arc::new(device),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            runtime: self.runtime.clone(),
            gpio: self.gpio.clone(),
            power: self.power.clone(),
            mixer: self.mixer.clone(),
            backup: self.backup.clone(),
            updater: self.updater.clone(),
            store: self.store.clone(),
        }
    }

    pub fn device(&self) -> Arc<Device> {
        self.device.clone()
    }

    pub fn session(&self) -> Session {
        Session {
            bus: self.bus.clone(),
            media: self.media.clone(),
            services: self.services(),
            device: self.device.clone(),
        }
    }
}

// ── bus ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    subscription: bool,
}

impl LogEntry {
    pub fn is_subscription(&self) -> bool {
        self.subscription
    }
}

/// Records publishes and subscriptions in order.
#[derive(Default)]
pub struct RecordingBus {
    log: Mutex<Vec<LogEntry>>,
}

impl RecordingBus {
    pub fn log(&self) -> Vec<LogEntry> {
        self.log.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|e| !e.subscription && e.topic == topic)
            .map(|e| e.payload)
            .collect()
    }

    pub fn publish_count(&self) -> usize {
        self.log().iter().filter(|e| !e.subscription).count()
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        self.log.lock().unwrap().push(LogEntry {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
            subscription: false,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.log.lock().unwrap().push(LogEntry {
            topic: topic.to_string(),
            payload: String::new(),
            retain: false,
            subscription: true,
        });
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// Hands out scripted connections in order; each gets its own bus and an
/// event stream preloaded with the script.
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<Vec<Option<Vec<BusEvent>>>>,
    buses: Mutex<Vec<Arc<RecordingBus>>>,
    endpoints: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, events: Vec<BusEvent>) {
        self.scripts.lock().unwrap().push(Some(events));
    }

    pub fn fail_next(&self) {
        self.scripts.lock().unwrap().push(None);
    }

    pub fn connects(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Bus of the i-th successful connection.
    pub fn bus(&self, i: usize) -> Arc<RecordingBus> {
        self.buses.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Connection, BusError> {
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        let next = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                None
            } else {
                scripts.remove(0)
            }
        };
        let events = next.ok_or_else(|| BusError::Connect("scripted failure".to_string()))?;

        let (tx, rx) = mpsc::channel(events.len() + 1);
        for event in events {
            tx.try_send(event).unwrap();
        }
        let bus = Arc::new(RecordingBus::default());
        self.buses.lock().unwrap().push(bus.clone());
        Ok(Connection::new(bus, rx))
    }
}

// ── container runtime ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RuntimeState {
    status: HashMap<String, String>,
    fail_status: bool,
    status_calls: usize,
    up_calls: Vec<(String, bool, Option<String>)>,
    fail_up: bool,
    local_builds: HashSet<String>,
    local_build_checks: usize,
    images: HashMap<String, String>,
    local_digest: Option<String>,
    local_digest_lookups: Vec<String>,
    tags: Vec<String>,
    remote_digests: HashMap<String, String>,
    manifest_lookups: Vec<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: &[(&str, &str)]) {
        self.state.lock().unwrap().status = status
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn fail_status(&self, fail: bool) {
        self.state.lock().unwrap().fail_status = fail;
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }

    pub fn fail_up(&self) {
        self.state.lock().unwrap().fail_up = true;
    }

    pub fn up_calls(&self) -> Vec<(String, bool, Option<String>)> {
        self.state.lock().unwrap().up_calls.clone()
    }

    pub fn set_local_build(&self, service: &str) {
        self.state.lock().unwrap().local_builds.insert(service.to_string());
    }

    pub fn local_build_checks(&self) -> usize {
        self.state.lock().unwrap().local_build_checks
    }

    pub fn set_image(&self, service: &str, image: &str) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(service.to_string(), image.to_string());
    }

    pub fn set_local_digest(&self, digest: &str) {
        self.state.lock().unwrap().local_digest = Some(digest.to_string());
    }

    pub fn set_tags(&self, tags: &[&str]) {
        self.state.lock().unwrap().tags = tags.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_remote_digest(&self, tag: &str, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .remote_digests
            .insert(tag.to_string(), digest.to_string());
    }

    pub fn local_digest_lookups(&self) -> Vec<String> {
        self.state.lock().unwrap().local_digest_lookups.clone()
    }

    /// Tags whose remote manifest was fetched, in order.
    pub fn manifest_lookups(&self) -> Vec<String> {
        self.state.lock().unwrap().manifest_lookups.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn status(&self) -> Result<HashMap<String, String>, CallError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if state.fail_status {
            return Err(failed("docker"));
        }
        Ok(state.status.clone())
    }

    async fn up(&self, profile: &str, recreate: bool, service: Option<&str>) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.up_calls.push((profile.to_string(), recreate, service.map(str::to_string)));
        if state.fail_up {
            return Err(failed("docker compose"));
        }
        Ok(())
    }

    async fn is_local_build(&self, service: &str) -> Result<bool, CallError> {
        let mut state = self.state.lock().unwrap();
        state.local_build_checks += 1;
        Ok(state.local_builds.contains(service))
    }

    async fn resolve_image(&self, service: &str) -> Result<String, CallError> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(service)
            .cloned()
            .ok_or_else(|| CallError::NotConfigured(format!("image of {}", service)))
    }

    async fn local_digest(&self, image: &str) -> Result<Option<String>, CallError> {
        let mut state = self.state.lock().unwrap();
        state.local_digest_lookups.push(image.to_string());
        Ok(state.local_digest.clone())
    }

    async fn remote_manifest_digest(
        &self,
        image: &ImageRef,
        _platform: &ImagePlatform,
    ) -> Result<Option<String>, CallError> {
        let mut state = self.state.lock().unwrap();
        state.manifest_lookups.push(image.tag.clone());
        Ok(state.remote_digests.get(&image.tag).cloned())
    }

    async fn list_tags(&self, _image: &ImageRef) -> Result<Vec<String>, CallError> {
        Ok(self.state.lock().unwrap().tags.clone())
    }

    async fn prune(&self) -> Result<(), CallError> {
        Ok(())
    }
}

// ── gpio ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioOp {
    Init(u32),
    Get(u32),
    Set(u32, bool),
}

#[derive(Default)]
struct GpioState {
    values: HashMap<u32, bool>,
    inits: Vec<(u32, bool, Option<bool>)>,
    ops: Vec<GpioOp>,
    failing: HashSet<u32>,
}

/// Lines start OFF unless preset; sets on failing lines change nothing.
#[derive(Default)]
pub struct FakeGpio {
    state: Mutex<GpioState>,
}

impl FakeGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(&self, line: u32, value: bool) {
        self.state.lock().unwrap().values.insert(line, value);
    }

    pub fn fail_sets_on(&self, line: u32) {
        self.state.lock().unwrap().failing.insert(line);
    }

    pub fn value(&self, line: u32) -> Option<bool> {
        self.state.lock().unwrap().values.get(&line).copied()
    }

    pub fn inits(&self) -> Vec<(u32, bool, Option<bool>)> {
        self.state.lock().unwrap().inits.clone()
    }

    pub fn ops(&self) -> Vec<GpioOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn sets(&self) -> Vec<(u32, bool)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                GpioOp::Set(line, value) => Some((line, value)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl GpioService for FakeGpio {
    async fn init(
        &self,
        line: u32,
        active_low: bool,
        initial: Option<bool>,
    ) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(GpioOp::Init(line));
        state.inits.push((line, active_low, initial));
        if let Some(value) = initial {
            state.values.insert(line, value);
        }
        Ok(())
    }

    async fn get(&self, line: u32) -> Result<bool, CallError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(GpioOp::Get(line));
        Ok(state.values.get(&line).copied().unwrap_or(false))
    }

    async fn set(&self, line: u32, value: bool) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(GpioOp::Set(line, value));
        if state.failing.contains(&line) {
            return Err(failed("io.gpiod1 SetValues"));
        }
        state.values.insert(line, value);
        Ok(())
    }
}

// ── power ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PowerState {
    present: usize,
    presence_checks: usize,
    resets: usize,
    fail_resets: bool,
    power_offs: usize,
    reboots: usize,
    fail_host_calls: bool,
}

pub struct FakePower {
    state: Mutex<PowerState>,
}

impl FakePower {
    pub fn new(present: usize) -> Self {
        Self {
            state: Mutex::new(PowerState {
                present,
                ..PowerState::default()
            }),
        }
    }

    pub fn set_present(&self, present: usize) {
        self.state.lock().unwrap().present = present;
    }

    pub fn presence_checks(&self) -> usize {
        self.state.lock().unwrap().presence_checks
    }

    pub fn resets(&self) -> usize {
        self.state.lock().unwrap().resets
    }

    pub fn fail_resets(&self) {
        self.state.lock().unwrap().fail_resets = true;
    }

    pub fn power_offs(&self) -> usize {
        self.state.lock().unwrap().power_offs
    }

    pub fn reboots(&self) -> usize {
        self.state.lock().unwrap().reboots
    }

    pub fn fail_host_calls(&self) {
        self.state.lock().unwrap().fail_host_calls = true;
    }
}

#[async_trait]
impl PowerService for FakePower {
    async fn power_off(&self) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_host_calls {
            return Err(failed("io.gpiod1 SetValues"));
        }
        state.power_offs += 1;
        Ok(())
    }

    async fn reboot(&self) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_host_calls {
            return Err(failed("io.gpiod1 SetValues"));
        }
        state.reboots += 1;
        Ok(())
    }

    async fn usb_devices_present(&self, _id: UsbId) -> Result<usize, CallError> {
        let mut state = self.state.lock().unwrap();
        state.presence_checks += 1;
        Ok(state.present)
    }

    async fn reset_usb_device(&self, _id: UsbId) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resets {
            return Err(failed("usbreset"));
        }
        state.resets += 1;
        Ok(())
    }
}

// ── mixer ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MixerState {
    failing: HashSet<u8>,
    volumes: HashMap<u8, i32>,
    equalizers: HashMap<u8, EqVector>,
    bands: Vec<(u8, u8, i32)>,
    persists: usize,
}

/// Volume defaults to 50, equalizer to flat.
#[derive(Default)]
pub struct FakeMixer {
    state: Mutex<MixerState>,
}

impl FakeMixer {
    pub fn fail_channel(&self, channel: u8) {
        self.state.lock().unwrap().failing.insert(channel);
    }

    pub fn set_volume_value(&self, channel: u8, volume: i32) {
        self.state.lock().unwrap().volumes.insert(channel, volume);
    }

    /// Single-band writes as `(channel, band, value)`.
    pub fn bands(&self) -> Vec<(u8, u8, i32)> {
        self.state.lock().unwrap().bands.clone()
    }

    pub fn persists(&self) -> usize {
        self.state.lock().unwrap().persists
    }

    fn check(state: &MixerState, channel: u8) -> Result<(), CallError> {
        if state.failing.contains(&channel) {
            return Err(failed("amixer"));
        }
        Ok(())
    }
}

#[async_trait]
impl AudioMixer for FakeMixer {
    async fn get_volume(&self, channel: u8) -> Result<i32, CallError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, channel)?;
        Ok(state.volumes.get(&channel).copied().unwrap_or(50))
    }

    async fn set_volume(&self, channel: u8, volume: i32) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, channel)?;
        state.volumes.insert(channel, volume);
        Ok(())
    }

    async fn get_equalizer(&self, channel: u8) -> Result<EqVector, CallError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, channel)?;
        Ok(state
            .equalizers
            .get(&channel)
            .copied()
            .unwrap_or([66; BAND_COUNT]))
    }

    async fn set_equalizer_band(&self, channel: u8, band: u8, value: i32) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, channel)?;
        state.bands.push((channel, band, value));
        let mut eq = state
            .equalizers
            .get(&channel)
            .copied()
            .unwrap_or([66; BAND_COUNT]);
        eq[band as usize] = value;
        state.equalizers.insert(channel, eq);
        Ok(())
    }

    async fn set_equalizer_preset(
        &self,
        channel: u8,
        values: EqVector,
    ) -> Result<EqVector, CallError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, channel)?;
        state.equalizers.insert(channel, values);
        Ok(values)
    }

    async fn persist(&self) -> Result<(), CallError> {
        self.state.lock().unwrap().persists += 1;
        Ok(())
    }
}

// ── media server ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct MediaState {
    names: HashMap<u8, String>,
    power_offs: usize,
}

#[derive(Default)]
pub struct FakeMedia {
    state: Mutex<MediaState>,
}

impl FakeMedia {
    pub fn set_name(&self, channel: u8, name: &str) {
        self.state.lock().unwrap().names.insert(channel, name.to_string());
    }

    pub fn power_offs(&self) -> usize {
        self.state.lock().unwrap().power_offs
    }
}

#[async_trait]
impl MediaServerClient for FakeMedia {
    async fn get_player_name(&self, channel: u8) -> Result<Option<String>, CallError> {
        Ok(self.state.lock().unwrap().names.get(&channel).cloned())
    }

    async fn set_player_name(&self, channel: u8, name: &str) -> Result<(), CallError> {
        self.set_name(channel, name);
        Ok(())
    }

    async fn power_off_player(&self, _channel: u8) -> Result<(), CallError> {
        self.state.lock().unwrap().power_offs += 1;
        Ok(())
    }
}

pub struct FakeMediaFactory {
    media: Arc<FakeMedia>,
}

impl FakeMediaFactory {
    pub fn new(media: Arc<FakeMedia>) -> Self {
        Self { media }
    }
}

impl MediaServerFactory for FakeMediaFactory {
    fn connect(&self, _host: &str, _port: u16) -> Result<Arc<dyn MediaServerClient>, CallError> {
        Ok(self.media.clone())
    }
}

// ── backup / updater ──────────────────────────────────────────────────────────

#[derive(Default)]
struct BackupState {
    fail_copy: bool,
    copied: usize,
    deleted: usize,
}

#[derive(Default)]
pub struct FakeBackup {
    state: Mutex<BackupState>,
}

impl FakeBackup {
    pub fn fail_copy(&self) {
        self.state.lock().unwrap().fail_copy = true;
    }

    pub fn copied(&self) -> usize {
        self.state.lock().unwrap().copied
    }

    pub fn deleted(&self) -> usize {
        self.state.lock().unwrap().deleted
    }
}

#[async_trait]
impl BackupService for FakeBackup {
    async fn create_local(&self) -> Result<PathBuf, CallError> {
        Ok(PathBuf::from("/tmp/backup.tar.gz"))
    }

    async fn copy_to_remote(&self, _archive: &Path) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_copy {
            return Err(failed("scp"));
        }
        state.copied += 1;
        Ok(())
    }

    async fn delete_local(&self, _archive: &Path) -> Result<(), CallError> {
        self.state.lock().unwrap().deleted += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeUpdater {
    calls: Mutex<Vec<(u16, Option<String>)>>,
}

impl FakeUpdater {
    pub fn calls(&self) -> Vec<(u16, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn triggers(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl UpdateTrigger for FakeUpdater {
    async fn trigger(&self, port: u16, token: Option<&str>) -> Result<(), CallError> {
        self.calls
            .lock()
            .unwrap()
            .push((port, token.map(str::to_string)));
        Ok(())
    }
}
