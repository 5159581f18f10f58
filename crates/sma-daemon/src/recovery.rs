//! USB-DAC recovery.
//!
//! When fewer DACs enumerate than expected, the monitor runs one recovery
//! sequence per tick:
//!
//! ```text
//!   1. snapshot & mute     mute lines that are ON → snapshot, then OFF
//!   2. PSU down            relay ON → snapshot, then OFF
//!   3. USB power cycle     power OFF, settle, ON, hub reset, settle
//!   4. PSU restore         relay ON again if it was, wait power-on delay
//!   5. mute restore        exactly the snapshot's mute lines back ON
//! ```
//!
//! Steps without a configured line are skipped. Steps 4 and 5 always run,
//! even when step 3 fails, so the amplifiers end in the state they started
//! in. The sequence runs to completion once started; cancellation is only
//! seen by the monitor between ticks.

use std::sync::Arc;
use std::time::Duration;

use sma_proto::keys;
use sma_proto::store::ConfigStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gpio::GpioService;
use crate::pollers::sleep_or_cancel;
use crate::power::{PowerService, UsbId};
use crate::publish;
use crate::session::Session;
use crate::supervisor::TaskName;

/// Lines and timings for one recovery run, read fresh from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub mute_lines: Vec<u32>,
    pub psu_line: Option<u32>,
    pub usb_power_line: Option<u32>,
    pub hub: Option<UsbId>,
    pub settle: Duration,
    pub power_on_delay: Duration,
}

/// Which lines were ON when the sequence began.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub muted: Vec<u32>,
    pub psu_was_on: bool,
}

pub struct RecoverySequencer<'a> {
    gpio: &'a dyn GpioService,
    power: &'a dyn PowerService,
}

impl<'a> RecoverySequencer<'a> {
    pub fn new(gpio: &'a dyn GpioService, power: &'a dyn PowerService) -> Self {
        Self { gpio, power }
    }

    pub async fn run(&self, plan: &RecoveryPlan) -> RecoverySnapshot {
        let mut snapshot = RecoverySnapshot::default();

        // 1. snapshot & mute
        for &line in &plan.mute_lines {
            match self.gpio.get(line).await {
                Ok(on) => {
                    if on {
                        snapshot.muted.push(line);
                    }
                    self.set(line, false, "mute").await;
                }
                // Unknown state: leave the line alone so the restore stays exact.
                Err(e) => warn!("recovery: read mute pin {}: {}", line, e),
            }
        }

        // 2. PSU down
        if let Some(line) = plan.psu_line {
            match self.gpio.get(line).await {
                Ok(on) => {
                    snapshot.psu_was_on = on;
                    self.set(line, false, "PSU relay").await;
                }
                Err(e) => warn!("recovery: read PSU relay pin {}: {}", line, e),
            }
        }

        // 3. USB power cycle
        if let Some(line) = plan.usb_power_line {
            self.set(line, false, "USB power").await;
            tokio::time::sleep(plan.settle).await;
            self.set(line, true, "USB power").await;
            if let Some(hub) = plan.hub {
                if let Err(e) = self.power.reset_usb_device(hub).await {
                    warn!("recovery: reset hub {}: {}", hub, e);
                }
            }
            tokio::time::sleep(plan.settle).await;
        }

        // 4. PSU restore
        if let (Some(line), true) = (plan.psu_line, snapshot.psu_was_on) {
            self.set(line, true, "PSU relay").await;
            tokio::time::sleep(plan.power_on_delay).await;
        }

        // 5. mute restore
        for &line in &snapshot.muted {
            self.set(line, true, "mute").await;
        }

        snapshot
    }

    async fn set(&self, line: u32, value: bool, what: &str) {
        if let Err(e) = self.gpio.set(line, value).await {
            error!("recovery: {} pin {} -> {}: {}", what, line, value, e);
        }
    }
}

/// Watches DAC enumeration and runs the sequencer when DACs are missing.
pub struct DacMonitor {
    session: Session,
    gpio: Arc<dyn GpioService>,
    power: Arc<dyn PowerService>,
    store: Arc<dyn ConfigStore>,
}

impl DacMonitor {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
            gpio: session.services.gpio.clone(),
            power: session.services.power.clone(),
            store: session.services.store.clone(),
        }
    }

    fn dac_id(&self) -> Option<UsbId> {
        parse_usb_id(&self.session.device.config.dac.usb_id)
    }

    pub async fn plan(&self) -> RecoveryPlan {
        let dac = &self.session.device.config.dac;
        let store = self.store.as_ref();
        let power_on_delay = store
            .read_parsed::<u64>(keys::PSU_POWER_ON_DELAY)
            .unwrap_or(dac.power_on_delay_secs);
        let mute_lines = self
            .session
            .device
            .channels
            .mute_lines()
            .await
            .into_iter()
            .map(|(_, line)| line)
            .collect();
        RecoveryPlan {
            mute_lines,
            psu_line: store.read_parsed(keys::GPIO_PSU_RELAY),
            usb_power_line: store.read_parsed(keys::GPIO_USB_POWER),
            hub: parse_usb_id(&dac.hub_usb_id),
            settle: Duration::from_secs(dac.settle_secs),
            power_on_delay: Duration::from_secs(power_on_delay),
        }
    }

    /// One presence check, recovering when DACs are missing. Returns true
    /// when a recovery ran.
    pub async fn check(&self, powered: &mut Option<u32>) -> bool {
        let usb_line = match self.store.read_parsed::<u32>(keys::GPIO_USB_POWER) {
            Some(line) => line,
            None => {
                debug!("{}: no USB power line configured", TaskName::DacMonitor);
                return false;
            }
        };
        if *powered != Some(usb_line) {
            self.ensure_powered(usb_line).await;
            *powered = Some(usb_line);
        }

        let dac = match self.dac_id() {
            Some(id) => id,
            None => return false,
        };
        let expected = self.session.device.config.dac.expected;
        let present = match self.power.usb_devices_present(dac).await {
            Ok(n) => n,
            Err(e) => {
                warn!("{}: {}", TaskName::DacMonitor, e);
                return false;
            }
        };
        if present >= expected {
            return false;
        }

        warn!(
            "{}: {} of {} DACs ({}) present, recovering",
            TaskName::DacMonitor,
            present,
            expected,
            dac
        );
        let plan = self.plan().await;
        let snapshot = RecoverySequencer::new(self.gpio.as_ref(), self.power.as_ref())
            .run(&plan)
            .await;
        info!(
            "{}: recovery done, restored {} mute lines, PSU {}",
            TaskName::DacMonitor,
            snapshot.muted.len(),
            if snapshot.psu_was_on { "on" } else { "untouched" }
        );
        // Mixer controls come back with the devices.
        publish::publish_mixer_state(&self.session).await;
        true
    }

    async fn ensure_powered(&self, line: u32) {
        match self.gpio.get(line).await {
            Ok(true) => {}
            Ok(false) => {
                info!("{}: powering USB pin {}", TaskName::DacMonitor, line);
                if let Err(e) = self.gpio.set(line, true).await {
                    warn!("{}: {}", TaskName::DacMonitor, e);
                }
            }
            Err(e) => warn!("{}: USB power pin {}: {}", TaskName::DacMonitor, line, e),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) {
        let interval = Duration::from_secs(self.session.device.config.poll.dac_secs);
        let mut powered = None;
        loop {
            self.check(&mut powered).await;
            if sleep_or_cancel(cancel, interval).await {
                return;
            }
        }
    }
}

fn parse_usb_id(raw: &str) -> Option<UsbId> {
    match raw.parse() {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("{}: bad USB id: {}", TaskName::DacMonitor, e);
            None
        }
    }
}
