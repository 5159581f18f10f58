//! Host power (logind) and USB device presence/reset.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{debug, info};
use zbus::proxy;

use crate::dbus::SystemBus;
use crate::error::CallError;
use crate::process::Runner;

#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait Login1Manager {
    fn power_off(&self, interactive: bool) -> zbus::Result<()>;

    fn reboot(&self, interactive: bool) -> zbus::Result<()>;
}

/// USB `vendor:product` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, product) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected vendor:product, got {:?}", s))?;
        let parse = |h: &str| u16::from_str_radix(h, 16).map_err(|e| format!("{:?}: {}", h, e));
        Ok(Self {
            vendor: parse(vendor)?,
            product: parse(product)?,
        })
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

#[async_trait]
pub trait PowerService: Send + Sync {
    async fn power_off(&self) -> Result<(), CallError>;
    async fn reboot(&self) -> Result<(), CallError>;
    async fn usb_devices_present(&self, id: UsbId) -> Result<usize, CallError>;
    async fn reset_usb_device(&self, id: UsbId) -> Result<(), CallError>;
}

pub struct SystemPower {
    runner: Runner,
    bus: SystemBus,
}

impl SystemPower {
    pub fn new(runner: Runner, bus: SystemBus) -> Self {
        Self { runner, bus }
    }

    async fn manager(&self) -> Result<Login1ManagerProxy<'static>, CallError> {
        let conn = self.bus.connection().await?;
        self.bus
            .call("login1", Login1ManagerProxy::new(&conn))
            .await
    }
}

#[async_trait]
impl PowerService for SystemPower {
    async fn power_off(&self) -> Result<(), CallError> {
        info!("power: powering off host");
        let manager = self.manager().await?;
        self.bus.call("login1 PowerOff", manager.power_off(true)).await
    }

    async fn reboot(&self) -> Result<(), CallError> {
        info!("power: rebooting host");
        let manager = self.manager().await?;
        self.bus.call("login1 Reboot", manager.reboot(true)).await
    }

    async fn usb_devices_present(&self, id: UsbId) -> Result<usize, CallError> {
        let id_s = id.to_string();
        let (status, out) = self.runner.run_status("lsusb", &["-d", id_s.as_str()]).await?;
        // lsusb exits 1 when nothing matches
        match status {
            0 => Ok(count_devices(&out.stdout)),
            1 if out.stdout.trim().is_empty() => Ok(0),
            _ => Err(CallError::Exit {
                program: "lsusb".to_string(),
                status,
                stderr: out.stderr.trim().to_string(),
            }),
        }
    }

    async fn reset_usb_device(&self, id: UsbId) -> Result<(), CallError> {
        let id_s = id.to_string();
        let out = self.runner.run("usbreset", &[id_s.as_str()]).await?;
        debug!("power: usbreset {}: {}", id, out.stdout.trim());
        Ok(())
    }
}

fn count_devices(lsusb: &str) -> usize {
    lsusb.lines().filter(|l| l.starts_with("Bus ")).count()
}
