//! GPIO lines through the libgpiod D-Bus manager (`io.gpiod1`).
//!
//! Lines are addressed by physical header pin (1-40) everywhere above this
//! module; the BCM offset mapping lives here only.

use std::collections::HashMap;

use async_trait::async_trait;
use sma_proto::keys;
use sma_proto::store::ConfigStore;
use tracing::{debug, info, warn};
use zbus::proxy;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{OwnedObjectPath, Value};

use crate::dbus::SystemBus;
use crate::error::CallError;

const CHIP_PATH: &str = "/io/gpiod1/chips/gpiochip0";
const CONSUMER: &str = "sma-supervisor";

/// Physical header pin → BCM line offset.
const BOARD_MAP: [(u32, u32); 26] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

pub fn board_to_offset(pin: u32) -> Option<u32> {
    BOARD_MAP
        .iter()
        .find(|(board, _)| *board == pin)
        .map(|(_, offset)| *offset)
}

/// Line offsets and their settings, plus output values in offset order:
/// the `(a(aua{sv})ai)` line config of `RequestLines`.
type LineConfig<'a> = (Vec<(Vec<u32>, HashMap<&'a str, Value<'a>>)>, Vec<i32>);

#[proxy(
    interface = "io.gpiod1.Chip",
    default_service = "io.gpiod1",
    default_path = "/io/gpiod1/chips/gpiochip0"
)]
trait Chip {
    fn request_lines(
        &self,
        line_config: &LineConfig<'_>,
        request_config: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(interface = "io.gpiod1.Line", default_service = "io.gpiod1")]
trait Line {
    #[zbus(property)]
    fn managed(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn request_path(&self) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(interface = "io.gpiod1.Request", default_service = "io.gpiod1")]
trait Request {
    fn get_values(&self, offsets: &[u32]) -> zbus::Result<Vec<i32>>;

    fn set_values(&self, values: HashMap<u32, i32>) -> zbus::Result<()>;
}

#[async_trait]
pub trait GpioService: Send + Sync {
    /// Request the line as an output unless another request already
    /// manages it. `initial` is the value driven on request.
    async fn init(&self, line: u32, active_low: bool, initial: Option<bool>)
        -> Result<(), CallError>;
    async fn get(&self, line: u32) -> Result<bool, CallError>;
    async fn set(&self, line: u32, value: bool) -> Result<(), CallError>;
}

/// Client for the gpio-manager daemon.
pub struct GpiodBus {
    bus: SystemBus,
}

impl GpiodBus {
    pub fn new(bus: SystemBus) -> Self {
        Self { bus }
    }

    fn offset(pin: u32) -> Result<u32, CallError> {
        board_to_offset(pin)
            .ok_or_else(|| CallError::parse("gpio", format!("pin {} is not a GPIO line", pin)))
    }

    async fn line(&self, offset: u32) -> Result<LineProxy<'static>, CallError> {
        let conn = self.bus.connection().await?;
        let path = format!("{}/line{}", CHIP_PATH, offset);
        self.bus
            .call("io.gpiod1 line", async {
                LineProxy::builder(&conn)
                    .path(path)?
                    .cache_properties(CacheProperties::No)
                    .build()
                    .await
            })
            .await
    }

    /// The request holding `offset`.
    async fn request(&self, offset: u32) -> Result<RequestProxy<'static>, CallError> {
        let line = self.line(offset).await?;
        let path = self
            .bus
            .call("io.gpiod1 RequestPath", line.request_path())
            .await?;
        if path.as_str() == "/" {
            return Err(CallError::parse("gpio", format!("line {} is not requested", offset)));
        }
        let conn = self.bus.connection().await?;
        self.bus
            .call("io.gpiod1 request", async {
                RequestProxy::builder(&conn)
                    .path(path.to_string())?
                    .build()
                    .await
            })
            .await
    }
}

/// Settings for requesting one output line.
fn output_config(offset: u32, active_low: bool, initial: Option<bool>) -> LineConfig<'static> {
    let settings = HashMap::from([
        ("direction", Value::from("output")),
        ("active-low", Value::from(active_low)),
    ]);
    let values = initial.map(i32::from).into_iter().collect();
    (vec![(vec![offset], settings)], values)
}

#[async_trait]
impl GpioService for GpiodBus {
    async fn init(
        &self,
        line: u32,
        active_low: bool,
        initial: Option<bool>,
    ) -> Result<(), CallError> {
        let offset = Self::offset(line)?;
        let proxy = self.line(offset).await?;
        if self.bus.call("io.gpiod1 Managed", proxy.managed()).await? {
            debug!("gpio: pin {} (line {}) already managed", line, offset);
            return Ok(());
        }

        let conn = self.bus.connection().await?;
        let config = output_config(offset, active_low, initial);
        let options = HashMap::from([("consumer", Value::from(CONSUMER))]);
        let request = self
            .bus
            .call("io.gpiod1 RequestLines", async {
                ChipProxy::new(&conn)
                    .await?
                    .request_lines(&config, options)
                    .await
            })
            .await?;
        info!(
            "gpio: requested pin {} (line {}) as output{} in {}",
            line,
            offset,
            if active_low { ", active-low" } else { "" },
            request.as_str()
        );
        Ok(())
    }

    async fn get(&self, line: u32) -> Result<bool, CallError> {
        let offset = Self::offset(line)?;
        let request = self.request(offset).await?;
        let values = self
            .bus
            .call("io.gpiod1 GetValues", request.get_values(&[offset]))
            .await?;
        match values.as_slice() {
            [value] => Ok(*value != 0),
            other => Err(CallError::parse(
                "io.gpiod1 GetValues",
                format!("{} values for one line", other.len()),
            )),
        }
    }

    async fn set(&self, line: u32, value: bool) -> Result<(), CallError> {
        let offset = Self::offset(line)?;
        let request = self.request(offset).await?;
        self.bus
            .call(
                "io.gpiod1 SetValues",
                request.set_values(HashMap::from([(offset, i32::from(value))])),
            )
            .await?;
        debug!("gpio: pin {} -> {}", line, value);
        Ok(())
    }
}

/// Request every configured output line once at startup.
///
/// USB power starts ON, mute lines are active-low.
pub async fn init_lines(gpio: &dyn GpioService, store: &dyn ConfigStore, channels: u8) {
    if let Some(line) = store.read_parsed::<u32>(keys::GPIO_USB_POWER) {
        if let Err(e) = gpio.init(line, false, Some(true)).await {
            warn!("gpio: USB power pin {}: {}", line, e);
        }
    }
    if let Some(line) = store.read_parsed::<u32>(keys::GPIO_PSU_RELAY) {
        if let Err(e) = gpio.init(line, false, None).await {
            warn!("gpio: PSU relay pin {}: {}", line, e);
        }
    }
    for channel in 1..=channels {
        init_mute_line(gpio, store, channel).await;
    }
}

pub async fn init_mute_line(gpio: &dyn GpioService, store: &dyn ConfigStore, channel: u8) {
    if let Some(line) = store.read_parsed::<u32>(&keys::gpio_mute(channel)) {
        if let Err(e) = gpio.init(line, true, None).await {
            warn!("gpio: channel {} mute pin {}: {}", channel, line, e);
        }
    }
}
