//! Names of the values kept in the compose `.env` file.

pub const LMS_HOST: &str = "LMS_HOST";
pub const MQTT_HOST: &str = "MQTT_HOST";
pub const MQTT_USER: &str = "MQTT_USER";
pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
pub const HASS_HOST: &str = "HASS_HOST";
pub const HASS_BEARER: &str = "HASS_BEARER";

pub const BACKUP_SSH_HOST: &str = "BACKUP_SSH_HOST";
pub const BACKUP_SSH_PORT: &str = "BACKUP_SSH_PORT";
pub const BACKUP_SSH_USER: &str = "BACKUP_SSH_USER";
pub const BACKUP_SSH_PASSWORD: &str = "BACKUP_SSH_PASSWORD";
pub const BACKUP_SSH_FOLDER: &str = "BACKUP_SSH_FOLDER";

pub const GPIO_PSU_RELAY: &str = "GPIO_PSU_RELAY";
pub const PSU_POWER_ON_DELAY: &str = "PSU_POWER_ON_DELAY";
pub const PSU_POWER_DOWN_DELAY: &str = "PSU_POWER_DOWN_DELAY";
/// Raw `;`-separated mute line list as last entered by the user.
pub const GPIO_MUTE_LIST: &str = "GPIO_PSU_RELAY_OFF_ON_AMP_SHUTDOWN";
pub const GPIO_USB_POWER: &str = "GPIO_USB_POWER";

pub const WATCHTOWER_SUPERVISOR_PORT: &str = "WATCHTOWER_SUPERVISOR_PORT";
pub const WATCHTOWER_SQUEEZELITE_PORT: &str = "WATCHTOWER_SQUEEZELITE_PORT";
pub const WATCHTOWER_API_TOKEN: &str = "WATCHTOWER_API_TOKEN";

pub fn gpio_mute(channel: u8) -> String {
    format!("GPIO_CH{}_MUTE", channel)
}

pub fn gpio_sps(channel: u8) -> String {
    format!("GPIO_CH{}_SPS", channel)
}

pub fn hass_switch(channel: u8) -> String {
    format!("HASS_SWITCH_CH{}", channel)
}

pub fn output(channel: u8) -> String {
    format!("OUTPUT_CH{}", channel)
}
