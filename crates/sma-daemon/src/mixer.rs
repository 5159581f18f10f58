//! Per-channel volume and equalizer through `amixer`, persisted with
//! `alsactl store`.

use async_trait::async_trait;
use regex::Regex;
use sma_proto::config::MixerConfig;
use sma_proto::eq::{self, EqVector, BAND_COUNT};

use crate::error::CallError;
use crate::process::Runner;

#[async_trait]
pub trait AudioMixer: Send + Sync {
    async fn get_volume(&self, channel: u8) -> Result<i32, CallError>;
    async fn set_volume(&self, channel: u8, volume: i32) -> Result<(), CallError>;
    async fn get_equalizer(&self, channel: u8) -> Result<EqVector, CallError>;
    async fn set_equalizer_band(&self, channel: u8, band: u8, value: i32) -> Result<(), CallError>;
    /// Apply all bands and return the values read back from the device.
    async fn set_equalizer_preset(&self, channel: u8, values: EqVector)
        -> Result<EqVector, CallError>;
    async fn persist(&self) -> Result<(), CallError>;
}

pub struct AlsaMixer {
    runner: Runner,
    config: MixerConfig,
    percent: Regex,
    raw: Regex,
}

impl AlsaMixer {
    pub fn new(runner: Runner, config: MixerConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            runner,
            config,
            percent: Regex::new(r"\[(\d+)%\]")?,
            raw: Regex::new(r": Playback (\d+)")?,
        })
    }

    fn card(&self, channel: u8) -> String {
        expand(&self.config.volume_card, channel)
    }

    fn eq_device(&self, channel: u8) -> String {
        expand(&self.config.equalizer_device, channel)
    }

    async fn get_band(&self, device: &str, band: u8) -> Result<i32, CallError> {
        let label = band_label(band)?;
        let out = self
            .runner
            .run("amixer", &["-D", device, "sget", label])
            .await?;
        first_capture(&self.raw, &out.stdout)
            .or_else(|| first_capture(&self.percent, &out.stdout))
            .ok_or_else(|| CallError::parse(format!("amixer sget {}", label), out.stdout.trim()))
    }
}

#[async_trait]
impl AudioMixer for AlsaMixer {
    async fn get_volume(&self, channel: u8) -> Result<i32, CallError> {
        let card = self.card(channel);
        let out = self
            .runner
            .run(
                "amixer",
                &["-c", card.as_str(), "sget", self.config.volume_control.as_str()],
            )
            .await?;
        first_capture(&self.percent, &out.stdout)
            .ok_or_else(|| CallError::parse(format!("amixer -c {}", card), out.stdout.trim()))
    }

    async fn set_volume(&self, channel: u8, volume: i32) -> Result<(), CallError> {
        let card = self.card(channel);
        let level = format!("{}%", volume.clamp(0, 100));
        self.runner
            .run(
                "amixer",
                &[
                    "-q",
                    "-c",
                    card.as_str(),
                    "sset",
                    self.config.volume_control.as_str(),
                    level.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_equalizer(&self, channel: u8) -> Result<EqVector, CallError> {
        let device = self.eq_device(channel);
        let mut values = [0; BAND_COUNT];
        for (band, value) in values.iter_mut().enumerate() {
            *value = self.get_band(&device, band as u8).await?;
        }
        Ok(values)
    }

    async fn set_equalizer_band(&self, channel: u8, band: u8, value: i32) -> Result<(), CallError> {
        let device = self.eq_device(channel);
        let label = band_label(band)?;
        let value = value.clamp(eq::BAND_MIN, eq::BAND_MAX).to_string();
        self.runner
            .run(
                "amixer",
                &["-q", "-D", device.as_str(), "sset", label, value.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn set_equalizer_preset(
        &self,
        channel: u8,
        values: EqVector,
    ) -> Result<EqVector, CallError> {
        for (band, value) in values.iter().enumerate() {
            self.set_equalizer_band(channel, band as u8, *value).await?;
        }
        self.get_equalizer(channel).await
    }

    async fn persist(&self) -> Result<(), CallError> {
        self.runner.run("alsactl", &["store"]).await?;
        Ok(())
    }
}

fn expand(template: &str, channel: u8) -> String {
    template.replace("{channel}", &channel.to_string())
}

fn band_label(band: u8) -> Result<&'static str, CallError> {
    eq::band_label(band).ok_or_else(|| CallError::parse("equalizer", format!("no band {}", band)))
}

fn first_capture(re: &Regex, text: &str) -> Option<i32> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mixer() -> AlsaMixer {
        AlsaMixer::new(Runner::new(Duration::from_secs(1)), MixerConfig::default()).unwrap()
    }

    #[test]
    fn expands_channel_templates() {
        let m = mixer();
        assert_eq!(m.card(3), "ch3");
        assert_eq!(m.eq_device(3), "ch3_equal");
    }

    #[test]
    fn parses_amixer_output() {
        let m = mixer();
        let volume = "Simple mixer control 'PCM',0\n  Capabilities: pvolume\n  \
                      Front Left: Playback 151 [59%] [-12.50dB] [on]\n";
        assert_eq!(first_capture(&m.percent, volume), Some(59));

        let band = "Simple mixer control '00. 31 Hz',0\n  Capabilities: volume\n  \
                    Front Left: Playback 66 [66%]\n  Front Right: Playback 66 [66%]\n";
        assert_eq!(first_capture(&m.raw, band), Some(66));
        assert_eq!(first_capture(&m.raw, "nothing here"), None);
    }
}
