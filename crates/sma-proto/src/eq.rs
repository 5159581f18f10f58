//! 10-band equalizer: band labels as exposed by the ALSA equalizer plugin,
//! and the fixed presets.

pub const BAND_COUNT: usize = 10;

/// Lowest and highest accepted band value.
pub const BAND_MIN: i32 = 36;
pub const BAND_MAX: i32 = 95;

/// ALSA control names, indexed by band number.
pub const BANDS: [&str; BAND_COUNT] = [
    "00. 31 Hz",
    "01. 63 Hz",
    "02. 125 Hz",
    "03. 250 Hz",
    "04. 500 Hz",
    "05. 1 kHz",
    "06. 2 kHz",
    "07. 4 kHz",
    "08. 8 kHz",
    "09. 16 kHz",
];

pub type EqVector = [i32; BAND_COUNT];

pub const PRESETS: [(&str, EqVector); 5] = [
    ("flat", [66, 66, 66, 66, 66, 66, 66, 66, 66, 66]),
    ("classic", [78, 70, 67, 63, 58, 60, 64, 69, 78, 76]),
    ("rock", [76, 78, 75, 70, 67, 72, 72, 72, 69, 69]),
    ("loud", [76, 76, 73, 67, 67, 67, 67, 55, 75, 76]),
    ("pop", [79, 75, 70, 67, 64, 72, 70, 73, 76, 79]),
];

pub fn preset(name: &str) -> Option<EqVector> {
    PRESETS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, values)| *values)
}

pub fn band_label(band: u8) -> Option<&'static str> {
    BANDS.get(band as usize).copied()
}
