//! Perceptual palette harmonisation.
//!
//! Extracted album-art colours are blended against the fixed base palette in
//! Oklab, so a 50% blend looks half-way to the eye rather than half-way in
//! sRGB byte values.

use std::{fmt, str::FromStr, sync::Arc};

use arc_swap::ArcSwap;
use palette::{FromColor, LinSrgb, Mix, Oklab, Srgb};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{BasePalette, ColorConfig},
    MusicSyncError, Result,
};

/// 8-bit sRGB colour, serialised as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Converts into Oklab coordinates.
    pub fn to_oklab(self) -> Oklab {
        let srgb: Srgb<f32> = Srgb::new(self.r, self.g, self.b).into_format();
        let linear: LinSrgb = srgb.into_linear();
        Oklab::from_color(linear)
    }

    /// Converts back from Oklab, clamping out-of-gamut results.
    pub fn from_oklab(lab: Oklab) -> Self {
        let linear = LinSrgb::from_color(lab);
        let srgb: Srgb<f32> = Srgb::from_linear(linear);
        let bytes: Srgb<u8> = srgb.into_format();
        Self::new(bytes.red, bytes.green, bytes.blue)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Rgb {
    type Err = MusicSyncError;

    /// Accepts `#rrggbb`, `rrggbb` and the short `#rgb` form.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches('#');
        let invalid = || MusicSyncError::msg(format!("`{s}` is not a hex colour"));

        let expanded: String = match digits.len() {
            3 => digits.chars().flat_map(|c| [c, c]).collect(),
            6 => digits.to_string(),
            _ => return Err(invalid()),
        };
        let channel = |range: std::ops::Range<usize>| {
            expanded
                .get(range)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(invalid)
        };

        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = MusicSyncError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_hex()
    }
}

/// Role an extracted colour plays in the album art.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColorRole {
    Vibrant,
    DarkVibrant,
    LightVibrant,
    Prominent,
    Desaturated,
}

/// A named colour produced by album-art extraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorSample {
    pub role: ColorRole,
    pub rgb: Rgb,
}

impl ColorSample {
    pub fn new(role: ColorRole, rgb: Rgb) -> Self {
        Self { role, rgb }
    }
}

/// Oklab coordinates in a serialisable form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabCoords {
    pub l: f32,
    pub a: f32,
    pub b: f32,
}

impl From<Oklab> for LabCoords {
    fn from(lab: Oklab) -> Self {
        Self {
            l: lab.l,
            a: lab.a,
            b: lab.b,
        }
    }
}

/// One palette slot: display colour plus its perceptual coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaletteColor {
    pub rgb: Rgb,
    pub lab: LabCoords,
}

impl PaletteColor {
    pub fn from_rgb(rgb: Rgb) -> Self {
        Self {
            rgb,
            lab: rgb.to_oklab().into(),
        }
    }

    /// Stores the colour that `lab` actually renders as, so `rgb` and `lab`
    /// always agree.
    fn from_oklab(lab: Oklab) -> Self {
        Self::from_rgb(Rgb::from_oklab(lab))
    }

    pub fn rgb_hex(&self) -> String {
        self.rgb.to_hex()
    }
}

/// Complete palette published to the coordinator and the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarmonizedPalette {
    pub primary: PaletteColor,
    pub secondary: PaletteColor,
    pub accent: PaletteColor,
    pub shadow: PaletteColor,
    pub highlight: PaletteColor,
    /// `false` when this is the untouched base palette.
    pub blended: bool,
}

impl HarmonizedPalette {
    pub fn from_base(base: &BasePalette) -> Self {
        Self {
            primary: PaletteColor::from_rgb(base.primary),
            secondary: PaletteColor::from_rgb(base.secondary),
            accent: PaletteColor::from_rgb(base.accent),
            shadow: PaletteColor::from_rgb(base.shadow),
            highlight: PaletteColor::from_rgb(base.highlight),
            blended: false,
        }
    }

    /// Warmth of the primary colour in [0, 1], read off the Oklab blue-yellow
    /// axis.
    pub fn warmth(&self) -> f32 {
        ((self.primary.lab.b + 0.15) / 0.3).clamp(0.0, 1.0)
    }
}

/// Blends extracted colours into the base palette and publishes the result.
pub struct ColorHarmonyEngine {
    config: ColorConfig,
    base: BasePalette,
    current: ArcSwap<HarmonizedPalette>,
}

impl ColorHarmonyEngine {
    /// Fails only when no base palette is configured.
    pub fn new(config: ColorConfig) -> Result<Self> {
        let base = config
            .base_palette
            .clone()
            .ok_or_else(|| MusicSyncError::config("no base palette configured"))?;
        let current = ArcSwap::from_pointee(HarmonizedPalette::from_base(&base));
        Ok(Self {
            config,
            base,
            current,
        })
    }

    pub fn base(&self) -> &BasePalette {
        &self.base
    }

    pub fn intensity(&self) -> f32 {
        self.config.harmonic_intensity
    }

    /// Sets the blend weight used by later harmonisations.
    pub fn set_intensity(&mut self, intensity: f32) {
        self.config.harmonic_intensity = intensity.clamp(0.0, 1.0);
    }

    /// The most recently published palette.
    pub fn current(&self) -> Arc<HarmonizedPalette> {
        self.current.load_full()
    }

    /// Harmonises `samples` and atomically replaces the published palette.
    pub fn publish(&self, samples: &[ColorSample]) -> Arc<HarmonizedPalette> {
        let palette = Arc::new(self.harmonize(samples));
        self.current.store(Arc::clone(&palette));
        debug!(primary = %palette.primary.rgb, blended = palette.blended, "palette published");
        palette
    }

    /// Publishes the pure base palette.
    pub fn reset_to_base(&self) -> Arc<HarmonizedPalette> {
        let palette = Arc::new(HarmonizedPalette::from_base(&self.base));
        self.current.store(Arc::clone(&palette));
        palette
    }

    /// Computes a palette without publishing it. Never fails: with no usable
    /// samples the base palette comes back unchanged.
    pub fn harmonize(&self, samples: &[ColorSample]) -> HarmonizedPalette {
        if samples.is_empty() {
            return HarmonizedPalette::from_base(&self.base);
        }

        let find = |role: ColorRole| {
            samples
                .iter()
                .find(|sample| sample.role == role)
                .map(|sample| sample.rgb)
        };
        let source = find(ColorRole::Vibrant)
            .or_else(|| find(ColorRole::Prominent))
            .or_else(|| find(ColorRole::Desaturated))
            .unwrap_or(self.config.safe_default);
        let secondary_source = find(ColorRole::DarkVibrant)
            .or_else(|| find(ColorRole::LightVibrant))
            .unwrap_or(source);
        let accent_source = find(ColorRole::LightVibrant).unwrap_or(source);

        let weight = self.config.harmonic_intensity.clamp(0.0, 1.0);
        let blend = |base: Rgb, extracted: Rgb| base.to_oklab().mix(extracted.to_oklab(), weight);

        let primary = blend(self.base.primary, source);
        let secondary = blend(self.base.secondary, secondary_source);
        let accent = blend(self.base.accent, accent_source);

        HarmonizedPalette {
            primary: PaletteColor::from_oklab(primary),
            secondary: PaletteColor::from_oklab(secondary),
            accent: PaletteColor::from_oklab(accent),
            shadow: PaletteColor::from_oklab(self.shadow_of(primary)),
            highlight: PaletteColor::from_oklab(self.highlight_of(primary)),
            blended: true,
        }
    }

    /// Darker variant of `color`. Chroma shrinks with lightness so the shadow
    /// does not oversaturate.
    fn shadow_of(&self, color: Oklab) -> Oklab {
        let factor = self.config.shadow_lightness_factor.clamp(0.4, 0.6);
        let chroma = self.config.shadow_chroma_factor;
        Oklab::new(color.l * factor, color.a * chroma, color.b * chroma)
    }

    fn highlight_of(&self, color: Oklab) -> Oklab {
        let ceiling = self.config.highlight_lightness_ceiling.clamp(0.0, 1.0);
        let lift = self.config.highlight_lift.clamp(0.0, 1.0);
        let l = if color.l < ceiling {
            color.l + (ceiling - color.l) * lift
        } else {
            color.l
        };
        let chroma = self.config.highlight_chroma_factor;
        Oklab::new(l, color.a * chroma, color.b * chroma)
    }
}

impl fmt::Debug for ColorHarmonyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColorHarmonyEngine")
            .field("intensity", &self.config.harmonic_intensity)
            .field("base", &self.base)
            .finish()
    }
}
