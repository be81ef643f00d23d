use serde::{Deserialize, Serialize};

/// Still-image rendition sizes a user can request with `--size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum, Serialize, Deserialize)]
pub enum VersionSize {
    Original,
    Medium,
    Thumb,
    Adjusted,
    Alternative,
}

/// Video rendition sizes for the motion part of a live photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum LivePhotoSize {
    Original,
    Medium,
    Thumb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Domain {
    Com,
    Cn,
}

impl Domain {
    pub fn as_str(&self) -> &str {
        match self {
            Domain::Com => "com",
            Domain::Cn => "cn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// How existing files are identified and name collisions resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FileMatchPolicy {
    /// Compare by name, then append `-{size}` when two assets collide.
    #[value(name = "name-size-dedup-with-suffix")]
    NameSizeDedupWithSuffix,
    /// Every file carries a 7-char token derived from the asset id.
    #[value(name = "name-id7")]
    NameId7,
}

/// Which representation of a RAW+JPEG pair is labeled `original`.
#[allow(clippy::enum_variant_names)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RawTreatmentPolicy {
    #[value(name = "as-is")]
    AsIs,
    #[value(name = "original")]
    AsOriginal,
    #[value(name = "alternative")]
    AsAlternative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LivePhotoMovFilenamePolicy {
    Suffix,
    Original,
}

/// Sources a password may be acquired from, tried in the order given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PasswordProviderKind {
    Parameter,
    Keyring,
    Console,
    Webui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MfaProviderKind {
    Console,
    Webui,
}

impl LivePhotoSize {
    pub fn to_rendition_size(self) -> crate::photos::RenditionSize {
        use crate::photos::RenditionSize;
        match self {
            LivePhotoSize::Original => RenditionSize::LiveOriginal,
            LivePhotoSize::Medium => RenditionSize::LiveMedium,
            LivePhotoSize::Thumb => RenditionSize::LiveThumb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photos::RenditionSize;

    #[test]
    fn test_live_photo_size_to_rendition_size() {
        assert_eq!(
            LivePhotoSize::Original.to_rendition_size(),
            RenditionSize::LiveOriginal
        );
        assert_eq!(
            LivePhotoSize::Medium.to_rendition_size(),
            RenditionSize::LiveMedium
        );
        assert_eq!(
            LivePhotoSize::Thumb.to_rendition_size(),
            RenditionSize::LiveThumb
        );
    }

    #[test]
    fn test_domain_as_str() {
        assert_eq!(Domain::Com.as_str(), "com");
        assert_eq!(Domain::Cn.as_str(), "cn");
    }
}
