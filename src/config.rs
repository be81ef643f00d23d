//! Resolved configuration for a run: one [`GlobalConfig`] plus one
//! [`AccountConfig`] per `--username` occurrence, after layering defaults.
//! All validation that maps to exit code 2 lives here.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};

use crate::delete::DeleteMode;
use crate::error::{SyncError, SyncResult};
use crate::notify::SmtpSettings;
use crate::types::{
    Domain, FileMatchPolicy, LivePhotoMovFilenamePolicy, LivePhotoSize, LogLevel, MfaProviderKind,
    PasswordProviderKind, RawTreatmentPolicy, VersionSize,
};

/// Options that apply to the whole process, not any single account.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub use_os_locale: bool,
    pub only_print_filenames: bool,
    pub log_level: LogLevel,
    pub domain: Domain,
    pub watch_with_interval: Option<u64>,
    pub password_providers: Vec<PasswordProviderKind>,
    pub mfa_provider: MfaProviderKind,
}

/// One account's fully resolved configuration.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub username: String,
    pub password: Option<String>,
    pub directory: Option<PathBuf>,
    pub cookie_directory: PathBuf,
    pub auth_only: bool,
    pub list_albums: bool,
    pub list_libraries: bool,
    pub albums: Vec<String>,
    pub library: String,
    pub sizes: Vec<VersionSize>,
    pub live_photo_size: LivePhotoSize,
    pub recent: Option<u32>,
    pub until_found: Option<u32>,
    pub skip_videos: bool,
    pub skip_photos: bool,
    pub skip_live_photos: bool,
    pub xmp_sidecar: bool,
    pub force_size: bool,
    pub auto_delete: bool,
    pub delete_after_download: bool,
    pub keep_icloud_recent_days: Option<i64>,
    pub folder_structure: String,
    pub set_exif_datetime: bool,
    pub dry_run: bool,
    pub keep_unicode_in_filenames: bool,
    pub live_photo_mov_filename_policy: LivePhotoMovFilenamePolicy,
    pub align_raw: RawTreatmentPolicy,
    pub file_match_policy: FileMatchPolicy,
    pub skip_created_before: Option<DateTime<Utc>>,
    pub skip_created_after: Option<DateTime<Utc>>,
    pub smtp: SmtpSettings,
    pub notification_script: Option<PathBuf>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl AccountConfig {
    /// The deletion behavior this configuration selected. Exclusivity of
    /// the flags is enforced by [`validate`].
    pub fn delete_mode(&self) -> DeleteMode {
        if let Some(days) = self.keep_icloud_recent_days {
            DeleteMode::KeepRecentDays(days)
        } else if self.delete_after_download {
            DeleteMode::DeleteAfterDownload
        } else if self.auto_delete {
            DeleteMode::AutoDelete
        } else {
            DeleteMode::Copy
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Parse a human-friendly date spec into a UTC timestamp.
///
/// Supports three forms:
/// - Relative interval: `"20d"` (20 days before now)
/// - ISO date: `"2025-01-02"` (midnight local time)
/// - ISO datetime: `"2025-01-02T14:30:00"` (local time)
pub fn parse_date_or_interval(s: &str) -> SyncResult<DateTime<Utc>> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            return Ok(Utc::now() - chrono::Duration::days(days));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            if let Some(dt) = naive_dt.and_local_timezone(Local).single() {
                return Ok(dt.with_timezone(&Utc));
            }
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        if let Some(local) = dt.and_local_timezone(Local).single() {
            return Ok(local.with_timezone(&Utc));
        }
    }
    Err(SyncError::Config(format!(
        "cannot parse '{s}' as a date; expected ISO date (2025-01-02), \
         datetime (2025-01-02T14:30:00), or interval (20d)"
    )))
}

/// Reject templates that chrono cannot format before any pass begins.
fn validate_folder_structure(template: &str) -> SyncResult<()> {
    if template.eq_ignore_ascii_case("none") {
        return Ok(());
    }
    let inner = template
        .strip_prefix("{:")
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(template);
    let probe = NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("fixed probe date is valid");
    let mut out = String::new();
    write!(out, "{}", probe.format(inner)).map_err(|_| {
        SyncError::Config(format!("--folder-structure template '{template}' is invalid"))
    })?;
    Ok(())
}

/// The full exit-code-2 constraint set, applied once before any work.
pub fn validate(global: &GlobalConfig, accounts: &[AccountConfig]) -> SyncResult<()> {
    if accounts.is_empty() {
        return Err(SyncError::Config(
            "at least one --username is required".to_string(),
        ));
    }

    let providers = &global.password_providers;
    if providers.is_empty() {
        return Err(SyncError::Config(
            "at least one --password-provider is required".to_string(),
        ));
    }
    if providers.contains(&PasswordProviderKind::Console)
        && providers.contains(&PasswordProviderKind::Webui)
    {
        return Err(SyncError::Config(
            "console and webui are not compatible in --password-provider".to_string(),
        ));
    }
    for interactive in [PasswordProviderKind::Console, PasswordProviderKind::Webui] {
        if providers.contains(&interactive) && *providers.last().expect("non-empty") != interactive
        {
            return Err(SyncError::Config(format!(
                "{interactive:?} must be the last --password-provider"
            )
            .to_lowercase()));
        }
    }

    for account in accounts {
        let who = &account.username;
        if account.skip_videos && account.skip_photos {
            return Err(SyncError::Config(format!(
                "only one of --skip-videos and --skip-photos can be used at a time ({who})"
            )));
        }
        if !account.list_albums
            && !account.list_libraries
            && !account.auth_only
            && account.directory.is_none()
        {
            return Err(SyncError::Config(format!(
                "--auth-only, --directory, --list-libraries or --list-albums is required ({who})"
            )));
        }
        if account.auto_delete && account.delete_after_download {
            return Err(SyncError::Config(format!(
                "--auto-delete and --delete-after-download are mutually exclusive ({who})"
            )));
        }
        if account.keep_icloud_recent_days.is_some() && account.delete_after_download {
            return Err(SyncError::Config(format!(
                "--keep-icloud-recent-days and --delete-after-download should not be used \
                 together ({who})"
            )));
        }
        if let Some(days) = account.keep_icloud_recent_days {
            if days < 0 {
                return Err(SyncError::Config(format!(
                    "--keep-icloud-recent-days must be non-negative ({who})"
                )));
            }
        }
        validate_folder_structure(&account.folder_structure)?;

        if global.watch_with_interval.is_some()
            && (account.list_albums || account.list_libraries || account.auth_only)
        {
            return Err(SyncError::Config(format!(
                "--watch-with-interval is not compatible with --list-albums, --list-libraries, \
                 and --auth-only ({who})"
            )));
        }
    }

    if global.watch_with_interval.is_some() && global.only_print_filenames {
        return Err(SyncError::Config(
            "--watch-with-interval is not compatible with --only-print-filenames".to_string(),
        ));
    }

    Ok(())
}
