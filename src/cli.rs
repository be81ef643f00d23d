//! Command-line parsing with layered per-account configuration.
//!
//! The argument list is split on `-u`/`--username`: everything before the
//! first occurrence supplies global options and the defaults block, each
//! later segment configures one account. The same username may appear
//! multiple times to produce distinct configurations (for example photos
//! and videos into different directories).
//!
//! ```text
//! icsync [GLOBAL] [COMMON] -u USER [COMMON] -u USER [COMMON] ...
//! ```

use clap::Parser;

use crate::config::{
    expand_tilde, parse_date_or_interval, AccountConfig, GlobalConfig,
};
use crate::error::{SyncError, SyncResult};
use crate::notify::SmtpSettings;
use crate::types::{
    Domain, FileMatchPolicy, LivePhotoMovFilenamePolicy, LivePhotoSize, LogLevel, MfaProviderKind,
    PasswordProviderKind, RawTreatmentPolicy, VersionSize,
};

/// All options of one argv segment. Global options are only honored in the
/// leading segment; account options layer over the defaults block.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "icsync",
    about = "Sync an iCloud photo library to a local directory",
    version,
    no_binary_name = true
)]
pub struct SegmentOpts {
    // ── Global options (leading segment only) ───────────────────────────
    /// Use the host OS locale and timezone to format dates
    #[arg(long)]
    pub use_os_locale: bool,

    /// Only print the paths of files that would be downloaded
    #[arg(long)]
    pub only_print_filenames: bool,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// iCloud root domain ('cn' for mainland China)
    #[arg(long, value_enum)]
    pub domain: Option<Domain>,

    /// Run in an endless cycle, waiting this many seconds between passes
    #[arg(long)]
    pub watch_with_interval: Option<u64>,

    /// Password providers to try, in the given order
    #[arg(long = "password-provider", value_enum)]
    pub password_providers: Vec<PasswordProviderKind>,

    /// Where to get the MFA code from
    #[arg(long, value_enum)]
    pub mfa_provider: Option<MfaProviderKind>,

    // ── Per-account options (defaults block + account segments) ─────────
    /// Local directory to download into
    #[arg(short = 'd', long)]
    pub directory: Option<String>,

    /// Create/update cookie and session tokens only
    #[arg(long)]
    pub auth_only: bool,

    /// Directory to store session cookies in
    #[arg(long)]
    pub cookie_directory: Option<String>,

    /// Rendition size(s) to download (repeatable)
    #[arg(long = "size", value_enum)]
    pub sizes: Vec<VersionSize>,

    /// Live Photo video size to download
    #[arg(long, value_enum)]
    pub live_photo_size: Option<LivePhotoSize>,

    /// Number of most recently added assets to consider
    #[arg(long)]
    pub recent: Option<u32>,

    /// Stop after this many consecutive previously downloaded assets
    #[arg(long)]
    pub until_found: Option<u32>,

    /// Album to download (repeatable; default: the whole collection)
    #[arg(short = 'a', long = "album")]
    pub albums: Vec<String>,

    /// List available albums and exit
    #[arg(short = 'l', long)]
    pub list_albums: bool,

    /// Library to download from
    #[arg(long)]
    pub library: Option<String>,

    /// List available libraries and exit
    #[arg(long)]
    pub list_libraries: bool,

    /// Don't download videos
    #[arg(long)]
    pub skip_videos: bool,

    /// Don't download photos
    #[arg(long)]
    pub skip_photos: bool,

    /// Don't download the video part of live photos
    #[arg(long)]
    pub skip_live_photos: bool,

    /// Export asset metadata as XMP sidecar files
    #[arg(long)]
    pub xmp_sidecar: bool,

    /// Only download the requested size(s), never fall back to original
    #[arg(long)]
    pub force_size: bool,

    /// Delete local files of assets found in Recently Deleted
    #[arg(long)]
    pub auto_delete: bool,

    /// Folder structure under the download directory ('none' to flatten)
    #[arg(long)]
    pub folder_structure: Option<String>,

    /// Write the DateTimeOriginal EXIF tag from the creation date if absent
    #[arg(long)]
    pub set_exif_datetime: bool,

    /// Deprecated: delete each asset from iCloud after downloading it
    #[arg(long)]
    pub delete_after_download: bool,

    /// Keep assets newer than this many days in iCloud, delete the rest
    /// remotely (0 deletes everything processed)
    #[arg(long)]
    pub keep_icloud_recent_days: Option<i64>,

    /// Do not modify the local system or iCloud
    #[arg(long)]
    pub dry_run: bool,

    /// Keep unicode characters in file names
    #[arg(long)]
    pub keep_unicode_in_filenames: bool,

    /// Naming of the video part of live photos
    #[arg(long, value_enum)]
    pub live_photo_mov_filename_policy: Option<LivePhotoMovFilenamePolicy>,

    /// Which representation of a RAW+JPEG pair counts as original
    #[arg(long, value_enum)]
    pub align_raw: Option<RawTreatmentPolicy>,

    /// How existing files are matched and collisions resolved
    #[arg(long, value_enum)]
    pub file_match_policy: Option<FileMatchPolicy>,

    /// Skip assets created before this ISO date or interval (e.g. 20d)
    #[arg(long)]
    pub skip_created_before: Option<String>,

    /// Skip assets created after this ISO date or interval
    #[arg(long)]
    pub skip_created_after: Option<String>,

    /// Max internal retries per download
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Initial retry delay in seconds
    #[arg(long)]
    pub retry_delay: Option<u64>,

    // ── Notifications ───────────────────────────────────────────────────
    /// SMTP username for re-auth notification mail
    #[arg(long)]
    pub smtp_username: Option<String>,

    /// SMTP password
    #[arg(long)]
    pub smtp_password: Option<String>,

    /// SMTP server host
    #[arg(long)]
    pub smtp_host: Option<String>,

    /// SMTP server port
    #[arg(long)]
    pub smtp_port: Option<u16>,

    /// Disable TLS for SMTP
    #[arg(long)]
    pub smtp_no_tls: bool,

    /// Address to send re-auth notifications to
    #[arg(long)]
    pub notification_email: Option<String>,

    /// From address for notification mail
    #[arg(long)]
    pub notification_email_from: Option<String>,

    /// External script to run when re-authentication is required
    #[arg(long)]
    pub notification_script: Option<String>,

    // ── Account identity (account segments only) ────────────────────────
    /// AppleID email address; starts a new configuration group
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// iCloud password (prefer the ICLOUD_PASSWORD environment variable;
    /// --password is visible in process listings)
    #[arg(short = 'p', long, env = "ICLOUD_PASSWORD")]
    pub password: Option<String>,
}

/// Split argv into the leading defaults segment and one segment per
/// `-u`/`--username` occurrence (the flag and its value stay with the
/// segment they start).
pub fn split_on_username(args: &[String]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut defaults: Vec<String> = Vec::new();
    let mut users: Vec<Vec<String>> = Vec::new();
    let mut current: Option<Vec<String>> = None;

    for arg in args {
        let starts_user = arg == "-u"
            || arg == "--username"
            || arg.starts_with("--username=")
            || (arg.starts_with("-u") && arg.len() > 2 && !arg.starts_with("--"));
        if starts_user {
            if let Some(segment) = current.take() {
                users.push(segment);
            }
            current = Some(vec![arg.clone()]);
        } else {
            match &mut current {
                Some(segment) => segment.push(arg.clone()),
                None => defaults.push(arg.clone()),
            }
        }
    }
    if let Some(segment) = current.take() {
        users.push(segment);
    }
    (defaults, users)
}

fn parse_segment(args: &[String]) -> SyncResult<SegmentOpts> {
    SegmentOpts::try_parse_from(args).map_err(|e| {
        // clap renders --help/--version through the same error path; let
        // those print normally.
        if e.use_stderr() {
            SyncError::Config(e.to_string())
        } else {
            e.exit()
        }
    })
}

fn or_default<T: Clone>(user: Option<T>, default: &Option<T>, fallback: T) -> T {
    user.or_else(|| default.clone()).unwrap_or(fallback)
}

/// Build one account's resolved configuration from the defaults block and
/// its own segment. Flags are OR-ed; values fall back to the defaults
/// block, then to the built-in default.
fn resolve_account(defaults: &SegmentOpts, user: SegmentOpts) -> SyncResult<AccountConfig> {
    let username = user
        .username
        .clone()
        .ok_or_else(|| SyncError::Config("missing username in configuration group".into()))?;

    let sizes = if !user.sizes.is_empty() {
        user.sizes.clone()
    } else if !defaults.sizes.is_empty() {
        defaults.sizes.clone()
    } else {
        vec![VersionSize::Original]
    };
    let albums = if !user.albums.is_empty() {
        user.albums.clone()
    } else {
        defaults.albums.clone()
    };

    let skip_created_before = user
        .skip_created_before
        .as_deref()
        .or(defaults.skip_created_before.as_deref())
        .map(parse_date_or_interval)
        .transpose()?;
    let skip_created_after = user
        .skip_created_after
        .as_deref()
        .or(defaults.skip_created_after.as_deref())
        .map(parse_date_or_interval)
        .transpose()?;

    let smtp = SmtpSettings {
        username: user.smtp_username.clone().or(defaults.smtp_username.clone()),
        password: user.smtp_password.clone().or(defaults.smtp_password.clone()),
        host: or_default(
            user.smtp_host.clone(),
            &defaults.smtp_host,
            "smtp.gmail.com".to_string(),
        ),
        port: or_default(user.smtp_port, &defaults.smtp_port, 587),
        no_tls: user.smtp_no_tls || defaults.smtp_no_tls,
        to: user
            .notification_email
            .clone()
            .or(defaults.notification_email.clone()),
        from: user
            .notification_email_from
            .clone()
            .or(defaults.notification_email_from.clone()),
    };

    Ok(AccountConfig {
        username,
        password: user.password.clone(),
        directory: user
            .directory
            .as_deref()
            .or(defaults.directory.as_deref())
            .map(expand_tilde),
        cookie_directory: expand_tilde(
            user.cookie_directory
                .as_deref()
                .or(defaults.cookie_directory.as_deref())
                .unwrap_or("~/.pyicloud"),
        ),
        auth_only: user.auth_only || defaults.auth_only,
        list_albums: user.list_albums || defaults.list_albums,
        list_libraries: user.list_libraries || defaults.list_libraries,
        albums,
        library: or_default(
            user.library.clone(),
            &defaults.library,
            "PrimarySync".to_string(),
        ),
        sizes,
        live_photo_size: or_default(
            user.live_photo_size,
            &defaults.live_photo_size,
            LivePhotoSize::Original,
        ),
        recent: user.recent.or(defaults.recent),
        until_found: user.until_found.or(defaults.until_found),
        skip_videos: user.skip_videos || defaults.skip_videos,
        skip_photos: user.skip_photos || defaults.skip_photos,
        skip_live_photos: user.skip_live_photos || defaults.skip_live_photos,
        xmp_sidecar: user.xmp_sidecar || defaults.xmp_sidecar,
        force_size: user.force_size || defaults.force_size,
        auto_delete: user.auto_delete || defaults.auto_delete,
        delete_after_download: user.delete_after_download || defaults.delete_after_download,
        keep_icloud_recent_days: user
            .keep_icloud_recent_days
            .or(defaults.keep_icloud_recent_days),
        folder_structure: or_default(
            user.folder_structure.clone(),
            &defaults.folder_structure,
            "{:%Y/%m/%d}".to_string(),
        ),
        set_exif_datetime: user.set_exif_datetime || defaults.set_exif_datetime,
        dry_run: user.dry_run || defaults.dry_run,
        keep_unicode_in_filenames: user.keep_unicode_in_filenames
            || defaults.keep_unicode_in_filenames,
        live_photo_mov_filename_policy: or_default(
            user.live_photo_mov_filename_policy,
            &defaults.live_photo_mov_filename_policy,
            LivePhotoMovFilenamePolicy::Suffix,
        ),
        align_raw: or_default(user.align_raw, &defaults.align_raw, RawTreatmentPolicy::AsIs),
        file_match_policy: or_default(
            user.file_match_policy,
            &defaults.file_match_policy,
            FileMatchPolicy::NameSizeDedupWithSuffix,
        ),
        skip_created_before,
        skip_created_after,
        smtp,
        notification_script: user
            .notification_script
            .as_deref()
            .or(defaults.notification_script.as_deref())
            .map(expand_tilde),
        max_retries: or_default(user.max_retries, &defaults.max_retries, 3),
        retry_delay_secs: or_default(user.retry_delay, &defaults.retry_delay, 5),
    })
}

/// Parse a full argument list (without the binary name) into the global
/// configuration and the per-account configurations.
pub fn parse_args(args: &[String]) -> SyncResult<(GlobalConfig, Vec<AccountConfig>)> {
    let (default_args, user_segments) = split_on_username(args);
    let defaults = parse_segment(&default_args)?;

    let global = GlobalConfig {
        use_os_locale: defaults.use_os_locale,
        only_print_filenames: defaults.only_print_filenames,
        log_level: defaults.log_level.unwrap_or(LogLevel::Info),
        domain: defaults.domain.unwrap_or(Domain::Com),
        watch_with_interval: defaults.watch_with_interval,
        password_providers: if defaults.password_providers.is_empty() {
            vec![
                PasswordProviderKind::Parameter,
                PasswordProviderKind::Keyring,
                PasswordProviderKind::Console,
            ]
        } else {
            defaults.password_providers.clone()
        },
        mfa_provider: defaults.mfa_provider.unwrap_or(MfaProviderKind::Console),
    };

    let mut accounts = Vec::with_capacity(user_segments.len());
    for segment in &user_segments {
        let user = parse_segment(segment)?;
        accounts.push(resolve_account(&defaults, user)?);
    }

    Ok((global, accounts))
}
